//! Metrics definitions for the decision fuser.

/// Metrics key counting actions derived from face verdicts.
pub const METRICS_ID_FUSER_FACE_ACTIONS: &str = "vigil.fuser.face.actions";
/// Metrics key counting actions derived from phone verdicts.
pub const METRICS_ID_FUSER_PHONE_ACTIONS: &str = "vigil.fuser.phone.actions";
/// Metrics key counting published saved-action records.
pub const METRICS_ID_FUSER_SAVED_ACTIONS: &str = "vigil.fuser.saved_actions";

/// Describe all metrics used by the decision fuser.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_FUSER_FACE_ACTIONS,
        metrics::Unit::Count,
        "Actions derived from face verdicts"
    );
    metrics::describe_counter!(
        METRICS_ID_FUSER_PHONE_ACTIONS,
        metrics::Unit::Count,
        "Actions derived from phone verdicts"
    );
    metrics::describe_counter!(
        METRICS_ID_FUSER_SAVED_ACTIONS,
        metrics::Unit::Count,
        "Saved-action records published"
    );
}
