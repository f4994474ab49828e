//! Metrics definitions for the server manager.

/// Metrics key counting snapshots written to object storage.
pub const METRICS_ID_MANAGER_SAVED_WRITTEN: &str = "vigil.manager.saved_actions.written";
/// Metrics key counting snapshots that fell back to the local directory.
pub const METRICS_ID_MANAGER_SAVED_FALLBACK: &str = "vigil.manager.saved_actions.fallback";
/// Metrics key counting completed file-ops passes.
pub const METRICS_ID_MANAGER_SNAPSHOTS_WRITTEN: &str = "vigil.manager.snapshots.written";

/// Describe all metrics used by the server manager.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_MANAGER_SAVED_WRITTEN,
        metrics::Unit::Count,
        "Saved-action snapshots written to object storage"
    );
    metrics::describe_counter!(
        METRICS_ID_MANAGER_SAVED_FALLBACK,
        metrics::Unit::Count,
        "Saved-action snapshots written to the local fallback directory"
    );
    metrics::describe_counter!(
        METRICS_ID_MANAGER_SNAPSHOTS_WRITTEN,
        metrics::Unit::Count,
        "Completed status-mirror passes"
    );
}
