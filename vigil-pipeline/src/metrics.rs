//! Metrics definitions for the pipeline worker.

/// Metrics key counting processed face-branch frames.
pub const METRICS_ID_PIPELINE_FACE_PROCESSED: &str = "vigil.pipeline.face.processed";
/// Metrics key counting failed face-branch frames.
pub const METRICS_ID_PIPELINE_FACE_FAILED: &str = "vigil.pipeline.face.failed";
/// Metrics key for the face-branch duration.
pub const METRICS_ID_PIPELINE_FACE_DURATION: &str = "vigil.pipeline.face.duration";
/// Metrics key counting processed phone-branch frames.
pub const METRICS_ID_PIPELINE_PHONE_PROCESSED: &str = "vigil.pipeline.phone.processed";
/// Metrics key counting failed phone-branch frames.
pub const METRICS_ID_PIPELINE_PHONE_FAILED: &str = "vigil.pipeline.phone.failed";
/// Metrics key for the phone-branch duration.
pub const METRICS_ID_PIPELINE_PHONE_DURATION: &str = "vigil.pipeline.phone.duration";

/// Describe all metrics used by the pipeline worker.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_PIPELINE_FACE_PROCESSED,
        metrics::Unit::Count,
        "Face-branch frames processed"
    );
    metrics::describe_counter!(
        METRICS_ID_PIPELINE_FACE_FAILED,
        metrics::Unit::Count,
        "Face-branch frames that ended in a failure verdict"
    );
    metrics::describe_histogram!(
        METRICS_ID_PIPELINE_FACE_DURATION,
        metrics::Unit::Milliseconds,
        "Face-branch processing duration"
    );
    metrics::describe_counter!(
        METRICS_ID_PIPELINE_PHONE_PROCESSED,
        metrics::Unit::Count,
        "Phone-branch frames processed"
    );
    metrics::describe_counter!(
        METRICS_ID_PIPELINE_PHONE_FAILED,
        metrics::Unit::Count,
        "Phone-branch frames that ended in a failure verdict"
    );
    metrics::describe_histogram!(
        METRICS_ID_PIPELINE_PHONE_DURATION,
        metrics::Unit::Milliseconds,
        "Phone-branch processing duration"
    );
}
