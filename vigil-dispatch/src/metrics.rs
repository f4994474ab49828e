//! Metrics definitions for the dispatcher.

/// Metrics key counting routed envelopes, labelled by pipeline.
pub const METRICS_ID_DISPATCH_ROUTED: &str = "vigil.dispatch.routed";

/// Describe all metrics used by the dispatcher.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_DISPATCH_ROUTED,
        metrics::Unit::Count,
        "Number of envelopes routed, per pipeline"
    );
}
