//! Metrics definitions for the gateway.

/// Metrics key for currently open WebSocket sessions.
pub const METRICS_ID_GATEWAY_SESSIONS_OPEN: &str = "vigil.gateway.sessions.open";
/// Metrics key counting frames accepted and enqueued.
pub const METRICS_ID_GATEWAY_FRAMES_ACCEPTED: &str = "vigil.gateway.frames.accepted";
/// Metrics key counting actions delivered over a socket.
pub const METRICS_ID_GATEWAY_ACTIONS_SENT: &str = "vigil.gateway.actions.sent";
/// Metrics key counting actions requeued because the socket was missing.
pub const METRICS_ID_GATEWAY_ACTIONS_REQUEUED: &str = "vigil.gateway.actions.requeued";

/// Describe all metrics used by the gateway.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_ID_GATEWAY_SESSIONS_OPEN,
        metrics::Unit::Count,
        "Currently open WebSocket sessions"
    );
    metrics::describe_counter!(
        METRICS_ID_GATEWAY_FRAMES_ACCEPTED,
        metrics::Unit::Count,
        "Frames accepted, persisted and enqueued"
    );
    metrics::describe_counter!(
        METRICS_ID_GATEWAY_ACTIONS_SENT,
        metrics::Unit::Count,
        "Actions delivered to clients"
    );
    metrics::describe_counter!(
        METRICS_ID_GATEWAY_ACTIONS_REQUEUED,
        metrics::Unit::Count,
        "Actions requeued because no session was live"
    );
}
