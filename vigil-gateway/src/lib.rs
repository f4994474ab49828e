#![deny(missing_docs)]
//! The gateway: fan-in of long-lived client WebSocket sessions.
//!
//! Each session runs on its own task, owns its socket, and registers only an
//! outbound sender handle under its client name (see [`registry`]), so the
//! action consumer never touches a socket directly and no reference cycles
//! exist. Per inbound frame the gateway applies the admission sequence
//! (paused, blocked, availability, rate limit), off-loads the JPEG bytes to
//! object storage and publishes a pixel-free envelope to `clients_data`.
//! Actions coming back on `actions` are matched by client name and forwarded
//! over the right socket; a miss requeues the message because the client may
//! reconnect any moment.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ConnectInfo;
use axum::extract::FromRequestParts;
use axum::extract::ws::WebSocketUpgrade;
use axum::routing::any;
use tower_http::trace::TraceLayer;
use vigil_broker::{Broker as _, BrokerService, QueueSpec};
use vigil_common::users::UserDirectory;
use vigil_ratelimit::RateLimiter;
use vigil_status::StatusStoreService;
use vigil_storage::ObjectStoreService;
use vigil_types::queues;

pub mod actions;
pub mod config;
pub mod metrics;

mod errors;
mod registry;
mod session;

pub use registry::SessionRegistry;

/// Shared dependencies and limits of the gateway process.
#[derive(Clone)]
pub struct GatewayState {
    /// Queue broker.
    pub broker: BrokerService,
    /// Object store holding frame bytes.
    pub store: ObjectStoreService,
    /// Client-status snapshot store.
    pub status: StatusStoreService,
    /// Enrolment directory.
    pub users: Arc<UserDirectory>,
    /// Sliding-window admission.
    pub rate_limiter: Arc<RateLimiter>,
    /// Live sessions by client name.
    pub registry: SessionRegistry,
    /// Bounds simultaneous sessions to the profile's client capacity.
    pub session_permits: Arc<tokio::sync::Semaphore>,
    /// Per-message read timeout; firing it closes the session.
    pub message_timeout: Duration,
    /// Max accepted WebSocket message size.
    pub max_message_size: usize,
}

/// Declares the queues the gateway publishes to and consumes from.
pub async fn declare_topology(broker: &BrokerService) -> eyre::Result<()> {
    broker
        .declare_exchange(queues::EXCHANGE_CLIENTS_DATA)
        .await?;
    broker
        .declare_queue(QueueSpec::bound(
            queues::QUEUE_CLIENTS_DATA,
            queues::EXCHANGE_CLIENTS_DATA,
            queues::QUEUE_CLIENTS_DATA,
        ))
        .await?;
    broker
        .declare_queue(QueueSpec::plain(queues::QUEUE_ACTIONS))
        .await?;
    Ok(())
}

/// Creates the `Router` with the single `/ws` route.
///
/// Clients upgrade via the WebSocket upgrade protocol; both HTTP/1.1 and
/// HTTP/2.0 upgrades are accepted, hence `any`. A session permit is taken
/// before the upgrade; a full gateway answers 503 instead of queueing the
/// client into an unbounded backlog.
pub fn routes(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", any(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Like `Option<ConnectInfo<SocketAddr>>`, but `ConnectInfo` has no
/// `OptionalFromRequestParts` impl upstream, so this extracts the extension
/// directly and never rejects the request.
struct MaybeConnectInfo(Option<std::net::SocketAddr>);

impl<S> FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let info = ConnectInfo::<std::net::SocketAddr>::from_request_parts(parts, state)
            .await
            .ok();
        Ok(MaybeConnectInfo(info.map(|info| info.0)))
    }
}

async fn ws_handler(
    axum::extract::State(state): axum::extract::State<GatewayState>,
    ws: WebSocketUpgrade,
    connect_info: MaybeConnectInfo,
) -> axum::response::Response {
    session::upgrade(state, ws, connect_info.0)
}
