//! The single consumer forwarding actions to their sockets.

use tokio_util::sync::CancellationToken;
use vigil_broker::{HandlerError, consume_each};
use vigil_types::messages::ActionMessage;
use vigil_types::queues;

use crate::registry::SendError;
use crate::{GatewayState, metrics};

/// Consumes `actions` and fans each message out to the right session.
///
/// A client without a live session may reconnect any moment, so its actions
/// are requeued instead of dropped.
pub async fn action_consumer_task(
    state: GatewayState,
    cancellation_token: CancellationToken,
) -> eyre::Result<()> {
    consume_each(
        state.broker.clone(),
        queues::QUEUE_ACTIONS,
        cancellation_token,
        |payload| deliver(&state, payload),
    )
    .await?;
    Ok(())
}

async fn deliver(state: &GatewayState, payload: Vec<u8>) -> Result<(), HandlerError> {
    let action: ActionMessage = vigil_broker::decode_json(&payload)
        .map_err(|err| HandlerError::Discard(format!("bad action message: {err}")))?;
    tracing::debug!(
        "[timing] client {}: send_time={}, finish_time={}, receive_time={}",
        action.client_name,
        action.send_time,
        action.finish_time,
        vigil_types::wall_clock_stamp(chrono::Local::now()),
    );
    let message =
        serde_json::to_string(&action).map_err(|err| HandlerError::Discard(err.to_string()))?;
    match state.registry.send_to(&action.client_name, message) {
        Ok(()) => Ok(()),
        Err(SendError::NotConnected) => {
            ::metrics::counter!(metrics::METRICS_ID_GATEWAY_ACTIONS_REQUEUED).increment(1);
            Err(HandlerError::Requeue(format!(
                "client {} not connected",
                action.client_name
            )))
        }
        Err(SendError::Gone) => {
            ::metrics::counter!(metrics::METRICS_ID_GATEWAY_ACTIONS_REQUEUED).increment(1);
            Err(HandlerError::Requeue(format!(
                "connection to {} closed mid-send",
                action.client_name
            )))
        }
    }
}
