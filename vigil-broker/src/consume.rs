//! The consumer loop shared by every vigil service.

use tokio_util::sync::CancellationToken;

use crate::{Broker as _, BrokerError, BrokerService, Delivery as _, Subscription as _};

/// How a handler wants an unprocessable delivery settled.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The downstream dependency is temporarily missing; redeliver later.
    #[error("requeue: {0}")]
    Requeue(String),
    /// The message is bad and must not come back.
    #[error("discard: {0}")]
    Discard(String),
}

/// Drives a subscription on `queue` until the token is cancelled.
///
/// The handler receives the raw payload. `Ok` acks; [`HandlerError::Requeue`]
/// returns the message to the queue; [`HandlerError::Discard`] drops it. All
/// outcomes are logged; the loop never tears down because of a single
/// message. A closed subscription is an error so the hosting process can
/// restart the consumer (or shut down).
pub async fn consume_each<F, Fut>(
    broker: BrokerService,
    queue: &str,
    cancellation_token: CancellationToken,
    handler: F,
) -> Result<(), BrokerError>
where
    F: Fn(Vec<u8>) -> Fut,
    Fut: Future<Output = Result<(), HandlerError>>,
{
    let mut subscription = broker.subscribe(queue).await?;
    tracing::info!("consuming from '{queue}'");
    loop {
        let delivery = tokio::select! {
            delivery = subscription.next() => delivery,
            _ = cancellation_token.cancelled() => {
                tracing::info!("consumer for '{queue}' stopping");
                return Ok(());
            }
        };
        let delivery = match delivery {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                tracing::warn!("error on '{queue}' subscription: {err:?}");
                continue;
            }
            None => {
                return Err(BrokerError::ConnectionLost(format!(
                    "subscription on '{queue}' ended"
                )));
            }
        };
        match handler(delivery.payload().to_vec()).await {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    tracing::warn!("cannot ack message on '{queue}': {err:?}");
                }
            }
            Err(HandlerError::Requeue(why)) => {
                tracing::warn!("requeueing message on '{queue}': {why}");
                if let Err(err) = delivery.requeue().await {
                    tracing::warn!("cannot requeue message on '{queue}': {err:?}");
                }
            }
            Err(HandlerError::Discard(why)) => {
                tracing::warn!("discarding message on '{queue}': {why}");
                if let Err(err) = delivery.discard().await {
                    tracing::warn!("cannot discard message on '{queue}': {err:?}");
                }
            }
        }
    }
}
