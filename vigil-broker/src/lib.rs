#![deny(missing_docs)]
//! Queue-broker capability for the vigil pipeline.
//!
//! Services talk to the broker exclusively through the [`Broker`] trait:
//! durable direct exchanges, durable queues (optionally bounded with a
//! drop-head overflow policy so the freshest frame always wins), publishes
//! with bounded retries, and subscriptions that hand out deliveries with an
//! explicit ack/requeue/discard decision.
//!
//! The production implementation is AMQP via `lapin` (see [`amqp`]); tests
//! use the in-memory broker from `vigil-test-utils`. Consumers are driven by
//! [`consume_each`], which wraps every handler with a catch-all so a single
//! bad message never tears the consumer down.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

pub mod amqp;
mod consume;

pub use consume::{HandlerError, consume_each};

/// Dynamic trait object for the broker capability.
///
/// Must be `Send + Sync` to be shared across tasks.
pub type BrokerService = Arc<dyn Broker + Send + Sync>;

/// A delivery handed to a consumer, boxed for trait-object use.
pub type BoxDelivery = Box<dyn Delivery + Send>;

/// A queue subscription, boxed for trait-object use.
pub type BoxSubscription = Box<dyn Subscription + Send>;

/// Errors surfaced by broker implementations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The underlying AMQP client failed.
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    /// The broker connection is gone and could not be re-established.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    /// A publish did not go through within the configured retries.
    #[error("publish to '{routing_key}' failed after {attempts} attempts: {last_error}")]
    PublishFailed {
        /// Routing key of the failed publish.
        routing_key: String,
        /// How many attempts were made.
        attempts: usize,
        /// The error of the last attempt.
        last_error: String,
    },
    /// The queue does not exist (in-memory implementation only).
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    /// A payload could not be serialized.
    #[error("cannot encode payload: {0}")]
    Encode(String),
    /// A payload could not be deserialized.
    #[error("cannot decode payload: {0}")]
    Decode(String),
}

/// Declaration parameters for one queue.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Exchange to bind to; `None` leaves the queue on the default exchange.
    pub exchange: Option<String>,
    /// Routing key for the binding; defaults to the queue name.
    pub routing_key: Option<String>,
    /// Bound on the queue length. When set, overflow drops the head so the
    /// freshest message wins.
    pub max_length: Option<u32>,
}

impl QueueSpec {
    /// A plain durable queue on the default exchange.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exchange: None,
            routing_key: None,
            max_length: None,
        }
    }

    /// Binds the queue to a direct exchange under the given routing key.
    pub fn bound(
        name: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            exchange: Some(exchange.into()),
            routing_key: Some(routing_key.into()),
            max_length: None,
        }
    }

    /// Caps the queue length with drop-head overflow.
    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// The broker capability.
#[async_trait]
pub trait Broker {
    /// Declares a durable direct exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Declares a durable queue (and its binding, if any).
    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), BrokerError>;

    /// Publishes a payload. An empty `exchange` routes directly to the queue
    /// named by `routing_key`. Retries are handled inside the
    /// implementation; an error means the message is lost.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Opens a subscription on the given queue.
    async fn subscribe(&self, queue: &str) -> Result<BoxSubscription, BrokerError>;
}

/// A stream of deliveries from one queue.
#[async_trait]
pub trait Subscription {
    /// Waits for the next delivery. `None` means the subscription ended.
    async fn next(&mut self) -> Option<Result<BoxDelivery, BrokerError>>;
}

/// One message taken from a queue, to be settled exactly once.
#[async_trait]
pub trait Delivery {
    /// The raw payload bytes.
    fn payload(&self) -> &[u8];

    /// Acknowledges the message.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Returns the message to the queue for redelivery.
    async fn requeue(self: Box<Self>) -> Result<(), BrokerError>;

    /// Drops the message without redelivery.
    async fn discard(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Publishes `message` as JSON.
pub async fn publish_json<T: Serialize>(
    broker: &BrokerService,
    exchange: &str,
    routing_key: &str,
    message: &T,
) -> Result<(), BrokerError> {
    let payload = serde_json::to_vec(message).map_err(|err| BrokerError::Encode(err.to_string()))?;
    broker.publish(exchange, routing_key, payload).await
}

/// Publishes `message` as CBOR (used for payloads embedding binary data).
pub async fn publish_cbor<T: Serialize>(
    broker: &BrokerService,
    exchange: &str,
    routing_key: &str,
    message: &T,
) -> Result<(), BrokerError> {
    let mut payload = Vec::new();
    ciborium::into_writer(message, &mut payload)
        .map_err(|err| BrokerError::Encode(err.to_string()))?;
    broker.publish(exchange, routing_key, payload).await
}

/// Decodes a JSON payload.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BrokerError> {
    serde_json::from_slice(payload).map_err(|err| BrokerError::Decode(err.to_string()))
}

/// Decodes a CBOR payload.
pub fn decode_cbor<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BrokerError> {
    ciborium::from_reader(payload).map_err(|err: ciborium::de::Error<std::io::Error>| {
        BrokerError::Decode(err.to_string())
    })
}
