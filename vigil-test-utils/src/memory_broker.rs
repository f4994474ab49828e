//! In-memory [`Broker`] with the same topology semantics as the AMQP one:
//! direct exchanges, bound queues, drop-head overflow and requeue-to-front.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use vigil_broker::{
    BoxDelivery, BoxSubscription, Broker, BrokerError, Delivery, QueueSpec, Subscription,
};

#[derive(Default)]
struct QueueState {
    max_length: Option<u32>,
    messages: VecDeque<Vec<u8>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    // exchange -> [(routing_key, queue)]
    bindings: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
}

/// In-memory broker for tests.
#[derive(Default, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Number of messages currently waiting in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Pops the oldest message of `queue` and decodes it as JSON.
    pub fn take_json<T: DeserializeOwned>(&self, queue: &str) -> Option<T> {
        let payload = self.take_raw(queue)?;
        Some(serde_json::from_slice(&payload).expect("queued payload is valid JSON"))
    }

    /// Pops the oldest message of `queue` and decodes it as CBOR.
    pub fn take_cbor<T: DeserializeOwned>(&self, queue: &str) -> Option<T> {
        let payload = self.take_raw(queue)?;
        Some(ciborium::from_reader(payload.as_slice()).expect("queued payload is valid CBOR"))
    }

    /// Pops the oldest raw message of `queue`.
    pub fn take_raw(&self, queue: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get_mut(queue)?
            .messages
            .pop_front()
    }

    /// Waits until `queue` holds at least one message, then pops it as JSON.
    pub async fn wait_json<T: DeserializeOwned>(&self, queue: &str) -> T {
        loop {
            let notify = self.queue_notify(queue);
            if let Some(message) = self.take_json(queue) {
                return message;
            }
            notify.notified().await;
        }
    }

    /// Waits until `queue` holds at least one message, then pops it as CBOR.
    pub async fn wait_cbor<T: DeserializeOwned>(&self, queue: &str) -> T {
        loop {
            let notify = self.queue_notify(queue);
            if let Some(message) = self.take_cbor(queue) {
                return message;
            }
            notify.notified().await;
        }
    }

    fn queue_notify(&self, queue: &str) -> Arc<Notify> {
        let mut state = self.state.lock();
        Arc::clone(&state.queues.entry(queue.to_owned()).or_default().notify)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.state.lock().bindings.entry(name.to_owned()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let queue = state.queues.entry(spec.name.clone()).or_default();
        queue.max_length = spec.max_length;
        if let Some(exchange) = spec.exchange {
            let routing_key = spec.routing_key.unwrap_or_else(|| spec.name.clone());
            let bindings = state.bindings.entry(exchange).or_default();
            if !bindings.contains(&(routing_key.clone(), spec.name.clone())) {
                bindings.push((routing_key, spec.name));
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let targets: Vec<String> = if exchange.is_empty() {
            if !state.queues.contains_key(routing_key) {
                return Err(BrokerError::UnknownQueue(routing_key.to_owned()));
            }
            vec![routing_key.to_owned()]
        } else {
            state
                .bindings
                .get(exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(key, _)| key == routing_key)
                        .map(|(_, queue)| queue.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for target in targets {
            let Some(queue) = state.queues.get_mut(&target) else {
                continue;
            };
            if let Some(max_length) = queue.max_length
                && queue.messages.len() >= max_length as usize
            {
                // drop-head: the freshest frame wins
                queue.messages.pop_front();
            }
            queue.messages.push_back(payload.clone());
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<BoxSubscription, BrokerError> {
        if !self.state.lock().queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_owned()));
        }
        Ok(Box::new(MemorySubscription {
            queue: queue.to_owned(),
            broker: self.clone(),
        }))
    }
}

struct MemorySubscription {
    queue: String,
    broker: MemoryBroker,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<BoxDelivery, BrokerError>> {
        loop {
            let notify = self.broker.queue_notify(&self.queue);
            if let Some(payload) = self.broker.take_raw(&self.queue) {
                return Some(Ok(Box::new(MemoryDelivery {
                    payload,
                    queue: self.queue.clone(),
                    broker: self.broker.clone(),
                }) as BoxDelivery));
            }
            notify.notified().await;
        }
    }
}

struct MemoryDelivery {
    payload: Vec<u8>,
    queue: String,
    broker: MemoryBroker,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn requeue(self: Box<Self>) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.messages.push_front(self.payload);
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn discard(self: Box<Self>) -> Result<(), BrokerError> {
        Ok(())
    }
}
