#![deny(missing_docs)]
//! The dispatcher: fans frame envelopes out to pipeline queues.
//!
//! Consumes `clients_data` and routes each envelope to one pipeline by
//! round-robin; both branch queues of that pipeline are bound under the same
//! routing key, so a single publish reaches the face and the phone branch.
//! The counter is process-local; pipelines are fungible, so no load
//! observation is needed. Envelopes without a client identifier are logged
//! and dropped.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use vigil_broker::{Broker as _, BrokerService, HandlerError, QueueSpec, consume_each};
use vigil_types::{PipelineId, queues};

pub mod config;
pub mod metrics;

/// Round-robin router from `clients_data` to the pipeline queues.
pub struct Dispatcher {
    broker: BrokerService,
    total_pipelines: u32,
    max_clients_per_pipeline: u32,
    next_pipeline: AtomicU32,
    routed: Vec<AtomicU64>,
}

impl Dispatcher {
    /// Creates a dispatcher over `total_pipelines` pipelines.
    pub fn new(broker: BrokerService, total_pipelines: u32, max_clients_per_pipeline: u32) -> Self {
        assert!(total_pipelines > 0, "at least one pipeline is required");
        Self {
            broker,
            total_pipelines,
            max_clients_per_pipeline,
            next_pipeline: AtomicU32::new(0),
            routed: (0..total_pipelines).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Declares the exchange, the inbound queue and every pipeline queue.
    ///
    /// Pipeline queues are bounded by `max_clients_per_pipeline` with
    /// drop-head overflow; the broker bound is the actual capacity guard.
    pub async fn declare_topology(&self) -> eyre::Result<()> {
        self.broker
            .declare_exchange(queues::EXCHANGE_CLIENTS_DATA)
            .await?;
        self.broker
            .declare_queue(QueueSpec::bound(
                queues::QUEUE_CLIENTS_DATA,
                queues::EXCHANGE_CLIENTS_DATA,
                queues::QUEUE_CLIENTS_DATA,
            ))
            .await?;
        for id in 0..self.total_pipelines {
            let pipeline = PipelineId::new(id);
            let routing_key = queues::pipeline_routing_key(pipeline);
            for queue in [
                queues::pipeline_face_queue(pipeline),
                queues::pipeline_phone_queue(pipeline),
            ] {
                self.broker
                    .declare_queue(
                        QueueSpec::bound(queue, queues::EXCHANGE_CLIENTS_DATA, &routing_key)
                            .with_max_length(self.max_clients_per_pipeline),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Consumes `clients_data` until the token is cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) -> eyre::Result<()> {
        consume_each(
            self.broker.clone(),
            queues::QUEUE_CLIENTS_DATA,
            cancellation_token,
            |payload| self.route(payload),
        )
        .await?;
        Ok(())
    }

    async fn route(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
        // the envelope is forwarded verbatim; only the client identifier is
        // checked here
        let value: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|err| HandlerError::Discard(format!("not a JSON envelope: {err}")))?;
        let identifier = value
            .get("client_name")
            .or_else(|| value.get("user_name"))
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty());
        let Some(identifier) = identifier else {
            return Err(HandlerError::Discard(
                "envelope carries no client identifier".to_owned(),
            ));
        };

        let pipeline = self.pick_pipeline();
        tracing::debug!("routing frame of '{identifier}' to pipeline {pipeline}");
        self.broker
            .publish(
                queues::EXCHANGE_CLIENTS_DATA,
                &queues::pipeline_routing_key(pipeline),
                payload,
            )
            .await
            .map_err(|err| HandlerError::Requeue(format!("cannot reach pipeline queues: {err}")))?;
        ::metrics::counter!(metrics::METRICS_ID_DISPATCH_ROUTED, "pipeline" => pipeline.to_string())
            .increment(1);
        Ok(())
    }

    fn pick_pipeline(&self) -> PipelineId {
        let id = self.next_pipeline.fetch_add(1, Ordering::Relaxed) % self.total_pipelines;
        let routed = self.routed[id as usize].fetch_add(1, Ordering::Relaxed) + 1;
        // informational only: the drop-head bound on the queue is the guard
        if self.max_clients_per_pipeline > 0 && routed > u64::from(self.max_clients_per_pipeline) {
            tracing::warn!(
                "pipeline {id} received {routed} messages, above its configured capacity {}",
                self.max_clients_per_pipeline
            );
        }
        PipelineId::new(id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use vigil_test_utils::MemoryBroker;
    use vigil_types::messages::FrameEnvelope;

    use super::*;

    fn envelope(client: &str) -> FrameEnvelope {
        FrameEnvelope {
            client_name: vigil_types::ClientName::parse(client).unwrap(),
            send_time: "10-00-00".to_owned(),
            object_key: format!("frames/{client}/x.jpg"),
            bucket: "face-frames".to_owned(),
            content_type: "image/jpeg".to_owned(),
            storage_provider: "memory".to_owned(),
            frame_size_bytes: 1,
            extra: BTreeMap::new(),
        }
    }

    async fn dispatcher_over(broker: &MemoryBroker, pipelines: u32) -> Dispatcher {
        let dispatcher = Dispatcher::new(Arc::new(broker.clone()), pipelines, 4);
        dispatcher.declare_topology().await.unwrap();
        dispatcher
    }

    #[tokio::test]
    async fn distributes_round_robin_to_both_branches() {
        let broker = MemoryBroker::default();
        let dispatcher = dispatcher_over(&broker, 3).await;

        // 3 pipelines, 6 envelopes -> exactly 2 per pipeline, on both queues
        for i in 0..6 {
            let payload = serde_json::to_vec(&envelope(&format!("client-{i}"))).unwrap();
            dispatcher.route(payload).await.unwrap();
        }
        for id in 0..3 {
            let pipeline = PipelineId::new(id);
            assert_eq!(broker.queue_len(&queues::pipeline_face_queue(pipeline)), 2);
            assert_eq!(broker.queue_len(&queues::pipeline_phone_queue(pipeline)), 2);
        }
    }

    #[tokio::test]
    async fn forwards_envelopes_verbatim() {
        let broker = MemoryBroker::default();
        let dispatcher = dispatcher_over(&broker, 1).await;

        let mut sent = envelope("obama");
        sent.extra
            .insert("client_ip".to_owned(), serde_json::json!("10.1.2.3"));
        dispatcher
            .route(serde_json::to_vec(&sent).unwrap())
            .await
            .unwrap();

        let face: FrameEnvelope = broker
            .take_json(&queues::pipeline_face_queue(PipelineId::new(0)))
            .unwrap();
        let phone: FrameEnvelope = broker
            .take_json(&queues::pipeline_phone_queue(PipelineId::new(0)))
            .unwrap();
        assert_eq!(face, sent);
        assert_eq!(phone, sent);
    }

    #[tokio::test]
    async fn drops_envelopes_without_identifier() {
        let broker = MemoryBroker::default();
        let dispatcher = dispatcher_over(&broker, 2).await;

        let result = dispatcher.route(b"{\"send_time\":\"x\"}".to_vec()).await;
        assert!(matches!(result, Err(HandlerError::Discard(_))));
        let result = dispatcher.route(b"not json".to_vec()).await;
        assert!(matches!(result, Err(HandlerError::Discard(_))));
        assert_eq!(broker.queue_len(&queues::pipeline_face_queue(PipelineId::new(0))), 0);
    }

    #[tokio::test]
    async fn accepts_user_name_as_identifier() {
        let broker = MemoryBroker::default();
        let dispatcher = dispatcher_over(&broker, 1).await;
        dispatcher
            .route(b"{\"user_name\":\"obama\"}".to_vec())
            .await
            .unwrap();
        assert_eq!(broker.queue_len(&queues::pipeline_face_queue(PipelineId::new(0))), 1);
    }

    #[tokio::test]
    async fn bounded_queues_drop_the_oldest_frame() {
        let broker = MemoryBroker::default();
        let dispatcher = Dispatcher::new(Arc::new(broker.clone()), 1, 2);
        dispatcher.declare_topology().await.unwrap();

        for client in ["a", "b", "c"] {
            dispatcher
                .route(serde_json::to_vec(&envelope(client)).unwrap())
                .await
                .unwrap();
        }
        let queue = queues::pipeline_face_queue(PipelineId::new(0));
        assert_eq!(broker.queue_len(&queue), 2);
        let first: FrameEnvelope = broker.take_json(&queue).unwrap();
        // "a" was dropped at the head; the freshest frames won
        assert_eq!(first.client_name.as_str(), "b");
    }
}
