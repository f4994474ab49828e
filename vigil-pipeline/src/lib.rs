#![deny(missing_docs)]
//! The pipeline worker: one process per pipeline id, two branches.
//!
//! Both branch queues of the pipeline receive every envelope routed to it.
//! Each branch runs as one sequential consumer task: hydrate the frame from
//! object storage, run the branch's models, publish the verdict, and only
//! then ack. Within a branch, verdicts therefore leave in arrival order and
//! the model never sees two frames at once; across branches nothing is
//! ordered. A branch failure publishes a verdict carrying
//! `processing_error` so the fuser can still react, and the worker stays
//! live.

use std::sync::Arc;

use image::RgbImage;
use tokio_util::sync::CancellationToken;
use vigil_broker::{Broker as _, BrokerService, HandlerError, QueueSpec, consume_each, publish_json};
use vigil_models::VerifyMetric;
use vigil_models::embedding_cache::{EmbeddingCache, ReferenceError};
use vigil_models::imaging;
use vigil_models::runners::{
    FaceDetector as _, FaceDetectorService, FaceEmbedder as _, FaceEmbedderService,
    PhoneDetector as _, PhoneDetectorService, SpoofChecker as _, SpoofCheckerService,
};
use vigil_storage::{ObjectStore as _, ObjectStoreService};
use vigil_types::messages::{FaceVerdict, FrameEnvelope, PhoneVerdict};
use vigil_types::{PipelineId, queues};

pub mod config;
pub mod metrics;

/// Width of the centered pre-crop applied before face detection.
const FACE_CROP_WIDTH: u32 = 640;
/// Height of the centered pre-crop applied before face detection.
const FACE_CROP_HEIGHT: u32 = 480;

/// Everything the face branch needs.
pub struct FaceBranch {
    /// The face detector.
    pub detector: FaceDetectorService,
    /// The identity embedder.
    pub embedder: FaceEmbedderService,
    /// The anti-spoof model.
    pub spoof: SpoofCheckerService,
    /// The reference-embedding cache.
    pub cache: EmbeddingCache,
    /// Metric comparing probe and reference embeddings.
    pub metric: VerifyMetric,
    /// Identity threshold.
    pub recognition_threshold: f32,
    /// Anti-spoof confidence threshold.
    pub spoof_threshold: f32,
}

/// One pipeline worker.
pub struct PipelineWorker {
    pipeline: PipelineId,
    broker: BrokerService,
    store: ObjectStoreService,
    face: Arc<FaceBranch>,
    phone: PhoneDetectorService,
}

impl PipelineWorker {
    /// Creates the worker for `pipeline`.
    pub fn new(
        pipeline: PipelineId,
        broker: BrokerService,
        store: ObjectStoreService,
        face: FaceBranch,
        phone: PhoneDetectorService,
    ) -> Self {
        Self {
            pipeline,
            broker,
            store,
            face: Arc::new(face),
            phone,
        }
    }

    /// Runs one dummy inference per model. A failure here is fatal: the
    /// process must not start consuming with a broken model.
    pub async fn warmup(&self) -> eyre::Result<()> {
        tracing::info!("warming up models...");
        self.face.detector.warmup().await?;
        self.face.embedder.warmup().await?;
        self.face.spoof.warmup().await?;
        self.phone.warmup().await?;
        tracing::info!("models are warm");
        Ok(())
    }

    /// Declares the queues this worker consumes and publishes to.
    pub async fn declare_topology(&self, max_queue_length: u32) -> eyre::Result<()> {
        self.broker
            .declare_exchange(queues::EXCHANGE_CLIENTS_DATA)
            .await?;
        self.broker
            .declare_exchange(queues::EXCHANGE_PIPELINE_RESULTS)
            .await?;
        let routing_key = queues::pipeline_routing_key(self.pipeline);
        for queue in [
            queues::pipeline_face_queue(self.pipeline),
            queues::pipeline_phone_queue(self.pipeline),
        ] {
            self.broker
                .declare_queue(
                    QueueSpec::bound(queue, queues::EXCHANGE_CLIENTS_DATA, &routing_key)
                        .with_max_length(max_queue_length),
                )
                .await?;
        }
        self.broker
            .declare_queue(QueueSpec::bound(
                queues::QUEUE_FACE_RESULTS,
                queues::EXCHANGE_PIPELINE_RESULTS,
                queues::ROUTING_FACE_RESULTS,
            ))
            .await?;
        self.broker
            .declare_queue(QueueSpec::bound(
                queues::QUEUE_PHONE_RESULTS,
                queues::EXCHANGE_PIPELINE_RESULTS,
                queues::ROUTING_PHONE_RESULTS,
            ))
            .await?;
        Ok(())
    }

    /// Runs both branch consumers until the token is cancelled.
    pub async fn run(self, cancellation_token: CancellationToken) -> eyre::Result<()> {
        let face_task = tokio::spawn({
            let broker = self.broker.clone();
            let store = self.store.clone();
            let face = Arc::clone(&self.face);
            let queue = queues::pipeline_face_queue(self.pipeline);
            let cancellation_token = cancellation_token.clone();
            async move {
                consume_each(broker.clone(), &queue, cancellation_token, |payload| {
                    handle_face(&broker, &store, &face, payload)
                })
                .await
            }
        });
        let phone_task = tokio::spawn({
            let broker = self.broker.clone();
            let store = self.store.clone();
            let phone = self.phone.clone();
            let queue = queues::pipeline_phone_queue(self.pipeline);
            let cancellation_token = cancellation_token.clone();
            async move {
                consume_each(broker.clone(), &queue, cancellation_token, |payload| {
                    handle_phone(&broker, &store, &phone, payload)
                })
                .await
            }
        });
        let (face_result, phone_result) = tokio::join!(face_task, phone_task);
        face_result??;
        phone_result??;
        Ok(())
    }
}

/// Fetches and decodes the frame referenced by the envelope.
async fn hydrate(
    store: &ObjectStoreService,
    envelope: &FrameEnvelope,
) -> Result<RgbImage, String> {
    let bytes = store
        .get(&envelope.object_key)
        .await
        .map_err(|err| format!("cannot hydrate frame '{}': {err}", envelope.object_key))?;
    imaging::decode_image(&bytes)
        .map_err(|err| format!("cannot decode frame '{}': {err}", envelope.object_key))
}

async fn handle_face(
    broker: &BrokerService,
    store: &ObjectStoreService,
    face: &FaceBranch,
    payload: Vec<u8>,
) -> Result<(), HandlerError> {
    let envelope: FrameEnvelope = vigil_broker::decode_json(&payload)
        .map_err(|err| HandlerError::Discard(format!("bad face envelope: {err}")))?;
    let started = std::time::Instant::now();
    let verdict = match run_face_branch(store, face, &envelope).await {
        Ok(verdict) => verdict,
        Err(error) => {
            tracing::error!(
                "face branch failed for '{}': {error}",
                envelope.client_name
            );
            ::metrics::counter!(metrics::METRICS_ID_PIPELINE_FACE_FAILED).increment(1);
            failure_face_verdict(envelope, error)
        }
    };
    publish_json(
        broker,
        queues::EXCHANGE_PIPELINE_RESULTS,
        queues::ROUTING_FACE_RESULTS,
        &verdict,
    )
    .await
    .map_err(|err| HandlerError::Requeue(format!("cannot publish face verdict: {err}")))?;
    ::metrics::counter!(metrics::METRICS_ID_PIPELINE_FACE_PROCESSED).increment(1);
    ::metrics::histogram!(metrics::METRICS_ID_PIPELINE_FACE_DURATION)
        .record(started.elapsed().as_millis() as f64);
    tracing::debug!(
        "face branch took {:?} for '{}'",
        started.elapsed(),
        verdict.envelope.client_name
    );
    Ok(())
}

async fn run_face_branch(
    store: &ObjectStoreService,
    face: &FaceBranch,
    envelope: &FrameEnvelope,
) -> Result<FaceVerdict, String> {
    let frame = hydrate(store, envelope).await?;
    let frame = imaging::center_crop(&frame, FACE_CROP_WIDTH, FACE_CROP_HEIGHT);

    let mut verdict = FaceVerdict {
        envelope: envelope.clone(),
        face_bbox: None,
        check_client: None,
        check_spoof: None,
        recognition_metric_value: None,
        recognition_threshold: None,
        detection_success: false,
        processing_error: None,
    };

    let detection = face
        .detector
        .detect_face(&frame)
        .await
        .map_err(|err| format!("face detection failed: {err}"))?;
    let Some(detection) = detection else {
        return Ok(verdict);
    };
    verdict.detection_success = true;
    verdict.face_bbox = Some(detection.bbox);

    let patch = imaging::square_crop_around(&frame, detection.bbox);
    match face.cache.get_reference(&envelope.client_name).await {
        Ok(reference) => {
            let probe = face
                .embedder
                .embed(&patch)
                .await
                .map_err(|err| format!("embedding failed: {err}"))?;
            let outcome = face
                .metric
                .verify(&probe, &reference, face.recognition_threshold);
            verdict.check_client = Some(outcome.verified);
            verdict.recognition_metric_value = Some(outcome.distance);
            verdict.recognition_threshold = Some(outcome.threshold);
        }
        Err(ReferenceError::Missing(client)) => {
            // no enrolment: the identity check fails, the branch does not
            tracing::warn!("no reference embedding for '{client}'");
            verdict.check_client = Some(false);
            verdict.recognition_threshold = Some(face.recognition_threshold);
        }
        Err(ReferenceError::Model(err)) => {
            return Err(format!("reference embedding failed: {err}"));
        }
    }

    let spoof = face
        .spoof
        .check_spoof(&frame, detection.bbox)
        .await
        .map_err(|err| format!("spoof check failed: {err}"))?;
    verdict.check_spoof = Some(spoof.is_spoof(face.spoof_threshold));
    Ok(verdict)
}

fn failure_face_verdict(envelope: FrameEnvelope, error: String) -> FaceVerdict {
    FaceVerdict {
        envelope,
        face_bbox: None,
        check_client: None,
        check_spoof: None,
        recognition_metric_value: None,
        recognition_threshold: None,
        detection_success: false,
        processing_error: Some(error),
    }
}

async fn handle_phone(
    broker: &BrokerService,
    store: &ObjectStoreService,
    phone: &PhoneDetectorService,
    payload: Vec<u8>,
) -> Result<(), HandlerError> {
    let envelope: FrameEnvelope = vigil_broker::decode_json(&payload)
        .map_err(|err| HandlerError::Discard(format!("bad phone envelope: {err}")))?;
    let started = std::time::Instant::now();
    let verdict = match run_phone_branch(store, phone, &envelope).await {
        Ok(verdict) => verdict,
        Err(error) => {
            tracing::error!(
                "phone branch failed for '{}': {error}",
                envelope.client_name
            );
            ::metrics::counter!(metrics::METRICS_ID_PIPELINE_PHONE_FAILED).increment(1);
            PhoneVerdict {
                envelope,
                phone_bbox: None,
                phone_confidence: None,
                processing_error: Some(error),
            }
        }
    };
    publish_json(
        broker,
        queues::EXCHANGE_PIPELINE_RESULTS,
        queues::ROUTING_PHONE_RESULTS,
        &verdict,
    )
    .await
    .map_err(|err| HandlerError::Requeue(format!("cannot publish phone verdict: {err}")))?;
    ::metrics::counter!(metrics::METRICS_ID_PIPELINE_PHONE_PROCESSED).increment(1);
    ::metrics::histogram!(metrics::METRICS_ID_PIPELINE_PHONE_DURATION)
        .record(started.elapsed().as_millis() as f64);
    Ok(())
}

async fn run_phone_branch(
    store: &ObjectStoreService,
    phone: &PhoneDetectorService,
    envelope: &FrameEnvelope,
) -> Result<PhoneVerdict, String> {
    let frame = hydrate(store, envelope).await?;
    let detection = phone
        .detect_phone(&frame)
        .await
        .map_err(|err| format!("phone detection failed: {err}"))?;
    Ok(PhoneVerdict {
        envelope: envelope.clone(),
        phone_bbox: detection.map(|d| d.bbox),
        phone_confidence: detection.map(|d| d.confidence),
        processing_error: None,
    })
}
