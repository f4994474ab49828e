#![deny(missing_docs)]
//! The decision fuser: branch verdicts in, actions and audit records out.
//!
//! The face and phone branches are conclusive on their own, so the fuser
//! keeps no correlation state and stays correct under arbitrary verdict
//! reordering. Every face verdict yields an action (NO_ACTION included, to
//! make liveness observable); the phone branch suppresses NO_ACTION so a
//! clean frame does not produce two "ok" emissions. Any non-trivial action
//! additionally produces a [`SavedAction`]: the frame is hydrated, the bbox
//! drawn (green for face, red for phone), and the record published under a
//! deterministic key so at-least-once redelivery stays idempotent.

use tokio_util::sync::CancellationToken;
use vigil_broker::{
    Broker as _, BrokerService, HandlerError, QueueSpec, consume_each, publish_cbor, publish_json,
};
use vigil_models::imaging;
use vigil_storage::{ObjectStore as _, ObjectStoreService};
use vigil_types::messages::{ActionMessage, FaceVerdict, PhoneVerdict, SavedAction};
use vigil_types::{Action, BBox, Branch, ClientName, Reason, queues};

pub mod config;
pub mod metrics;

/// Decides the face-branch action.
///
/// Order matters: a frame without a face can say nothing about spoofing or
/// identity, and a spoofed face must not be excused by a matching identity.
pub fn derive_face_action(verdict: &FaceVerdict) -> (Action, Reason) {
    if verdict.face_bbox.is_none() {
        return (Action::LockScreen, Reason::NoFace);
    }
    if verdict.check_spoof == Some(true) {
        return (Action::SignOut, Reason::SpoofImage);
    }
    if verdict.check_client != Some(true) {
        return (Action::LockScreen, Reason::WrongUser);
    }
    (Action::NoAction, Reason::Empty)
}

/// Decides the phone-branch action.
pub fn derive_phone_action(verdict: &PhoneVerdict) -> (Action, Reason) {
    if verdict.phone_bbox.is_some() {
        (Action::SignOut, Reason::PhoneDetection)
    } else {
        (Action::NoAction, Reason::Empty)
    }
}

/// Deterministic object key of a saved-action snapshot.
pub fn saved_action_key(
    client: &ClientName,
    action: Action,
    reason: Reason,
    stamp: &str,
) -> String {
    format!(
        "actions/{action}/{client}/{stamp}__{action}__{reason}.jpg",
        action = action.path_segment(),
        client = client.as_key_segment(),
        reason = reason.path_segment(),
    )
}

/// The decision fuser service.
pub struct DecisionFuser {
    broker: BrokerService,
    store: ObjectStoreService,
}

impl DecisionFuser {
    /// Creates the fuser.
    pub fn new(broker: BrokerService, store: ObjectStoreService) -> Self {
        Self { broker, store }
    }

    /// Declares the queues the fuser consumes and publishes to.
    pub async fn declare_topology(&self) -> eyre::Result<()> {
        self.broker
            .declare_exchange(queues::EXCHANGE_PIPELINE_RESULTS)
            .await?;
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
        self.broker
            .declare_queue(QueueSpec::plain(queues::QUEUE_ACTIONS))
            .await?;
        self.broker
            .declare_queue(QueueSpec::plain(queues::QUEUE_SAVED_ACTIONS))
            .await?;
        Ok(())
    }

    /// Runs both verdict consumers until the token is cancelled.
    pub async fn run(self, cancellation_token: CancellationToken) -> eyre::Result<()> {
        let face_task = tokio::spawn({
            let fuser = FuserInner {
                broker: self.broker.clone(),
                store: self.store.clone(),
            };
            let cancellation_token = cancellation_token.clone();
            async move {
                consume_each(
                    fuser.broker.clone(),
                    queues::QUEUE_FACE_RESULTS,
                    cancellation_token,
                    |payload| fuser.handle_face(payload),
                )
                .await
            }
        });
        let phone_task = tokio::spawn({
            let fuser = FuserInner {
                broker: self.broker.clone(),
                store: self.store.clone(),
            };
            let cancellation_token = cancellation_token.clone();
            async move {
                consume_each(
                    fuser.broker.clone(),
                    queues::QUEUE_PHONE_RESULTS,
                    cancellation_token,
                    |payload| fuser.handle_phone(payload),
                )
                .await
            }
        });
        let (face_result, phone_result) = tokio::join!(face_task, phone_task);
        face_result??;
        phone_result??;
        Ok(())
    }
}

struct FuserInner {
    broker: BrokerService,
    store: ObjectStoreService,
}

impl FuserInner {
    async fn handle_face(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
        let verdict: FaceVerdict = vigil_broker::decode_json(&payload)
            .map_err(|err| HandlerError::Discard(format!("bad face verdict: {err}")))?;
        let (action, reason) = derive_face_action(&verdict);
        let message = self.action_message(&verdict.envelope.client_name, action, reason, &verdict.envelope.send_time);
        // the face branch always emits, so liveness stays observable
        publish_json(&self.broker, "", queues::QUEUE_ACTIONS, &message)
            .await
            .map_err(|err| HandlerError::Requeue(format!("cannot publish action: {err}")))?;
        ::metrics::counter!(metrics::METRICS_ID_FUSER_FACE_ACTIONS).increment(1);
        if action != Action::NoAction {
            self.publish_saved_action(
                Branch::Face,
                &verdict.envelope,
                verdict.face_bbox,
                &message,
                verdict.recognition_metric_value,
                verdict.recognition_threshold,
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_phone(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
        let verdict: PhoneVerdict = vigil_broker::decode_json(&payload)
            .map_err(|err| HandlerError::Discard(format!("bad phone verdict: {err}")))?;
        let (action, reason) = derive_phone_action(&verdict);
        if action == Action::NoAction {
            // suppressed: the face branch already reports the ok case
            return Ok(());
        }
        let message = self.action_message(&verdict.envelope.client_name, action, reason, &verdict.envelope.send_time);
        publish_json(&self.broker, "", queues::QUEUE_ACTIONS, &message)
            .await
            .map_err(|err| HandlerError::Requeue(format!("cannot publish action: {err}")))?;
        ::metrics::counter!(metrics::METRICS_ID_FUSER_PHONE_ACTIONS).increment(1);
        self.publish_saved_action(
            Branch::Phone,
            &verdict.envelope,
            verdict.phone_bbox,
            &message,
            None,
            None,
        )
        .await?;
        Ok(())
    }

    fn action_message(
        &self,
        client: &ClientName,
        action: Action,
        reason: Reason,
        send_time: &str,
    ) -> ActionMessage {
        ActionMessage {
            action,
            reason,
            client_name: client.clone(),
            send_time: send_time.to_owned(),
            finish_time: vigil_types::wall_clock_stamp(chrono::Local::now()),
        }
    }

    /// Hydrates the frame, draws the branch bbox and publishes the record.
    ///
    /// A frame that cannot be hydrated (already expired, storage down) still
    /// produces a record, just without the snapshot.
    async fn publish_saved_action(
        &self,
        branch: Branch,
        envelope: &vigil_types::messages::FrameEnvelope,
        bbox: Option<BBox>,
        message: &ActionMessage,
        recognition_metric_value: Option<f32>,
        recognition_threshold: Option<f32>,
    ) -> Result<(), HandlerError> {
        let annotated_jpeg = match self.annotate(envelope, branch, bbox).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::error!(
                    "cannot prepare snapshot for '{}': {err}",
                    envelope.client_name
                );
                None
            }
        };
        let stamp = vigil_types::object_key_stamp(chrono::Utc::now());
        let action_object_key = annotated_jpeg.as_ref().map(|_| {
            saved_action_key(&envelope.client_name, message.action, message.reason, &stamp)
        });
        let saved = SavedAction {
            client_name: envelope.client_name.clone(),
            action: message.action,
            reason: message.reason,
            branch,
            annotated_jpeg,
            action_bucket: action_object_key
                .as_ref()
                .map(|_| self.store.bucket().to_owned()),
            action_object_key,
            source_object_key: envelope.object_key.clone(),
            source_bucket: envelope.bucket.clone(),
            source_content_type: envelope.content_type.clone(),
            storage_provider: envelope.storage_provider.clone(),
            recognition_metric_value,
            recognition_threshold,
            send_time: message.send_time.clone(),
            finish_time: message.finish_time.clone(),
        };
        publish_cbor(&self.broker, "", queues::QUEUE_SAVED_ACTIONS, &saved)
            .await
            .map_err(|err| HandlerError::Requeue(format!("cannot publish saved action: {err}")))?;
        ::metrics::counter!(metrics::METRICS_ID_FUSER_SAVED_ACTIONS).increment(1);
        Ok(())
    }

    async fn annotate(
        &self,
        envelope: &vigil_types::messages::FrameEnvelope,
        branch: Branch,
        bbox: Option<BBox>,
    ) -> Result<Vec<u8>, String> {
        let bytes = self
            .store
            .get(&envelope.object_key)
            .await
            .map_err(|err| format!("cannot hydrate '{}': {err}", envelope.object_key))?;
        let mut frame = imaging::decode_image(&bytes)
            .map_err(|err| format!("cannot decode '{}': {err}", envelope.object_key))?;
        if let Some(bbox) = bbox {
            let color = match branch {
                Branch::Face => imaging::FACE_BOX_COLOR,
                Branch::Phone => imaging::PHONE_BOX_COLOR,
            };
            imaging::draw_rectangle(&mut frame, bbox, color);
        }
        imaging::encode_jpeg(&frame).map_err(|err| err.to_string())
    }
}
