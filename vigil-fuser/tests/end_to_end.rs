//! Frame-to-action flow across dispatcher, pipeline worker and fuser,
//! wired over the in-memory broker and object store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vigil_broker::{Broker as _, BrokerService};
use vigil_common::users::UserDirectory;
use vigil_dispatch::Dispatcher;
use vigil_fuser::DecisionFuser;
use vigil_models::embedding_cache::{EmbeddingCache, ReferenceCrop};
use vigil_models::runners::{Detection, SpoofOutcome};
use vigil_models::{ModelSignature, VerifyMetric};
use vigil_pipeline::{FaceBranch, PipelineWorker};
use vigil_storage::{ObjectStore as _, ObjectStoreService};
use vigil_test_utils::{MemoryBroker, MemoryObjectStore, ScriptedModels, sample_jpeg};
use vigil_types::messages::{ActionMessage, FrameEnvelope, SavedAction};
use vigil_types::{BBox, ClientName, PipelineId, queues};

struct Stages {
    broker: MemoryBroker,
    store: Arc<MemoryObjectStore>,
    models: ScriptedModels,
    token: CancellationToken,
    _users_dir: tempfile::TempDir,
}

impl Drop for Stages {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns dispatcher, one pipeline worker and the fuser over shared
/// in-memory capabilities.
async fn start_stages() -> Stages {
    let broker = MemoryBroker::default();
    let store = Arc::new(MemoryObjectStore::default());
    let models = ScriptedModels::default();
    let token = CancellationToken::new();

    let users_dir = tempfile::tempdir().unwrap();
    let obama = users_dir.path().join("obama");
    std::fs::create_dir(&obama).unwrap();
    std::fs::write(obama.join("obama_1.jpg"), sample_jpeg(64, 64)).unwrap();

    let broker_service: BrokerService = Arc::new(broker.clone());
    let store_service: ObjectStoreService = store.clone();

    let dispatcher = Dispatcher::new(broker_service.clone(), 1, 8);
    dispatcher.declare_topology().await.unwrap();

    let cache = EmbeddingCache::new(
        Arc::new(UserDirectory::new(users_dir.path())),
        store_service.clone(),
        Arc::new(models.clone()),
        Arc::new(models.clone()),
        ModelSignature::derive("r100", "v1", VerifyMetric::CosineSimilarity),
        "default",
        ReferenceCrop::Detect,
    );
    let worker = PipelineWorker::new(
        PipelineId::new(0),
        broker_service.clone(),
        store_service.clone(),
        FaceBranch {
            detector: Arc::new(models.clone()),
            embedder: Arc::new(models.clone()),
            spoof: Arc::new(models.clone()),
            cache,
            metric: VerifyMetric::CosineSimilarity,
            recognition_threshold: 0.25,
            spoof_threshold: 0.65,
        },
        Arc::new(models.clone()),
    );
    worker.declare_topology(8).await.unwrap();

    let fuser = DecisionFuser::new(broker_service.clone(), store_service);
    fuser.declare_topology().await.unwrap();

    tokio::spawn({
        let token = token.clone();
        async move { dispatcher.run(token).await }
    });
    tokio::spawn({
        let token = token.clone();
        async move { worker.run(token).await }
    });
    tokio::spawn({
        let token = token.clone();
        async move { fuser.run(token).await }
    });

    Stages {
        broker,
        store,
        models,
        token,
        _users_dir: users_dir,
    }
}

async fn inject_frame(stages: &Stages, client: &str) -> FrameEnvelope {
    let key = vigil_storage::frame_key(&ClientName::parse(client).unwrap());
    stages
        .store
        .put(&key, sample_jpeg(640, 480), "image/jpeg")
        .await
        .unwrap();
    let envelope = FrameEnvelope {
        client_name: ClientName::parse(client).unwrap(),
        send_time: "08-15-00".to_owned(),
        object_key: key,
        bucket: "test-bucket".to_owned(),
        content_type: "image/jpeg".to_owned(),
        storage_provider: "memory".to_owned(),
        frame_size_bytes: 100,
        extra: BTreeMap::new(),
    };
    let broker_service: BrokerService = Arc::new(stages.broker.clone());
    broker_service
        .publish(
            queues::EXCHANGE_CLIENTS_DATA,
            queues::QUEUE_CLIENTS_DATA,
            serde_json::to_vec(&envelope).unwrap(),
        )
        .await
        .unwrap();
    envelope
}

async fn wait_action(stages: &Stages) -> ActionMessage {
    tokio::time::timeout(
        Duration::from_secs(5),
        stages.broker.wait_json(queues::QUEUE_ACTIONS),
    )
    .await
    .expect("no action arrived")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn genuine_user_ends_in_a_single_no_action() {
    let stages = start_stages().await;
    let envelope = inject_frame(&stages, "obama").await;

    let action = wait_action(&stages).await;
    assert_eq!(u8::from(action.action), 0);
    assert_eq!(u8::from(action.reason), 0);
    assert_eq!(action.client_name, envelope.client_name);
    assert_eq!(action.send_time, envelope.send_time);

    // the clean phone branch is suppressed and nothing is audited
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stages.broker.queue_len(queues::QUEUE_ACTIONS), 0);
    assert_eq!(stages.broker.queue_len(queues::QUEUE_SAVED_ACTIONS), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spoofed_frame_signs_the_client_out_with_an_audit_record() {
    let stages = start_stages().await;
    stages.models.set_spoof(SpoofOutcome {
        is_real: false,
        score: 0.95,
    });
    inject_frame(&stages, "obama").await;

    let action = wait_action(&stages).await;
    assert_eq!(u8::from(action.action), 2);
    assert_eq!(u8::from(action.reason), 5);

    let saved: SavedAction = tokio::time::timeout(
        Duration::from_secs(5),
        stages.broker.wait_cbor(queues::QUEUE_SAVED_ACTIONS),
    )
    .await
    .expect("no saved action arrived");
    assert!(
        saved
            .action_object_key
            .as_deref()
            .unwrap()
            .starts_with("actions/Sign_out/obama/")
    );
    assert!(saved.annotated_jpeg.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn phone_in_frame_signs_the_client_out() {
    let stages = start_stages().await;
    stages.models.set_phone(Some(Detection {
        bbox: BBox::from([30, 40, 90, 160]),
        confidence: 0.92,
    }));
    inject_frame(&stages, "obama").await;

    // both branches emit: face NO_ACTION and phone SIGN_OUT, in any order
    let mut actions = vec![wait_action(&stages).await, wait_action(&stages).await];
    actions.sort_by_key(|action| u8::from(action.action));
    assert_eq!(u8::from(actions[0].action), 0);
    assert_eq!(u8::from(actions[1].action), 2);
    assert_eq!(u8::from(actions[1].reason), 1);

    let saved: SavedAction = tokio::time::timeout(
        Duration::from_secs(5),
        stages.broker.wait_cbor(queues::QUEUE_SAVED_ACTIONS),
    )
    .await
    .expect("no saved action arrived");
    assert!(
        saved
            .action_object_key
            .as_deref()
            .unwrap()
            .contains("__Sign_out__Phone_detection")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_envelope_produces_two_verdicts_worth_of_effects() {
    let stages = start_stages().await;
    stages.models.set_face(None);
    inject_frame(&stages, "obama").await;

    // no face -> LOCK_SCREEN / NO_FACE from the face branch; the phone
    // branch stays silent
    let action = wait_action(&stages).await;
    assert_eq!(u8::from(action.action), 1);
    assert_eq!(u8::from(action.reason), 7);
}
