//! End-to-end gateway tests: a real WebSocket client against the served
//! router, with in-memory capabilities behind it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use vigil_broker::Broker as _;
use vigil_common::profile::RateLimiterConfig;
use vigil_common::users::UserDirectory;
use vigil_gateway::{GatewayState, SessionRegistry};
use vigil_ratelimit::RateLimiter;
use vigil_test_utils::{MemoryBroker, MemoryObjectStore, MemoryStatusStore, sample_jpeg};
use vigil_types::messages::{ActionMessage, FrameEnvelope};
use vigil_types::{ClientName, queues, ws_close_codes};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: SocketAddr,
    broker: MemoryBroker,
    store: Arc<MemoryObjectStore>,
    status: Arc<MemoryStatusStore>,
    state: GatewayState,
    _users_dir: tempfile::TempDir,
}

async fn harness(max_clients: u32) -> Harness {
    let broker = MemoryBroker::default();
    let store = Arc::new(MemoryObjectStore::default());
    let status = Arc::new(MemoryStatusStore::default());

    let users_dir = tempfile::tempdir().unwrap();
    for client in ["obama", "biden"] {
        let dir = users_dir.path().join(client);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join(format!("{client}_1.jpg")), sample_jpeg(64, 64)).unwrap();
    }

    let state = GatewayState {
        broker: Arc::new(broker.clone()),
        store: store.clone(),
        status: status.clone(),
        users: Arc::new(UserDirectory::new(users_dir.path())),
        rate_limiter: Arc::new(RateLimiter::new(RateLimiterConfig {
            max_clients,
            window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
        })),
        registry: SessionRegistry::default(),
        session_permits: Arc::new(tokio::sync::Semaphore::new(16)),
        message_timeout: Duration::from_secs(5),
        max_message_size: 16 * 1024 * 1024,
    };
    vigil_gateway::declare_topology(&state.broker).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn({
        let router = vigil_gateway::routes(state.clone());
        async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        }
    });

    Harness {
        addr,
        broker,
        store,
        status,
        state,
        _users_dir: users_dir,
    }
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn send_frame(client: &mut WsClient, user_name: &str) {
    let frame = serde_json::json!({
        "user_name": user_name,
        "image": BASE64.encode(sample_jpeg(320, 240)),
    });
    client
        .send(Message::text(frame.to_string()))
        .await
        .unwrap();
}

async fn recv_json(client: &mut WsClient) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket ended unexpectedly")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text message, got {other:?}"),
        }
    }
}

async fn recv_close_code(client: &mut WsClient) -> u16 {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for the close frame")
            .expect("socket ended unexpectedly")
            .unwrap();
        match message {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected the close frame, got {other:?}"),
        }
    }
}

async fn wait_envelope(harness: &Harness) -> FrameEnvelope {
    tokio::time::timeout(
        Duration::from_secs(5),
        harness.broker.wait_json(queues::QUEUE_CLIENTS_DATA),
    )
    .await
    .expect("no envelope arrived")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frame_is_offloaded_and_enqueued() {
    let harness = harness(8).await;
    let mut client = connect(harness.addr).await;

    send_frame(&mut client, "Obama").await;
    let envelope = wait_envelope(&harness).await;

    assert_eq!(envelope.client_name.as_str(), "obama");
    assert!(envelope.object_key.starts_with("frames/obama/"));
    assert_eq!(envelope.bucket, "test-bucket");
    assert_eq!(envelope.storage_provider, "memory");
    assert!(envelope.frame_size_bytes > 0);
    // the pixels live in the store, not on the queue
    assert!(harness.store.contains(&envelope.object_key));
    // registration metadata rides along on the first frame
    assert!(envelope.extra.contains_key("client_ip"));

    use vigil_status::StatusStore as _;
    let snapshot = harness.status.snapshot().await.unwrap();
    assert_eq!(snapshot.active_clients, vec!["obama".to_owned()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn actions_are_fanned_out_to_the_right_socket() {
    let harness = harness(8).await;
    let token = tokio_util::sync::CancellationToken::new();
    tokio::spawn(vigil_gateway::actions::action_consumer_task(
        harness.state.clone(),
        token.clone(),
    ));

    let mut client = connect(harness.addr).await;
    send_frame(&mut client, "obama").await;
    wait_envelope(&harness).await;

    let action = ActionMessage {
        action: vigil_types::Action::LockScreen,
        reason: vigil_types::Reason::WrongUser,
        client_name: ClientName::parse("obama").unwrap(),
        send_time: "10-00-00".to_owned(),
        finish_time: "10-00-01".to_owned(),
    };
    harness
        .state
        .broker
        .publish(
            "",
            queues::QUEUE_ACTIONS,
            serde_json::to_vec(&action).unwrap(),
        )
        .await
        .unwrap();

    let received = recv_json(&mut client).await;
    assert_eq!(received["action"], 1);
    assert_eq!(received["reason"], 6);
    assert_eq!(received["client_name"], "obama");
    token.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_client_gets_a_warning_and_stays_connected() {
    let harness = harness(8).await;
    harness
        .status
        .seed(vigil_status::StatusBucket::Paused, &["obama"]);
    let mut client = connect(harness.addr).await;

    send_frame(&mut client, "obama").await;
    let notice = recv_json(&mut client).await;
    assert_eq!(notice["action"], 3);
    assert_eq!(notice["reason"], 9);
    assert_eq!(harness.broker.queue_len(queues::QUEUE_CLIENTS_DATA), 0);

    // the session survives; a second frame is answered again
    send_frame(&mut client, "obama").await;
    let notice = recv_json(&mut client).await;
    assert_eq!(notice["reason"], 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_client_is_closed_with_policy_code() {
    let harness = harness(8).await;
    harness
        .status
        .seed(vigil_status::StatusBucket::Blocked, &["obama"]);
    let mut client = connect(harness.addr).await;

    send_frame(&mut client, "obama").await;
    let notice = recv_json(&mut client).await;
    assert_eq!(notice["action"], 4);
    assert_eq!(notice["reason"], 8);
    assert_eq!(recv_close_code(&mut client).await, ws_close_codes::POLICY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unenrolled_client_is_rejected() {
    let harness = harness(8).await;
    let mut client = connect(harness.addr).await;

    send_frame(&mut client, "carol").await;
    let notice = recv_json(&mut client).await;
    assert_eq!(notice["action"], 4);
    assert_eq!(notice["reason"], 11);
    assert_eq!(recv_close_code(&mut client).await, ws_close_codes::POLICY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limited_client_is_closed_with_4003() {
    let harness = harness(1).await;

    let mut first = connect(harness.addr).await;
    send_frame(&mut first, "obama").await;
    wait_envelope(&harness).await;

    // second distinct client inside the same window
    let mut second = connect(harness.addr).await;
    send_frame(&mut second, "biden").await;
    let notice = recv_json(&mut second).await;
    assert_eq!(notice["action"], 4);
    assert_eq!(notice["reason"], 12);
    assert_eq!(
        recv_close_code(&mut second).await,
        ws_close_codes::RATE_LIMITED
    );

    // the already-active client keeps streaming
    send_frame(&mut first, "obama").await;
    wait_envelope(&harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_user_name_is_ignored() {
    let harness = harness(8).await;
    let mut client = connect(harness.addr).await;

    send_frame(&mut client, "obama").await;
    wait_envelope(&harness).await;

    send_frame(&mut client, "biden").await;
    send_frame(&mut client, "obama").await;
    let envelope = wait_envelope(&harness).await;
    assert_eq!(envelope.client_name.as_str(), "obama");
    assert_eq!(harness.broker.queue_len(queues::QUEUE_CLIENTS_DATA), 0);
}
