//! The fakes must honour the same contracts as the real backends, or every
//! test built on them lies.

use std::sync::Arc;
use std::time::Duration;

use vigil_broker::{Broker as _, BrokerService, Delivery as _, QueueSpec, Subscription as _};
use vigil_storage::{ObjectStore as _, ObjectStoreService};
use vigil_test_utils::{MemoryBroker, MemoryObjectStore, sample_jpeg};

#[tokio::test]
async fn store_round_trip_is_byte_identical() {
    let store: ObjectStoreService = Arc::new(MemoryObjectStore::default());
    let bytes = sample_jpeg(32, 32);
    store
        .put("frames/obama/a.jpg", bytes.clone(), "image/jpeg")
        .await
        .unwrap();
    assert_eq!(store.get("frames/obama/a.jpg").await.unwrap(), bytes);
    assert!(store.get("frames/obama/b.jpg").await.is_err());

    let listed = store.list("frames/obama/").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, "frames/obama/a.jpg");
}

#[tokio::test]
async fn bounded_queue_drops_the_head() {
    let memory = MemoryBroker::default();
    let broker: BrokerService = Arc::new(memory.clone());
    broker
        .declare_queue(QueueSpec::plain("bounded").with_max_length(2))
        .await
        .unwrap();
    for payload in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
        broker.publish("", "bounded", payload).await.unwrap();
    }
    assert_eq!(memory.queue_len("bounded"), 2);
    let mut subscription = broker.subscribe("bounded").await.unwrap();
    let first = subscription.next().await.unwrap().unwrap();
    assert_eq!(first.payload(), b"two");
    first.ack().await.unwrap();
}

#[tokio::test]
async fn requeue_puts_the_message_back_in_front() {
    let broker: BrokerService = Arc::new(MemoryBroker::default());
    broker
        .declare_queue(QueueSpec::plain("work"))
        .await
        .unwrap();
    broker.publish("", "work", b"first".to_vec()).await.unwrap();
    broker.publish("", "work", b"second".to_vec()).await.unwrap();

    let mut subscription = broker.subscribe("work").await.unwrap();
    let delivery = subscription.next().await.unwrap().unwrap();
    assert_eq!(delivery.payload(), b"first");
    delivery.requeue().await.unwrap();

    let redelivered = tokio::time::timeout(Duration::from_secs(1), subscription.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.payload(), b"first");
    redelivered.ack().await.unwrap();
}

#[tokio::test]
async fn direct_exchange_fans_out_to_all_bound_queues() {
    let broker: BrokerService = Arc::new(MemoryBroker::default());
    broker.declare_exchange("results").await.unwrap();
    broker
        .declare_queue(QueueSpec::bound("queue_a", "results", "shared_key"))
        .await
        .unwrap();
    broker
        .declare_queue(QueueSpec::bound("queue_b", "results", "shared_key"))
        .await
        .unwrap();
    broker
        .declare_queue(QueueSpec::bound("queue_c", "results", "other_key"))
        .await
        .unwrap();

    broker
        .publish("results", "shared_key", b"payload".to_vec())
        .await
        .unwrap();

    for queue in ["queue_a", "queue_b"] {
        let mut subscription = broker.subscribe(queue).await.unwrap();
        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload(), b"payload");
        delivery.ack().await.unwrap();
    }
}

#[tokio::test]
async fn unbound_routing_key_reaches_nobody() {
    let memory = MemoryBroker::default();
    let broker: BrokerService = Arc::new(memory.clone());
    broker.declare_exchange("results").await.unwrap();
    broker
        .declare_queue(QueueSpec::bound("queue_c", "results", "other_key"))
        .await
        .unwrap();
    broker
        .publish("results", "shared_key", b"payload".to_vec())
        .await
        .unwrap();
    assert_eq!(memory.queue_len("queue_c"), 0);
}
