//! The saved-action writer.
//!
//! Records arrive on `saved_actions` with their annotated snapshot and a
//! deterministic object key, so redeliveries overwrite rather than
//! duplicate. When object storage is down the snapshot is written under the
//! local data directory instead, using the same key layout.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use vigil_broker::{Broker as _, BrokerService, HandlerError, QueueSpec, consume_each};
use vigil_storage::{ObjectStore as _, ObjectStoreService};
use vigil_types::messages::SavedAction;
use vigil_types::queues;

use crate::metrics::{
    METRICS_ID_MANAGER_SAVED_FALLBACK, METRICS_ID_MANAGER_SAVED_WRITTEN,
};

/// The saved-action persistence worker.
pub struct SavedActionWriter {
    broker: BrokerService,
    store: ObjectStoreService,
    fallback_dir: PathBuf,
}

impl SavedActionWriter {
    /// Creates the writer. `fallback_dir` is the local data directory used
    /// when object storage rejects the write.
    pub fn new(broker: BrokerService, store: ObjectStoreService, fallback_dir: PathBuf) -> Self {
        Self {
            broker,
            store,
            fallback_dir,
        }
    }

    /// Declares the queue this writer consumes.
    pub async fn declare_topology(&self) -> eyre::Result<()> {
        self.broker
            .declare_queue(QueueSpec::plain(queues::QUEUE_SAVED_ACTIONS))
            .await?;
        Ok(())
    }

    /// Consumes `saved_actions` until the token is cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) -> eyre::Result<()> {
        consume_each(
            self.broker.clone(),
            queues::QUEUE_SAVED_ACTIONS,
            cancellation_token,
            |payload| self.persist(payload),
        )
        .await?;
        Ok(())
    }

    async fn persist(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
        let record: SavedAction = vigil_broker::decode_cbor(&payload)
            .map_err(|err| HandlerError::Discard(format!("bad saved action: {err}")))?;
        let (Some(jpeg), Some(key)) = (&record.annotated_jpeg, &record.action_object_key) else {
            tracing::debug!(
                "saved action of '{}' carries no snapshot - nothing to persist",
                record.client_name
            );
            return Ok(());
        };
        match self
            .store
            .put(key, jpeg.clone(), vigil_storage::IMAGE_CONTENT_TYPE)
            .await
        {
            Ok(()) => {
                tracing::info!("persisted action snapshot at '{key}'");
                ::metrics::counter!(METRICS_ID_MANAGER_SAVED_WRITTEN).increment(1);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("cannot persist '{key}' to object storage: {err:?}");
                self.write_fallback(key, jpeg).await;
                Ok(())
            }
        }
    }

    async fn write_fallback(&self, key: &str, jpeg: &[u8]) {
        let path = self.fallback_dir.join(key);
        if let Some(parent) = path.parent()
            && let Err(err) = tokio::fs::create_dir_all(parent).await
        {
            tracing::error!("cannot create fallback directory {parent:?}: {err:?}");
            return;
        }
        match tokio::fs::write(&path, jpeg).await {
            Ok(()) => {
                tracing::info!("persisted action snapshot at fallback path {path:?}");
                ::metrics::counter!(METRICS_ID_MANAGER_SAVED_FALLBACK).increment(1);
            }
            Err(err) => tracing::error!("cannot write fallback file {path:?}: {err:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use vigil_storage::{ObjectInfo, ObjectStore, StorageError};
    use vigil_test_utils::{MemoryBroker, MemoryObjectStore};
    use vigil_types::{Action, Branch, ClientName, Reason};

    use super::*;

    fn record(with_snapshot: bool) -> SavedAction {
        SavedAction {
            client_name: ClientName::parse("obama").unwrap(),
            action: Action::LockScreen,
            reason: Reason::WrongUser,
            branch: Branch::Face,
            annotated_jpeg: with_snapshot.then(|| vec![0xff, 0xd8, 0xff, 0xd9]),
            action_object_key: with_snapshot.then(|| {
                "actions/Lock_screen/obama/20250101T000000000000Z__Lock_screen__Wrong_user.jpg"
                    .to_owned()
            }),
            action_bucket: Some("test-bucket".to_owned()),
            source_object_key: "frames/obama/x.jpg".to_owned(),
            source_bucket: "test-bucket".to_owned(),
            source_content_type: "image/jpeg".to_owned(),
            storage_provider: "memory".to_owned(),
            recognition_metric_value: None,
            recognition_threshold: None,
            send_time: "10-00-00".to_owned(),
            finish_time: "10-00-01".to_owned(),
        }
    }

    fn encode(record: &SavedAction) -> Vec<u8> {
        let mut bytes = Vec::new();
        ciborium::into_writer(record, &mut bytes).unwrap();
        bytes
    }

    #[tokio::test]
    async fn writes_snapshot_under_its_deterministic_key() {
        let store = Arc::new(MemoryObjectStore::default());
        let writer = SavedActionWriter::new(
            Arc::new(MemoryBroker::default()),
            store.clone(),
            PathBuf::from("/tmp/unused"),
        );
        writer.persist(encode(&record(true))).await.unwrap();
        assert!(store.contains(
            "actions/Lock_screen/obama/20250101T000000000000Z__Lock_screen__Wrong_user.jpg"
        ));
    }

    #[tokio::test]
    async fn record_without_snapshot_is_acked_silently() {
        let store = Arc::new(MemoryObjectStore::default());
        let writer = SavedActionWriter::new(
            Arc::new(MemoryBroker::default()),
            store.clone(),
            PathBuf::from("/tmp/unused"),
        );
        writer.persist(encode(&record(false))).await.unwrap();
        assert!(store.is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        async fn put(&self, key: &str, _: Vec<u8>, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend(format!("put '{key}': unavailable")))
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(key.to_owned()))
        }
        async fn list(&self, _: &str) -> Result<Vec<ObjectInfo>, StorageError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn bucket(&self) -> &str {
            "broken"
        }
        fn provider(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn storage_failure_falls_back_to_the_local_directory() {
        let fallback = tempfile::tempdir().unwrap();
        let writer = SavedActionWriter::new(
            Arc::new(MemoryBroker::default()),
            Arc::new(BrokenStore),
            fallback.path().to_path_buf(),
        );
        writer.persist(encode(&record(true))).await.unwrap();
        let expected = fallback.path().join(
            "actions/Lock_screen/obama/20250101T000000000000Z__Lock_screen__Wrong_user.jpg",
        );
        assert_eq!(
            std::fs::read(expected).unwrap(),
            vec![0xff, 0xd8, 0xff, 0xd9]
        );
    }
}
