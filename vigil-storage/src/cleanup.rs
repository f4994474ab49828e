//! Periodic frame cleanup for stores without lifecycle support.
//!
//! The sweep is best-effort and bounded per pass; the lifecycle rule remains
//! the authoritative retention mechanism where the backend supports it.

use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::{FRAMES_PREFIX, ObjectStore as _, ObjectStoreService};

/// Settings for the cleanup sweep.
#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Objects older than this are deleted.
    pub max_age: Duration,
    /// Upper bound on deletions per pass.
    pub max_objects_per_pass: usize,
}

/// Runs the sweep until the token is cancelled.
pub async fn cleanup_sweep_task(
    store: ObjectStoreService,
    config: CleanupConfig,
    cancellation_token: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.interval);
    // first tick triggers instantly
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancellation_token.cancelled() => break,
        }
        let removed = sweep_once(&store, config).await;
        if removed > 0 {
            tracing::info!(
                "cleanup removed {removed} frame object(s) older than {:?}",
                config.max_age
            );
        }
    }
}

pub(crate) async fn sweep_once(store: &ObjectStoreService, config: CleanupConfig) -> usize {
    let cutoff = SystemTime::now() - config.max_age;
    let objects = match store.list(FRAMES_PREFIX).await {
        Ok(objects) => objects,
        Err(err) => {
            tracing::error!("cleanup listing failed: {err:?}");
            return 0;
        }
    };
    let mut removed = 0;
    for object in objects {
        let Some(last_modified) = object.last_modified else {
            continue;
        };
        if last_modified >= cutoff {
            continue;
        }
        match store.delete(&object.key).await {
            Ok(()) => removed += 1,
            Err(err) => tracing::warn!("cannot remove old object '{}': {err:?}", object.key),
        }
        if removed >= config.max_objects_per_pass {
            break;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{ObjectInfo, ObjectStore, StorageError};

    #[derive(Default)]
    struct AgedStore(Mutex<HashMap<String, SystemTime>>);

    #[async_trait]
    impl ObjectStore for AgedStore {
        async fn put(&self, key: &str, _: Vec<u8>, _: &str) -> Result<(), StorageError> {
            self.0.lock().insert(key.to_owned(), SystemTime::now());
            Ok(())
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(key.to_owned()))
        }
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
            Ok(self
                .0
                .lock()
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, time)| ObjectInfo {
                    key: key.clone(),
                    last_modified: Some(*time),
                })
                .collect())
        }
        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.0.lock().remove(key);
            Ok(())
        }
        fn bucket(&self) -> &str {
            "aged"
        }
        fn provider(&self) -> &str {
            "memory"
        }
    }

    #[tokio::test]
    async fn removes_only_expired_frame_objects() {
        let store = Arc::new(AgedStore::default());
        let old = SystemTime::now() - Duration::from_secs(3 * 3600);
        store.0.lock().insert("frames/obama/old.jpg".to_owned(), old);
        store
            .0
            .lock()
            .insert("frames/obama/fresh.jpg".to_owned(), SystemTime::now());
        store
            .0
            .lock()
            .insert("actions/Sign_out/obama/kept.jpg".to_owned(), old);

        let removed = sweep_once(
            &(store.clone() as ObjectStoreService),
            CleanupConfig {
                interval: Duration::from_secs(3600),
                max_age: Duration::from_secs(2 * 3600),
                max_objects_per_pass: 100,
            },
        )
        .await;

        assert_eq!(removed, 1);
        let keys = store.0.lock();
        assert!(!keys.contains_key("frames/obama/old.jpg"));
        assert!(keys.contains_key("frames/obama/fresh.jpg"));
        // the sweep only ever touches the frames prefix
        assert!(keys.contains_key("actions/Sign_out/obama/kept.jpg"));
    }
}
