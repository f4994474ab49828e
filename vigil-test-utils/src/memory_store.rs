//! In-memory [`ObjectStore`].

use std::collections::BTreeMap;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use vigil_storage::{ObjectInfo, ObjectStore, StorageError};

struct StoredObject {
    bytes: Vec<u8>,
    last_modified: SystemTime,
}

/// In-memory object store for tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Whether the given key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    /// Backdates an object so cleanup tests can age it.
    pub fn set_last_modified(&self, key: &str, last_modified: SystemTime) {
        if let Some(object) = self.objects.lock().get_mut(key) {
            object.last_modified = last_modified;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), StorageError> {
        self.objects.lock().insert(
            key.to_owned(),
            StoredObject {
                bytes,
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_owned()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                last_modified: Some(object.last_modified),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().remove(key);
        Ok(())
    }

    fn bucket(&self) -> &str {
        "test-bucket"
    }

    fn provider(&self) -> &str {
        "memory"
    }
}
