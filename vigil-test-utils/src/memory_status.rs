//! In-memory [`StatusStore`].

use async_trait::async_trait;
use parking_lot::Mutex;
use vigil_status::{StatusBucket, StatusError, StatusSnapshot, StatusStore};

/// In-memory status store for tests.
#[derive(Default)]
pub struct MemoryStatusStore {
    snapshot: Mutex<StatusSnapshot>,
}

impl MemoryStatusStore {
    /// Pre-populates one bucket, for arranging test scenarios.
    pub fn seed(&self, bucket: StatusBucket, names: &[&str]) {
        *self.snapshot.lock().bucket_mut(bucket) =
            names.iter().map(|name| (*name).to_owned()).collect();
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn snapshot(&self) -> Result<StatusSnapshot, StatusError> {
        Ok(self.snapshot.lock().clone())
    }

    async fn replace_bucket(
        &self,
        bucket: StatusBucket,
        names: Vec<String>,
    ) -> Result<(), StatusError> {
        *self.snapshot.lock().bucket_mut(bucket) = names;
        Ok(())
    }

    async fn append(&self, bucket: StatusBucket, name: &str) -> Result<(), StatusError> {
        let mut snapshot = self.snapshot.lock();
        let names = snapshot.bucket_mut(bucket);
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_owned());
        }
        Ok(())
    }

    async fn prime(&self) -> Result<(), StatusError> {
        Ok(())
    }
}
