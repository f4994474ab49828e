#![deny(missing_docs)]
//! Object-store capability for the vigil pipeline.
//!
//! Frames never travel on the broker; the gateway uploads the JPEG bytes
//! here and every downstream stage hydrates them on demand through the
//! [`ObjectStore`] trait. The production backend is S3-compatible storage
//! (see [`s3`]); retention of the `frames/` prefix is enforced by a bucket
//! lifecycle rule, with an optional in-process sweep (see [`cleanup`]) for
//! deployments where lifecycle rules are unavailable. Correctness never
//! depends on deletion.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use vigil_types::ClientName;

pub mod cleanup;
pub mod s3;

/// Key prefix under which client frames are stored.
pub const FRAMES_PREFIX: &str = "frames/";
/// Key prefix under which annotated action snapshots are stored.
pub const ACTIONS_PREFIX: &str = "actions/";
/// Content type of stored frames and snapshots.
pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// Dynamic trait object for the object-store capability.
///
/// Must be `Send + Sync` to be shared across tasks.
pub type ObjectStoreService = Arc<dyn ObjectStore + Send + Sync>;

/// Errors surfaced by object-store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The key does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Listing entry returned by [`ObjectStore::list`].
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Full object key.
    pub key: String,
    /// Last modification time, when the backend reports one.
    pub last_modified: Option<SystemTime>,
}

/// The object-store capability.
#[async_trait]
pub trait ObjectStore {
    /// Stores `bytes` under `key`, overwriting any previous object.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str)
    -> Result<(), StorageError>;

    /// Fetches the bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Lists objects under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Deletes `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// The bucket this store writes to.
    fn bucket(&self) -> &str;

    /// Identifier of the backend, carried in frame envelopes.
    fn provider(&self) -> &str;
}

/// Builds the unique object key for a freshly captured frame:
/// `frames/<client>/<utc stamp>-<nonce>.jpg`.
pub fn frame_key(client: &ClientName) -> String {
    use rand::Rng as _;
    let stamp = vigil_types::object_key_stamp(chrono::Utc::now());
    let nonce: u64 = rand::thread_rng().r#gen();
    format!(
        "{FRAMES_PREFIX}{}/{stamp}-{:012x}.jpg",
        client.as_key_segment(),
        nonce & 0xffff_ffff_ffff
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_keys_are_unique_and_scoped_to_the_client() {
        let client = ClientName::parse("Ada Lovelace").unwrap();
        let first = frame_key(&client);
        let second = frame_key(&client);
        assert!(first.starts_with("frames/ada_lovelace/"));
        assert!(first.ends_with(".jpg"));
        assert_ne!(first, second);
    }
}
