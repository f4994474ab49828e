#![deny(missing_docs)]
//! Client-status snapshot capability.
//!
//! The gateway mirrors its live view of connected clients into a key/value
//! store so that admin tooling (and the server manager) can read it without
//! broker access. The snapshot is a single hash, `Clients_status`, with one
//! JSON string-list per status bucket.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};

/// Name of the hash holding the snapshot.
pub const STATUS_HASH: &str = "Clients_status";

/// The status buckets of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBucket {
    /// Clients with a live session.
    Active,
    /// Clients an admin paused; frames are answered with a warning.
    Paused,
    /// Clients an admin blocked; connections are closed.
    Blocked,
    /// Enrolled clients without a live session.
    Deactivated,
    /// Clients whose last close looked like a connectivity failure.
    ConnectivityError,
    /// Clients scheduled to be closed by an admin.
    ToClose,
}

impl StatusBucket {
    /// Every bucket, in snapshot order.
    pub const ALL: [StatusBucket; 6] = [
        StatusBucket::Active,
        StatusBucket::Paused,
        StatusBucket::Blocked,
        StatusBucket::Deactivated,
        StatusBucket::ConnectivityError,
        StatusBucket::ToClose,
    ];

    /// The hash field this bucket is stored under.
    pub fn key(&self) -> &'static str {
        match self {
            StatusBucket::Active => "active_clients",
            StatusBucket::Paused => "paused_clients",
            StatusBucket::Blocked => "blocked_clients",
            StatusBucket::Deactivated => "deactivate_clients",
            StatusBucket::ConnectivityError => "connecting_internet_error",
            StatusBucket::ToClose => "clients_to_close",
        }
    }

    /// Reverse of [`StatusBucket::key`].
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|bucket| bucket.key() == key)
    }
}

/// The full six-bucket snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Clients with a live session.
    #[serde(default)]
    pub active_clients: Vec<String>,
    /// Paused clients.
    #[serde(default)]
    pub paused_clients: Vec<String>,
    /// Blocked clients.
    #[serde(default)]
    pub blocked_clients: Vec<String>,
    /// Enrolled clients without a live session.
    #[serde(default)]
    pub deactivate_clients: Vec<String>,
    /// Clients that dropped with a connectivity error.
    #[serde(default)]
    pub connecting_internet_error: Vec<String>,
    /// Clients scheduled to be closed.
    #[serde(default)]
    pub clients_to_close: Vec<String>,
}

impl StatusSnapshot {
    /// Read access by bucket.
    pub fn bucket(&self, bucket: StatusBucket) -> &Vec<String> {
        match bucket {
            StatusBucket::Active => &self.active_clients,
            StatusBucket::Paused => &self.paused_clients,
            StatusBucket::Blocked => &self.blocked_clients,
            StatusBucket::Deactivated => &self.deactivate_clients,
            StatusBucket::ConnectivityError => &self.connecting_internet_error,
            StatusBucket::ToClose => &self.clients_to_close,
        }
    }

    /// Write access by bucket.
    pub fn bucket_mut(&mut self, bucket: StatusBucket) -> &mut Vec<String> {
        match bucket {
            StatusBucket::Active => &mut self.active_clients,
            StatusBucket::Paused => &mut self.paused_clients,
            StatusBucket::Blocked => &mut self.blocked_clients,
            StatusBucket::Deactivated => &mut self.deactivate_clients,
            StatusBucket::ConnectivityError => &mut self.connecting_internet_error,
            StatusBucket::ToClose => &mut self.clients_to_close,
        }
    }
}

/// Errors surfaced by status-store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// The key/value backend failed.
    #[error("status store error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StatusError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Dynamic trait object for the status-store capability.
pub type StatusStoreService = Arc<dyn StatusStore + Send + Sync>;

/// The status-store capability.
#[async_trait]
pub trait StatusStore {
    /// Reads the whole snapshot. Missing buckets read as empty.
    async fn snapshot(&self) -> Result<StatusSnapshot, StatusError>;

    /// Replaces one bucket.
    async fn replace_bucket(
        &self,
        bucket: StatusBucket,
        names: Vec<String>,
    ) -> Result<(), StatusError>;

    /// Appends `name` to `bucket` unless already present.
    async fn append(&self, bucket: StatusBucket, name: &str) -> Result<(), StatusError>;

    /// Writes the empty six-bucket layout iff the snapshot is absent.
    async fn prime(&self) -> Result<(), StatusError>;
}

/// Redis implementation of the [`StatusStore`] capability.
#[derive(Clone)]
pub struct RedisStatusStore {
    connection: redis::aio::ConnectionManager,
}

impl RedisStatusStore {
    /// Connects to Redis through a connection manager.
    pub async fn connect(url: &SecretString) -> Result<Self, StatusError> {
        let client = redis::Client::open(url.expose_secret())?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn snapshot(&self) -> Result<StatusSnapshot, StatusError> {
        let mut connection = self.connection.clone();
        let raw: std::collections::HashMap<String, String> =
            connection.hgetall(STATUS_HASH).await?;
        let mut snapshot = StatusSnapshot::default();
        for (key, value) in raw {
            let Some(bucket) = StatusBucket::from_key(&key) else {
                continue;
            };
            match serde_json::from_str(&value) {
                Ok(names) => *snapshot.bucket_mut(bucket) = names,
                Err(err) => {
                    tracing::warn!("unreadable status bucket '{key}': {err:?}");
                }
            }
        }
        Ok(snapshot)
    }

    async fn replace_bucket(
        &self,
        bucket: StatusBucket,
        names: Vec<String>,
    ) -> Result<(), StatusError> {
        let mut connection = self.connection.clone();
        let value = serde_json::to_string(&names)
            .map_err(|err| StatusError::Backend(err.to_string()))?;
        let _: () = connection.hset(STATUS_HASH, bucket.key(), value).await?;
        Ok(())
    }

    async fn append(&self, bucket: StatusBucket, name: &str) -> Result<(), StatusError> {
        let mut names = self.snapshot().await?.bucket(bucket).clone();
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_owned());
            self.replace_bucket(bucket, names).await?;
        }
        Ok(())
    }

    async fn prime(&self) -> Result<(), StatusError> {
        let mut connection = self.connection.clone();
        let exists: bool = connection.exists(STATUS_HASH).await?;
        if !exists {
            for bucket in StatusBucket::ALL {
                self.replace_bucket(bucket, Vec::new()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_keys_round_trip() {
        for bucket in StatusBucket::ALL {
            assert_eq!(StatusBucket::from_key(bucket.key()), Some(bucket));
        }
        assert_eq!(StatusBucket::from_key("nope"), None);
    }

    #[test]
    fn snapshot_defaults_missing_buckets() {
        let snapshot: StatusSnapshot =
            serde_json::from_str(r#"{"paused_clients":["obama"]}"#).unwrap();
        assert_eq!(snapshot.paused_clients, vec!["obama"]);
        assert!(snapshot.active_clients.is_empty());
        assert_eq!(
            snapshot.bucket(StatusBucket::Paused),
            &vec!["obama".to_owned()]
        );
    }
}
