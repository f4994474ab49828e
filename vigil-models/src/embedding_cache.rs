//! The version-checked reference-embedding cache.
//!
//! Lookup order for a client's reference embedding:
//!
//! 1. the in-process map, valid while its recorded source mtime is not
//!    older than the enrolment directory's current mtime;
//! 2. the object-store record at
//!    `embeddings/<namespace>/<model_sig>/<client>.bin`, valid iff its
//!    recorded mtime equals the current one;
//! 3. computed from the enrolment image (detect-then-crop, or a centered
//!    crop as configured/fallback) and written through to both tiers.
//!
//! Duplicate concurrent computes are tolerated; the map takes the last
//! write. A storage write-through failure is logged only, the in-process
//! entry keeps serving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use vigil_common::users::UserDirectory;
use vigil_storage::{ObjectStore as _, ObjectStoreService};
use vigil_types::ClientName;

use crate::imaging;
use crate::metrics::{
    METRICS_ID_EMBEDDING_COMPUTED, METRICS_ID_EMBEDDING_HIT_LOCAL, METRICS_ID_EMBEDDING_HIT_STORE,
    METRICS_ID_EMBEDDING_MISSING,
};
use crate::runners::{
    FaceDetector as _, FaceDetectorService, FaceEmbedder as _, FaceEmbedderService,
};
use crate::{Embedding, ModelSignature};

/// How the enrolment image is reduced to a face patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceCrop {
    /// Detect the face and crop around it; falls back to the centered crop
    /// when detection finds nothing or fails.
    Detect,
    /// Always use a centered square crop.
    Center,
}

/// Side length of the centered fallback crop.
const CENTER_CROP_SIDE: u32 = 480;

/// Errors returned by [`EmbeddingCache::get_reference`].
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    /// The client has no (readable) enrolment image. Callers treat the
    /// identity check as failing, not as a server error.
    #[error("no reference image for client '{0}'")]
    Missing(ClientName),
    /// The embedding model failed.
    #[error("cannot compute reference embedding: {0}")]
    Model(eyre::Error),
}

#[derive(Clone)]
struct CachedEmbedding {
    vector: Embedding,
    source_mtime: u64,
}

/// Persisted embedding record (CBOR).
#[derive(Serialize, Deserialize)]
struct StoredEmbedding {
    vector: Vec<f32>,
    metadata: StoredMetadata,
}

#[derive(Serialize, Deserialize)]
struct StoredMetadata {
    source_mtime: u64,
    model_signature: String,
}

/// Content-addressed, version-checked reference-embedding cache.
#[derive(Clone)]
pub struct EmbeddingCache {
    users: Arc<UserDirectory>,
    store: ObjectStoreService,
    detector: FaceDetectorService,
    embedder: FaceEmbedderService,
    signature: ModelSignature,
    namespace: String,
    reference_crop: ReferenceCrop,
    local: Arc<RwLock<HashMap<ClientName, CachedEmbedding>>>,
}

impl EmbeddingCache {
    /// Creates the cache.
    pub fn new(
        users: Arc<UserDirectory>,
        store: ObjectStoreService,
        detector: FaceDetectorService,
        embedder: FaceEmbedderService,
        signature: ModelSignature,
        namespace: impl Into<String>,
        reference_crop: ReferenceCrop,
    ) -> Self {
        Self {
            users,
            store,
            detector,
            embedder,
            signature,
            namespace: namespace.into(),
            reference_crop,
            local: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Object-store key of a client's embedding record.
    pub fn record_key(&self, client: &ClientName) -> String {
        format!(
            "embeddings/{}/{}/{}.bin",
            self.namespace,
            self.signature,
            client.as_key_segment()
        )
    }

    /// Returns the client's reference embedding, honouring both cache tiers.
    pub async fn get_reference(&self, client: &ClientName) -> Result<Embedding, ReferenceError> {
        let Some(source_mtime) = self.users.source_mtime(client.as_str()).map(unix_seconds)
        else {
            ::metrics::counter!(METRICS_ID_EMBEDDING_MISSING).increment(1);
            return Err(ReferenceError::Missing(client.clone()));
        };

        if let Some(cached) = self.local.read().get(client)
            && cached.source_mtime >= source_mtime
        {
            ::metrics::counter!(METRICS_ID_EMBEDDING_HIT_LOCAL).increment(1);
            return Ok(cached.vector.clone());
        }

        if let Some(vector) = self.load_stored(client, source_mtime).await {
            ::metrics::counter!(METRICS_ID_EMBEDDING_HIT_STORE).increment(1);
            self.remember(client, vector.clone(), source_mtime);
            return Ok(vector);
        }

        let vector = self.compute(client).await?;
        ::metrics::counter!(METRICS_ID_EMBEDDING_COMPUTED).increment(1);
        self.remember(client, vector.clone(), source_mtime);
        self.write_through(client, &vector, source_mtime).await;
        Ok(vector)
    }

    async fn load_stored(&self, client: &ClientName, source_mtime: u64) -> Option<Embedding> {
        let key = self.record_key(client);
        let bytes = match self.store.get(&key).await {
            Ok(bytes) => bytes,
            Err(vigil_storage::StorageError::NotFound(_)) => return None,
            Err(err) => {
                tracing::warn!("cannot read embedding record '{key}': {err:?}");
                return None;
            }
        };
        let record: StoredEmbedding = match ciborium::from_reader(bytes.as_slice()) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!("corrupt embedding record '{key}': {err:?}");
                return None;
            }
        };
        if record.metadata.source_mtime != source_mtime
            || record.metadata.model_signature != self.signature.as_str()
        {
            tracing::debug!("stale embedding record '{key}' - recomputing");
            return None;
        }
        Some(Embedding(record.vector))
    }

    async fn compute(&self, client: &ClientName) -> Result<Embedding, ReferenceError> {
        let image_path = self.users.reference_image_path(client.as_str());
        let bytes = std::fs::read(&image_path).map_err(|err| {
            tracing::warn!("cannot read enrolment image {image_path:?}: {err:?}");
            ::metrics::counter!(METRICS_ID_EMBEDDING_MISSING).increment(1);
            ReferenceError::Missing(client.clone())
        })?;
        let image = imaging::decode_image(&bytes).map_err(ReferenceError::Model)?;

        let patch = match self.reference_crop {
            ReferenceCrop::Center => imaging::center_crop(&image, CENTER_CROP_SIDE, CENTER_CROP_SIDE),
            ReferenceCrop::Detect => match self.detector.detect_face(&image).await {
                Ok(Some(detection)) => imaging::square_crop_around(&image, detection.bbox),
                Ok(None) => {
                    tracing::warn!("no face found in enrolment image of '{client}' - using centered crop");
                    imaging::center_crop(&image, CENTER_CROP_SIDE, CENTER_CROP_SIDE)
                }
                Err(err) => {
                    tracing::warn!("enrolment detection failed for '{client}': {err:?} - using centered crop");
                    imaging::center_crop(&image, CENTER_CROP_SIDE, CENTER_CROP_SIDE)
                }
            },
        };
        self.embedder
            .embed(&patch)
            .await
            .map_err(ReferenceError::Model)
    }

    fn remember(&self, client: &ClientName, vector: Embedding, source_mtime: u64) {
        self.local.write().insert(
            client.clone(),
            CachedEmbedding {
                vector,
                source_mtime,
            },
        );
    }

    async fn write_through(&self, client: &ClientName, vector: &Embedding, source_mtime: u64) {
        let record = StoredEmbedding {
            vector: vector.0.clone(),
            metadata: StoredMetadata {
                source_mtime,
                model_signature: self.signature.as_str().to_owned(),
            },
        };
        let mut bytes = Vec::new();
        if let Err(err) = ciborium::into_writer(&record, &mut bytes) {
            tracing::warn!("cannot encode embedding record: {err:?}");
            return;
        }
        let key = self.record_key(client);
        if let Err(err) = self
            .store
            .put(&key, bytes, "application/octet-stream")
            .await
        {
            // in-process entry still serves subsequent requests
            tracing::warn!("cannot persist embedding record '{key}': {err:?}");
        }
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
