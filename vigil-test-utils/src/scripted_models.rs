//! Scripted model runners.
//!
//! Tests configure the outcome per branch; embeddings are served from a
//! queue so a scenario can hand the reference computation and the probe
//! different vectors.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;
use parking_lot::Mutex;
use vigil_models::Embedding;
use vigil_models::runners::{
    Detection, FaceDetector, FaceEmbedder, PhoneDetector, SpoofChecker, SpoofOutcome,
};
use vigil_types::BBox;

#[derive(Clone)]
struct Script {
    face: Result<Option<Detection>, String>,
    phone: Result<Option<Detection>, String>,
    spoof: SpoofOutcome,
    default_embedding: Embedding,
}

/// Scripted implementation of all four runner traits.
#[derive(Clone)]
pub struct ScriptedModels {
    script: Arc<Mutex<Script>>,
    embeddings: Arc<Mutex<VecDeque<Embedding>>>,
}

impl Default for ScriptedModels {
    fn default() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                face: Ok(Some(Detection {
                    bbox: BBox::from([100, 80, 220, 200]),
                    confidence: 0.95,
                })),
                phone: Ok(None),
                spoof: SpoofOutcome {
                    is_real: true,
                    score: 0.9,
                },
                default_embedding: Embedding(vec![1.0, 0.0]),
            })),
            embeddings: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl ScriptedModels {
    /// Sets the face-detection outcome.
    pub fn set_face(&self, detection: Option<Detection>) {
        self.script.lock().face = Ok(detection);
    }

    /// Makes face detection fail.
    pub fn fail_face(&self, error: impl Into<String>) {
        self.script.lock().face = Err(error.into());
    }

    /// Sets the phone-detection outcome.
    pub fn set_phone(&self, detection: Option<Detection>) {
        self.script.lock().phone = Ok(detection);
    }

    /// Makes phone detection fail.
    pub fn fail_phone(&self, error: impl Into<String>) {
        self.script.lock().phone = Err(error.into());
    }

    /// Sets the anti-spoof outcome.
    pub fn set_spoof(&self, outcome: SpoofOutcome) {
        self.script.lock().spoof = outcome;
    }

    /// Embedding every call returns when the queue is empty.
    pub fn set_default_embedding(&self, embedding: Embedding) {
        self.script.lock().default_embedding = embedding;
    }

    /// Queues an embedding for the next `embed` call.
    pub fn push_embedding(&self, embedding: Embedding) {
        self.embeddings.lock().push_back(embedding);
    }
}

fn scripted_error(context: &str, message: &str) -> eyre::Report {
    eyre::eyre!("{context}: {message}")
}

#[async_trait]
impl FaceDetector for ScriptedModels {
    async fn detect_face(&self, _frame: &RgbImage) -> eyre::Result<Option<Detection>> {
        self.script
            .lock()
            .face
            .clone()
            .map_err(|message| scripted_error("face detector", &message))
    }

    async fn warmup(&self) -> eyre::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PhoneDetector for ScriptedModels {
    async fn detect_phone(&self, _frame: &RgbImage) -> eyre::Result<Option<Detection>> {
        self.script
            .lock()
            .phone
            .clone()
            .map_err(|message| scripted_error("phone detector", &message))
    }

    async fn warmup(&self) -> eyre::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FaceEmbedder for ScriptedModels {
    async fn embed(&self, _patch: &RgbImage) -> eyre::Result<Embedding> {
        if let Some(queued) = self.embeddings.lock().pop_front() {
            return Ok(queued);
        }
        Ok(self.script.lock().default_embedding.clone())
    }

    async fn warmup(&self) -> eyre::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SpoofChecker for ScriptedModels {
    async fn check_spoof(&self, _frame: &RgbImage, _bbox: BBox) -> eyre::Result<SpoofOutcome> {
        Ok(self.script.lock().spoof)
    }

    async fn warmup(&self) -> eyre::Result<()> {
        Ok(())
    }
}
