//! The four model facades the pipeline invokes.
//!
//! All of them are stateless from the caller's perspective and shared as
//! trait objects. Implementations must be warmable: pipelines run one dummy
//! inference per runner at startup and treat a warmup failure as fatal.

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;
use vigil_types::BBox;

use crate::Embedding;

/// A detected object and its confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Bounding box in frame coordinates.
    pub bbox: BBox,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Result of the anti-spoof model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpoofOutcome {
    /// Whether the model considers the patch a live face.
    pub is_real: bool,
    /// Confidence of the classification.
    pub score: f32,
}

impl SpoofOutcome {
    /// The pipeline treats a patch as spoofed iff the model said "not real"
    /// *with at least* the configured confidence.
    pub fn is_spoof(&self, threshold: f32) -> bool {
        !self.is_real && self.score >= threshold
    }
}

/// Dynamic trait object for the face detector.
pub type FaceDetectorService = Arc<dyn FaceDetector + Send + Sync>;
/// Dynamic trait object for the face embedder.
pub type FaceEmbedderService = Arc<dyn FaceEmbedder + Send + Sync>;
/// Dynamic trait object for the anti-spoof model.
pub type SpoofCheckerService = Arc<dyn SpoofChecker + Send + Sync>;
/// Dynamic trait object for the phone detector.
pub type PhoneDetectorService = Arc<dyn PhoneDetector + Send + Sync>;

/// Finds the strongest face in a frame.
#[async_trait]
pub trait FaceDetector {
    /// Returns the highest-confidence face above the model's threshold, or
    /// `None` when the frame holds no detectable face.
    async fn detect_face(&self, frame: &RgbImage) -> eyre::Result<Option<Detection>>;

    /// Runs one dummy inference so the first real frame is not penalised.
    async fn warmup(&self) -> eyre::Result<()>;
}

/// Computes the identity embedding of a face patch.
#[async_trait]
pub trait FaceEmbedder {
    /// Embeds the given face patch.
    async fn embed(&self, patch: &RgbImage) -> eyre::Result<Embedding>;

    /// Runs one dummy inference so the first real frame is not penalised.
    async fn warmup(&self) -> eyre::Result<()>;
}

/// Classifies a face patch as live or spoofed.
#[async_trait]
pub trait SpoofChecker {
    /// Checks the face at `bbox` within `frame`.
    async fn check_spoof(&self, frame: &RgbImage, bbox: BBox) -> eyre::Result<SpoofOutcome>;

    /// Runs one dummy inference so the first real frame is not penalised.
    async fn warmup(&self) -> eyre::Result<()>;
}

/// Finds a phone in a frame.
#[async_trait]
pub trait PhoneDetector {
    /// Returns the detected phone above the model's threshold, if any.
    async fn detect_phone(&self, frame: &RgbImage) -> eyre::Result<Option<Detection>>;

    /// Runs one dummy inference so the first real frame is not penalised.
    async fn warmup(&self) -> eyre::Result<()>;
}
