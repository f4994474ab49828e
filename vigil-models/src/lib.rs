#![deny(missing_docs)]
//! Model-runner facades for the vigil pipeline.
//!
//! The models themselves live outside the core: this crate fixes their I/O
//! shapes as traits (see [`runners`]), ships the production HTTP client that
//! fronts a detection service (see [`http`]), the pixel-level helpers that
//! replace a vision toolkit (see [`imaging`]), and the version-checked
//! reference-embedding cache (see [`embedding_cache`]).
//!
//! Identity verification is deliberately *not* a remote call: it is plain
//! vector math over two embeddings (see [`VerifyMetric`]), so only the
//! embedding computation touches a model.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

pub mod embedding_cache;
pub mod http;
pub mod imaging;
pub mod metrics;
pub mod runners;

/// A face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(
    /// The raw vector components.
    pub Vec<f32>,
);

impl Embedding {
    fn norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    fn dot(&self, other: &Self) -> f32 {
        self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum()
    }
}

/// Metric used to compare a probe embedding against the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMetric {
    /// Higher is closer; verified iff `score >= threshold`.
    CosineSimilarity,
    /// Lower is closer; verified iff `distance <= threshold`.
    Euclidean,
}

impl VerifyMetric {
    /// Stable name, part of the model signature.
    pub fn name(&self) -> &'static str {
        match self {
            VerifyMetric::CosineSimilarity => "cosine_similarity",
            VerifyMetric::Euclidean => "euclidean",
        }
    }

    /// Compares `probe` against `reference`.
    pub fn verify(&self, probe: &Embedding, reference: &Embedding, threshold: f32) -> VerifyOutcome {
        let distance = match self {
            VerifyMetric::CosineSimilarity => {
                let denominator = probe.norm() * reference.norm();
                if denominator == 0.0 {
                    0.0
                } else {
                    probe.dot(reference) / denominator
                }
            }
            VerifyMetric::Euclidean => probe
                .0
                .iter()
                .zip(&reference.0)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt(),
        };
        let verified = match self {
            VerifyMetric::CosineSimilarity => distance >= threshold,
            VerifyMetric::Euclidean => distance <= threshold,
        };
        VerifyOutcome {
            verified,
            distance,
            threshold,
        }
    }
}

/// Result of an identity comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyOutcome {
    /// Whether the probe matches the reference under the metric.
    pub verified: bool,
    /// The raw metric value.
    pub distance: f32,
    /// The threshold the value was compared against.
    pub threshold: f32,
}

/// Cache-busting identity of the deployed identity model.
///
/// `SHA1(model_name ‖ weights_id ‖ metric_name)`; embedding-cache records
/// made by a different model version land under a different key and are
/// therefore invisible to this deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSignature(String);

impl ModelSignature {
    /// Derives the signature for the given model identity.
    pub fn derive(model_name: &str, weights_id: &str, metric: VerifyMetric) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(model_name.as_bytes());
        hasher.update(weights_id.as_bytes());
        hasher.update(metric.name().as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// The signature as lowercase hex.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_verifies_above_threshold() {
        let reference = Embedding(vec![1.0, 0.0]);
        let same = Embedding(vec![2.0, 0.0]);
        let orthogonal = Embedding(vec![0.0, 1.0]);
        let outcome = VerifyMetric::CosineSimilarity.verify(&same, &reference, 0.25);
        assert!(outcome.verified);
        assert!((outcome.distance - 1.0).abs() < 1e-6);
        assert!(!VerifyMetric::CosineSimilarity.verify(&orthogonal, &reference, 0.25).verified);
    }

    #[test]
    fn euclidean_verifies_below_threshold() {
        let reference = Embedding(vec![0.0, 0.0]);
        let near = Embedding(vec![0.1, 0.0]);
        let far = Embedding(vec![3.0, 4.0]);
        assert!(VerifyMetric::Euclidean.verify(&near, &reference, 0.5).verified);
        let outcome = VerifyMetric::Euclidean.verify(&far, &reference, 0.5);
        assert!(!outcome.verified);
        assert!((outcome.distance - 5.0).abs() < 1e-6);
    }

    #[test]
    fn signature_changes_with_every_component() {
        let base = ModelSignature::derive("r100", "v1", VerifyMetric::CosineSimilarity);
        assert_eq!(base.as_str().len(), 40);
        assert_ne!(
            base,
            ModelSignature::derive("r50", "v1", VerifyMetric::CosineSimilarity)
        );
        assert_ne!(
            base,
            ModelSignature::derive("r100", "v2", VerifyMetric::CosineSimilarity)
        );
        assert_ne!(
            base,
            ModelSignature::derive("r100", "v1", VerifyMetric::Euclidean)
        );
    }
}
