//! Metrics definitions for the model layer.

/// Metrics key for reference embeddings served from the in-process map.
pub const METRICS_ID_EMBEDDING_HIT_LOCAL: &str = "vigil.models.embedding.hit.local";
/// Metrics key for reference embeddings served from the object store.
pub const METRICS_ID_EMBEDDING_HIT_STORE: &str = "vigil.models.embedding.hit.store";
/// Metrics key for reference embeddings computed from the enrolment image.
pub const METRICS_ID_EMBEDDING_COMPUTED: &str = "vigil.models.embedding.computed";
/// Metrics key for lookups of clients without an enrolment image.
pub const METRICS_ID_EMBEDDING_MISSING: &str = "vigil.models.embedding.missing";

/// Describe all metrics used by the model layer.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRICS_ID_EMBEDDING_HIT_LOCAL,
        metrics::Unit::Count,
        "Reference embeddings served from the in-process cache"
    );
    metrics::describe_counter!(
        METRICS_ID_EMBEDDING_HIT_STORE,
        metrics::Unit::Count,
        "Reference embeddings served from the object store"
    );
    metrics::describe_counter!(
        METRICS_ID_EMBEDDING_COMPUTED,
        metrics::Unit::Count,
        "Reference embeddings computed from the enrolment image"
    );
    metrics::describe_counter!(
        METRICS_ID_EMBEDDING_MISSING,
        metrics::Unit::Count,
        "Reference lookups for clients without an enrolment image"
    );
}
