use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::{Error, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref EMBEDDING_REQUESTS_TOTAL: IntCounter = IntCounter::new(
        "opsassistant_embedding_requests_total",
        "Total number of HTTP requests sent to the embedding provider."
    )
    .unwrap();
    pub static ref EMBEDDING_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "opsassistant_embedding_retries_total",
            "Embedding requests retried, by reason."
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref CHUNKS_STORED_TOTAL: IntCounter = IntCounter::new(
        "opsassistant_chunks_stored_total",
        "Document chunks embedded and stored in the vector index."
    )
    .unwrap();
    pub static ref CHUNKS_FAILED_TOTAL: IntCounter = IntCounter::new(
        "opsassistant_chunks_failed_total",
        "Document chunks dropped because their batch could not be embedded."
    )
    .unwrap();
    pub static ref RAG_TRIGGER_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "opsassistant_rag_trigger_total",
            "Retrieval-trigger evaluations, by outcome."
        ),
        &["outcome"]
    )
    .unwrap();
}

/// Register all collectors with [`REGISTRY`]. Calling it more than once is harmless.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EMBEDDING_REQUESTS_TOTAL.clone()),
        Box::new(EMBEDDING_RETRIES_TOTAL.clone()),
        Box::new(CHUNKS_STORED_TOTAL.clone()),
        Box::new(CHUNKS_FAILED_TOTAL.clone()),
        Box::new(RAG_TRIGGER_TOTAL.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            tracing::debug!("metric already registered: {}", e);
        }
    }
}

// Function to gather metrics for exposition
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| Error::Internal(format!("metrics are not valid UTF-8: {}", e)))
}
