use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::rag::document::{DocumentChunk, FileType};
use crate::rag::embedding::{Embedder, EmbeddingError};
use crate::rag::store::VectorStore;

pub const TEST_DIMENSION: usize = 256;

/// Deterministic bag-of-words embedder: each lowercase word is hashed into one bucket.
#[derive(Default)]
pub struct KeywordEmbedder {
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn keyword_vector(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; TEST_DIMENSION];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in word.to_lowercase().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vector[(hash % TEST_DIMENSION as u64) as usize] += 1.0;
    }
    vector
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }
}

pub fn chunk(filename: &str, chunk_index: usize, content: &str) -> DocumentChunk {
    DocumentChunk::new(
        content.to_string(),
        &PathBuf::from("/kb").join(filename),
        FileType::Text,
        chunk_index,
    )
}

/// Store settings with no waits, so retry paths run instantly.
pub fn fast_store_config() -> StoreConfig {
    StoreConfig {
        batch_size: 2,
        batch_delay: std::time::Duration::ZERO,
        max_attempts: 3,
        retry_wait: std::time::Duration::ZERO,
    }
}

/// One runbook chunk about database connectivity plus nine unrelated ones.
pub fn runbook_chunks() -> Vec<DocumentChunk> {
    let unrelated = [
        "Scale the deployment when CPU usage stays above eighty percent",
        "Rotate TLS certificates before they expire",
        "Drain the node before upgrading the kubelet",
        "Increase the memory limit when pods are OOMKilled",
        "Check ingress annotations for path rewrite rules",
        "Clean up completed jobs older than seven days",
        "Verify persistent volume claims are bound",
        "Inspect image pull secrets for private registries",
        "Tune horizontal pod autoscaler thresholds gradually",
    ];

    let mut chunks = vec![chunk(
        "db-runbook.txt",
        0,
        "When the app logs show database connection refused, verify the database service endpoints and restart the connection pool",
    )];
    chunks.extend(
        unrelated
            .iter()
            .enumerate()
            .map(|(i, text)| chunk("cluster-ops.txt", i, text)),
    );
    chunks
}

pub async fn initialized_store(chunks: Vec<DocumentChunk>) -> Arc<VectorStore> {
    let store = Arc::new(VectorStore::new(
        Arc::new(KeywordEmbedder::default()),
        fast_store_config(),
    ));
    store.initialize(chunks, 4).await.unwrap();
    store
}
