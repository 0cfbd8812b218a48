//! Vector Store
//!
//! In-memory index of embedded chunks answering nearest-neighbour queries by
//! cosine similarity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::document::DocumentChunk;
use super::embedding::{Embedder, EmbeddingError};
use crate::config::StoreConfig;
use crate::metrics::{CHUNKS_FAILED_TOTAL, CHUNKS_STORED_TOTAL};
use crate::{Error, Result};

struct StoredEntry {
    id: Uuid,
    chunk: DocumentChunk,
    vector: Vec<f32>,
    norm: f32,
}

/// Immutable snapshot of the index; replaced wholesale on re-ingestion.
#[derive(Default)]
struct VectorIndex {
    entries: Vec<StoredEntry>,
    dimension: Option<usize>,
}

impl VectorIndex {
    /// Append a successfully embedded batch. Rejects the whole batch if any
    /// vector is malformed so the index never holds mixed dimensions.
    fn append(&mut self, batch: &[DocumentChunk], vectors: Vec<Vec<f32>>) -> std::result::Result<(), String> {
        if vectors.len() != batch.len() {
            return Err(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            ));
        }

        let dimension = match self.dimension {
            Some(dimension) => dimension,
            None => vectors.first().map(Vec::len).unwrap_or(0),
        };
        if dimension == 0 {
            return Err("embedder returned empty vectors".to_string());
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(format!(
                "vector dimension {} does not match index dimension {}",
                bad.len(),
                dimension
            ));
        }

        self.dimension = Some(dimension);
        self.entries.extend(batch.iter().cloned().zip(vectors).map(|(chunk, vector)| StoredEntry {
            id: Uuid::new_v4(),
            norm: l2_norm(&vector),
            chunk,
            vector,
        }));
        Ok(())
    }
}

/// A search hit
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub id: Uuid,
    pub chunk: DocumentChunk,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

/// Per-run ingestion report
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub total_chunks: usize,
    pub stored: usize,
    pub failed: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestSummary {
    fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            total_chunks: 0,
            stored: 0,
            failed: 0,
            batches: 0,
            failed_batches: 0,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// True when this run stored at least one chunk and therefore replaced the index.
    pub fn initialized(&self) -> bool {
        self.stored > 0
    }

    /// True when some batches were dropped but others made it in.
    pub fn is_partial(&self) -> bool {
        self.stored > 0 && self.failed > 0
    }
}

/// In-memory vector store shared by every conversation in the process.
///
/// Readers grab an `Arc` snapshot of the current index and never wait on the
/// embedding API. `initialize` builds a fresh index off to the side and swaps
/// it in once finished; concurrent `initialize` calls run one at a time.
pub struct VectorStore {
    embedder: Arc<dyn Embedder>,
    config: StoreConfig,
    index: RwLock<Option<Arc<VectorIndex>>>,
    ingest_lock: Mutex<()>,
}

impl VectorStore {
    pub fn new(embedder: Arc<dyn Embedder>, config: StoreConfig) -> Self {
        Self {
            embedder,
            config,
            index: RwLock::new(None),
            ingest_lock: Mutex::new(()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Number of stored chunks (0 when uninitialized).
    pub fn len(&self) -> usize {
        self.snapshot().map(|index| index.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> Option<usize> {
        self.snapshot().and_then(|index| index.dimension)
    }

    fn snapshot(&self) -> Option<Arc<VectorIndex>> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Embed `chunks` batch by batch and replace the index with the result.
    ///
    /// A batch that still fails after `max_attempts` is dropped and counted in
    /// the summary; the remaining batches are still processed. If nothing at
    /// all could be stored the previous index (if any) is kept. An
    /// authentication failure aborts the run immediately.
    pub async fn initialize(&self, chunks: Vec<DocumentChunk>, batch_size: usize) -> Result<IngestSummary> {
        let _guard = self.ingest_lock.lock().await;
        let started_at = Utc::now();

        if chunks.is_empty() {
            warn!("No document chunks to ingest");
            return Ok(IngestSummary::empty(started_at));
        }

        let batch_size = batch_size.max(1);
        let total_batches = chunks.len().div_ceil(batch_size);
        info!(
            "Embedding {} chunks in {} batches (batch size {})",
            chunks.len(),
            total_batches,
            batch_size
        );

        let mut index = VectorIndex::default();
        let mut stored = 0;
        let mut failed = 0;
        let mut failed_batches = 0;

        for (i, batch) in chunks.chunks(batch_size).enumerate() {
            let batch_num = i + 1;
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

            let outcome = match self.embed_with_retry(&texts, batch_num, total_batches).await {
                Ok(vectors) => index.append(batch, vectors),
                Err(e) if e.is_auth_failure() => {
                    error!("Embedding provider rejected the API key, aborting ingestion: {}", e);
                    return Err(e.into());
                }
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(()) => {
                    stored += batch.len();
                    CHUNKS_STORED_TOTAL.inc_by(batch.len() as u64);
                    info!("Batch {}/{}: stored {} chunks", batch_num, total_batches, batch.len());
                }
                Err(reason) => {
                    failed += batch.len();
                    failed_batches += 1;
                    CHUNKS_FAILED_TOTAL.inc_by(batch.len() as u64);
                    error!("Batch {}/{} dropped ({} chunks): {}", batch_num, total_batches, batch.len(), reason);
                }
            }

            if batch_num < total_batches {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        let summary = IngestSummary {
            total_chunks: chunks.len(),
            stored,
            failed,
            batches: total_batches,
            failed_batches,
            started_at,
            finished_at: Utc::now(),
        };

        if stored > 0 {
            *self.index.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(index));
            info!("Vector store initialized: {} stored, {} failed", stored, failed);
        } else {
            error!("All {} chunks failed to embed; vector store left unchanged", failed);
        }

        Ok(summary)
    }

    async fn embed_with_retry(
        &self,
        texts: &[String],
        batch_num: usize,
        total_batches: usize,
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.embedder.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_auth_failure() || attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let wait = self.config.retry_wait * attempt;
                    warn!(
                        "Batch {}/{} failed, retrying in {:?} ({}/{}): {}",
                        batch_num, total_batches, wait, attempt, max_attempts, e
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Top-`k` chunks by cosine similarity to `query`, best first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        let index = self.snapshot().ok_or(Error::NotInitialized)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_one(query).await?;
        if index.dimension != Some(query_vector.len()) {
            return Err(Error::Embedding(EmbeddingError::InvalidResponse(format!(
                "query vector has dimension {}, index has {:?}",
                query_vector.len(),
                index.dimension
            ))));
        }

        let query_norm = l2_norm(&query_vector);
        let mut scored: Vec<(usize, f32)> = index
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, cosine(&query_vector, query_norm, &entry.vector, entry.norm)))
            .collect();

        // Highest score first; equal scores keep insertion order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        let results: Vec<ScoredChunk> = scored
            .into_iter()
            .map(|(i, score)| {
                let entry = &index.entries[i];
                ScoredChunk {
                    id: entry.id,
                    chunk: entry.chunk.clone(),
                    score,
                }
            })
            .collect();

        debug!(
            "Search returned {} of {} chunks (top score {:?})",
            results.len(),
            index.entries.len(),
            results.first().map(|r| r.score)
        );
        Ok(results)
    }

    /// Blocking form of [`VectorStore::initialize`]. Must not be called from async code.
    pub fn initialize_blocking(&self, chunks: Vec<DocumentChunk>, batch_size: usize) -> Result<IngestSummary> {
        blocking_runtime()?.block_on(self.initialize(chunks, batch_size))
    }

    /// Blocking form of [`VectorStore::search`]. Must not be called from async code.
    pub fn search_blocking(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        blocking_runtime()?.block_on(self.search(query, k))
    }
}

pub(crate) fn blocking_runtime() -> Result<tokio::runtime::Runtime> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::Internal(
            "blocking vector store call made from inside an async runtime; use the async method".to_string(),
        ));
    }
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}
