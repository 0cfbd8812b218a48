//! Retriever
//!
//! Thin query layer over the vector store plus the text formatting used when
//! retrieved chunks are spliced into a conversation.

use std::sync::Arc;
use tracing::{debug, warn};

use super::document::DocumentChunk;
use super::store::{blocking_runtime, ScoredChunk, VectorStore};
use crate::Result;

/// Opening marker of an injected knowledge-base block.
pub const CONTEXT_MARKER: &str = "[Knowledge Base Reference]";
pub const CONTEXT_END_MARKER: &str = "[End Knowledge Base Reference]";

const DOCUMENT_SEPARATOR: &str = "\n---\n\n";

pub struct Retriever {
    store: Arc<VectorStore>,
    k: usize,
}

impl Retriever {
    pub fn new(store: Arc<VectorStore>, k: usize) -> Self {
        Self { store, k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Top-k chunks for `query`, or an error if the store cannot answer.
    pub async fn try_retrieve(&self, query: &str) -> Result<Vec<DocumentChunk>> {
        Ok(self
            .retrieve_with_scores(query)
            .await?
            .into_iter()
            .map(|hit| hit.chunk)
            .collect())
    }

    /// Top-k chunks for `query`. Never fails: an uninitialized store or an
    /// embedding error yields an empty list.
    pub async fn retrieve(&self, query: &str) -> Vec<DocumentChunk> {
        if !self.store.is_initialized() {
            debug!("Knowledge base not initialized, skipping retrieval");
            return Vec::new();
        }
        match self.try_retrieve(query).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("Knowledge-base retrieval failed: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn retrieve_with_scores(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        debug!("Retrieving top {} chunks for query: {}", self.k, query);
        self.store.search(query, self.k).await
    }

    /// Synchronous form of [`Retriever::retrieve`] for callers outside any runtime.
    pub fn retrieve_blocking(&self, query: &str) -> Vec<DocumentChunk> {
        match blocking_runtime() {
            Ok(runtime) => runtime.block_on(self.retrieve(query)),
            Err(e) => {
                warn!("Knowledge-base retrieval failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Render chunks as numbered, source-attributed documents.
pub fn format_context(chunks: &[DocumentChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "[Document {} - {}]\n{}\n",
                i + 1,
                chunk.origin_filename,
                chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join(DOCUMENT_SEPARATOR)
}

/// [`format_context`] wrapped in the knowledge-base markers.
pub fn context_block(chunks: &[DocumentChunk]) -> String {
    format!(
        "{}\n{}\n{}",
        CONTEXT_MARKER,
        format_context(chunks),
        CONTEXT_END_MARKER
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::test_util::{chunk, initialized_store, runbook_chunks, KeywordEmbedder};

    #[test]
    fn formats_numbered_documents() {
        let chunks = vec![
            chunk("db-runbook.txt", 0, "Restart the pool."),
            chunk("network.pdf", 3, "Check the CNI."),
        ];

        let text = format_context(&chunks);

        assert_eq!(
            text,
            "[Document 1 - db-runbook.txt]\nRestart the pool.\n\n---\n\n[Document 2 - network.pdf]\nCheck the CNI.\n"
        );
        assert_eq!(text, format_context(&chunks));
        assert_eq!(format_context(&[]), "");
    }

    #[test]
    fn context_block_is_wrapped_in_markers() {
        let block = context_block(&[chunk("a.txt", 0, "drain first")]);
        assert!(block.starts_with(CONTEXT_MARKER));
        assert!(block.ends_with(CONTEXT_END_MARKER));
        assert!(block.contains("[Document 1 - a.txt]\ndrain first\n"));
    }

    #[tokio::test]
    async fn uninitialized_store_yields_empty_results() {
        let embedder = Arc::new(KeywordEmbedder::default());
        let store = Arc::new(VectorStore::new(embedder.clone(), StoreConfig::default()));
        let retriever = Retriever::new(store, 4);

        assert!(retriever.retrieve("anything").await.is_empty());
        assert!(retriever.retrieve("anything else").await.is_empty());
        assert_eq!(embedder.calls(), 0);
        assert!(retriever.try_retrieve("anything").await.is_err());
    }

    #[tokio::test]
    async fn retrieves_best_match_first() {
        let retriever = Retriever::new(initialized_store(runbook_chunks()).await, 4);

        let chunks = retriever.retrieve("database connection refused").await;
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].origin_filename, "db-runbook.txt");

        let scored = retriever
            .retrieve_with_scores("database connection refused")
            .await
            .unwrap();
        assert_eq!(scored[0].chunk, chunks[0]);
        assert!(scored[0].score > scored[1].score);
    }

    #[test]
    fn blocking_retrieve_outside_runtime() {
        let store = Arc::new(VectorStore::new(
            Arc::new(KeywordEmbedder::default()),
            crate::test_util::fast_store_config(),
        ));
        store.initialize_blocking(runbook_chunks(), 4).unwrap();
        let retriever = Retriever::new(store, 2);

        let chunks = retriever.retrieve_blocking("database connection refused");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].origin_filename, "db-runbook.txt");
    }
}
