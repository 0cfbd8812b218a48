use std::sync::Arc;
use tracing::info;

use super::embedding::{Embedder, HttpEmbeddingClient};
use super::loader::DocumentLoader;
use super::retriever::Retriever;
use super::splitter::TextSplitter;
use super::store::{IngestSummary, VectorStore};
use super::trigger::RagTrigger;
use crate::config::RagConfig;
use crate::Result;

/// Shared knowledge-base dependencies, built once by the entry point.
///
/// Bundles the store, retriever and trigger policy so the agent loop and the
/// CLI receive a single `&RagContext` instead of reaching for globals.
pub struct RagContext {
    pub config: RagConfig,
    pub store: Arc<VectorStore>,
    pub retriever: Arc<Retriever>,
    pub trigger: Arc<RagTrigger>,
}

impl RagContext {
    /// Build against the configured HTTP embedding provider. Fails with
    /// `ConfigMissing` when no API key is configured.
    pub fn new(config: RagConfig) -> Result<Self> {
        let client = HttpEmbeddingClient::new(&config.embedding)?;
        Ok(Self::with_embedder(config, Arc::new(client)))
    }

    pub fn with_embedder(config: RagConfig, embedder: Arc<dyn Embedder>) -> Self {
        let store = Arc::new(VectorStore::new(embedder, config.store.clone()));
        let retriever = Arc::new(Retriever::new(store.clone(), config.top_k));
        let trigger = Arc::new(RagTrigger::new(retriever.clone(), config.trigger.clone()));

        Self {
            config,
            store,
            retriever,
            trigger,
        }
    }

    pub fn loader(&self) -> Result<DocumentLoader> {
        let docs = &self.config.documents;
        let splitter = TextSplitter::new(docs.chunk_size, docs.chunk_overlap)?;
        Ok(DocumentLoader::new(docs.dir.clone(), splitter))
    }

    /// Load the configured document directory and (re)build the index from it.
    pub async fn initialize_from_dir(&self) -> Result<IngestSummary> {
        let loader = self.loader()?;
        info!("Initializing knowledge base from {}", loader.dir().display());

        // Directory walking and PDF parsing are blocking work.
        let chunks = tokio::task::spawn_blocking(move || loader.load_all())
            .await
            .map_err(|e| crate::Error::Internal(format!("document loader task failed: {}", e)))?;

        self.store
            .initialize(chunks, self.config.store.batch_size)
            .await
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_initialized()
    }
}
