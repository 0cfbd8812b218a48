//! Knowledge-Base Retrieval Module
//!
//! Loads runbooks and operating procedures from a local directory, embeds them
//! through a remote embedding API, and retrieves the closest chunks when the
//! agent is about to give operational advice.

pub mod context;
pub mod document;
pub mod embedding;
pub mod loader;
pub mod retriever;
pub mod splitter;
pub mod store;
pub mod trigger;

pub use context::RagContext;
pub use document::{DocumentChunk, FileType};
pub use embedding::{Embedder, EmbeddingError, HttpEmbeddingClient, KeyCheck, RetryPolicy};
pub use loader::DocumentLoader;
pub use retriever::{context_block, format_context, Retriever, CONTEXT_END_MARKER, CONTEXT_MARKER};
pub use splitter::TextSplitter;
pub use store::{IngestSummary, ScoredChunk, VectorStore};
pub use trigger::{RagTrigger, SkipReason, TriggerOutcome, TriggerRule, TriggerRules};
