pub mod agent;
pub mod config;
pub mod metrics;
pub mod rag;

#[cfg(test)]
pub mod test_util;

use thiserror::Error;

use crate::rag::embedding::EmbeddingError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing configuration: {0}")]
    ConfigMissing(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Embedding provider rejected the credentials: {0}")]
    AuthFailure(String),
    #[error("Vector store is not initialized")]
    NotInitialized,
    #[error("Embedding error: {0}")]
    Embedding(EmbeddingError),
    #[error("Document error: {0}")]
    Document(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EmbeddingError> for Error {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::AuthFailure(message) => Error::AuthFailure(message),
            other => Error::Embedding(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
