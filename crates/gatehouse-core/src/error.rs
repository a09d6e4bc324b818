//! Error types for gatehouse

use thiserror::Error;

/// Result type alias using GatehouseError
pub type Result<T> = std::result::Result<T, GatehouseError>;

/// Error type alias for convenience
pub type Error = GatehouseError;

/// Main error type for gatehouse
#[derive(Debug, Error)]
pub enum GatehouseError {
    #[error("Vector store error: {0}")]
    Store(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Rerank error: {0}")]
    Rerank(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Node filter failed critically: {0}")]
    FilterCritical(String),

    #[error("Session access denied: {0}")]
    SessionForbidden(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl GatehouseError {
    /// Whether the error is a degradable stage failure (silent-degrader policy)
    /// rather than one that must surface to the client.
    pub fn is_degradable(&self) -> bool {
        !matches!(
            self,
            Self::SessionForbidden(_) | Self::Config(_) | Self::FilterCritical(_)
        )
    }
}
