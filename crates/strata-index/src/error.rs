//! Error types for strata-index.

use std::num::TryFromIntError;
use std::time::Duration;

/// Errors raised while extracting, ingesting or retrieving chunks.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading source files or ingest files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// One file or unit failed extraction.
    #[error("parse failed: {0}")]
    Parse(String),

    #[error("unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("embedding error: {0}")]
    Embedding(#[from] strata_llm::EmbeddingError),

    #[error("vector index error: {0}")]
    VectorIndex(#[from] strata_memory::VectorIndexError),

    /// Invalid module glob.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] TryFromIntError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
