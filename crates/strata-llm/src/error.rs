use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },

    #[error("{provider} returned {actual} embeddings for {expected} inputs")]
    CountMismatch {
        provider: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("embedding request to {provider} failed with status {status}")]
    Status { provider: &'static str, status: u16 },

    #[error("{0}")]
    Other(String),
}

/// Failure of a single embedding request made through [`crate::EmbeddingClient`].
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider failed: {0}")]
    Provider(#[from] LlmError),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, LlmError>;
