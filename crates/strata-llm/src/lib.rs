//! Embedding providers and the batching embedding client.

pub mod any;
pub mod client;
pub mod error;
pub(crate) mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod models;
pub mod ollama;
pub mod openai;
pub mod provider;
pub(crate) mod retry;
#[cfg(test)]
pub(crate) mod test_support;

pub use any::AnyEmbedder;
pub use client::{Embedding, EmbeddingClient, EmbeddingConfig, l2_normalize};
pub use error::{EmbeddingError, LlmError};
pub use models::known_dimension;
pub use provider::EmbeddingProvider;
