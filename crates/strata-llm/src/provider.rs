use std::future::Future;

use crate::error::LlmError;

/// A backend that turns text into fixed-dimension vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Short provider identifier used in logs and errors.
    fn name(&self) -> &'static str;

    /// Model identifier sent with every request.
    fn model(&self) -> &str;

    /// Embed every input, returning vectors in input order.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be decoded.
    fn embed_many(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, LlmError>> + Send;

    /// Whether one request may carry several inputs.
    ///
    /// When `false`, the client issues one call per item.
    fn supports_batch(&self) -> bool {
        true
    }
}
