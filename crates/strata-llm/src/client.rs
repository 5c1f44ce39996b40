//! Batching embedding client with per-item failure isolation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use crate::error::{EmbeddingError, LlmError};
use crate::provider::EmbeddingProvider;

/// Embedding client configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Vector length every response must have.
    pub dimension: usize,
    /// Default group size for [`EmbeddingClient::embed_batch_default`] (default: 25).
    pub batch_size: usize,
    /// Scale each vector to unit L2 norm; required for cosine indexes (default: true).
    pub normalize: bool,
    /// Groups embedded concurrently (default: 1).
    pub concurrency: usize,
    /// Upper bound for a single provider call.
    pub timeout: Option<Duration>,
}

impl EmbeddingConfig {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            batch_size: 25,
            normalize: true,
            concurrency: 1,
            timeout: None,
        }
    }
}

/// One embedded input.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    /// `true` when embedding failed and `vector` is the all-zero placeholder.
    pub fallback: bool,
}

impl Embedding {
    fn real(vector: Vec<f32>) -> Self {
        Self {
            vector,
            fallback: false,
        }
    }
}

/// Scale `vector` to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub struct EmbeddingClient<P> {
    provider: Arc<P>,
    config: EmbeddingConfig,
}

impl<P> std::fmt::Debug for EmbeddingClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: EmbeddingProvider> EmbeddingClient<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: EmbeddingConfig) -> Self {
        Self { provider, config }
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    #[must_use]
    pub fn normalizes(&self) -> bool {
        self.config.normalize
    }

    #[must_use]
    pub fn config(&self) -> &EmbeddingConfig {
        &self.config
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Embed a single text.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError`] if the provider fails, times out, or returns a vector
    /// whose length differs from the configured dimension.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = [text.to_owned()];
        let mut vectors = self.call(&input).await?;
        let vector = vectors.pop().ok_or(LlmError::EmptyResponse {
            provider: self.provider.name(),
        })?;
        self.finish(vector)
    }

    /// Embed `texts` in groups of the configured batch size.
    pub async fn embed_batch_default(&self, texts: &[String]) -> Vec<Embedding> {
        self.embed_batch(texts, self.config.batch_size).await
    }

    /// Embed `texts` in groups of `batch_size`, one result per input in input order.
    ///
    /// Never fails as a whole: an input that cannot be embedded is logged and replaced
    /// by a zero vector with [`Embedding::fallback`] set.
    pub async fn embed_batch(&self, texts: &[String], batch_size: usize) -> Vec<Embedding> {
        if texts.is_empty() {
            return Vec::new();
        }
        let batch_size = batch_size.max(1);

        let groups: Vec<Vec<Embedding>> = futures::stream::iter(texts.chunks(batch_size).enumerate())
            .map(|(g, group)| self.embed_group(g * batch_size, group))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let results: Vec<Embedding> = groups.into_iter().flatten().collect();
        let fallbacks = results.iter().filter(|e| e.fallback).count();
        tracing::debug!(total = results.len(), fallbacks, "batch embedded");
        results
    }

    async fn embed_group(&self, offset: usize, group: &[String]) -> Vec<Embedding> {
        if self.provider.supports_batch() {
            let attempt = match self.call(group).await {
                Ok(vectors) => vectors
                    .into_iter()
                    .map(|v| self.finish(v))
                    .collect::<Result<Vec<_>, _>>(),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(vectors) => return vectors.into_iter().map(Embedding::real).collect(),
                Err(e) if group.len() == 1 => return vec![self.fallback(offset, &e)],
                Err(e) => {
                    tracing::warn!(
                        offset,
                        size = group.len(),
                        error = %e,
                        "batch embedding failed, retrying items individually"
                    );
                }
            }
        }

        let mut out = Vec::with_capacity(group.len());
        for (i, text) in group.iter().enumerate() {
            match self.embed(text).await {
                Ok(vector) => out.push(Embedding::real(vector)),
                Err(e) => out.push(self.fallback(offset + i, &e)),
            }
        }
        out
    }

    async fn call(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = self.provider.embed_many(texts);
        let vectors = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| EmbeddingError::Timeout(limit))??,
            None => request.await?,
        };
        if vectors.len() != texts.len() {
            return Err(LlmError::CountMismatch {
                provider: self.provider.name(),
                expected: texts.len(),
                actual: vectors.len(),
            }
            .into());
        }
        Ok(vectors)
    }

    fn finish(&self, mut vector: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
        if vector.len() != self.config.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        if self.config.normalize {
            l2_normalize(&mut vector);
        }
        Ok(vector)
    }

    fn fallback(&self, position: usize, error: &EmbeddingError) -> Embedding {
        tracing::warn!(
            position,
            provider = self.provider.name(),
            error = %error,
            "embedding failed, substituting zero vector"
        );
        Embedding {
            vector: vec![0.0; self.config.dimension],
            fallback: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEmbedder;

    fn client(mock: MockEmbedder, normalize: bool) -> EmbeddingClient<MockEmbedder> {
        let mut config = EmbeddingConfig::new(mock.dimension);
        config.normalize = normalize;
        EmbeddingClient::new(Arc::new(mock), config)
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text {i}")).collect()
    }

    #[tokio::test]
    async fn embed_normalizes_when_enabled() {
        let c = client(MockEmbedder::new(2).with_vector("q", vec![3.0, 4.0]), true);
        let v = c.embed("q").await.unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn embed_keeps_raw_vector_without_normalize() {
        let c = client(MockEmbedder::new(2).with_vector("q", vec![3.0, 4.0]), false);
        assert_eq!(c.embed("q").await.unwrap(), vec![3.0, 4.0]);
    }

    #[tokio::test]
    async fn embed_rejects_wrong_dimension() {
        let c = client(MockEmbedder::new(4).with_vector("short", vec![1.0, 0.0]), true);
        let err = c.embed("short").await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn embed_surfaces_provider_error() {
        let c = client(MockEmbedder::new(4).failing_on("boom"), true);
        assert!(matches!(
            c.embed("boom").await,
            Err(EmbeddingError::Provider(_))
        ));
    }

    #[tokio::test]
    async fn embed_times_out() {
        let mock = MockEmbedder::new(4).with_delay(200);
        let mut config = EmbeddingConfig::new(4);
        config.timeout = Some(Duration::from_millis(10));
        let c = EmbeddingClient::new(Arc::new(mock), config);
        assert!(matches!(c.embed("slow").await, Err(EmbeddingError::Timeout(_))));
    }

    #[tokio::test]
    async fn batch_calls_provider_once_per_group() {
        let mock = MockEmbedder::new(4);
        let c = client(mock.clone(), true);
        let out = c.embed_batch(&texts(5), 2).await;
        assert_eq!(out.len(), 5);
        assert_eq!(mock.calls(), 3);
        assert!(out.iter().all(|e| !e.fallback));
    }

    #[tokio::test]
    async fn batch_preserves_input_order() {
        let mock = MockEmbedder::new(4);
        let c = client(mock, true);
        let inputs = texts(7);
        let batched = c.embed_batch(&inputs, 3).await;
        for (text, embedding) in inputs.iter().zip(&batched) {
            assert_eq!(embedding.vector, c.embed(text).await.unwrap());
        }
    }

    #[tokio::test]
    async fn batch_isolates_single_failure() {
        let mut inputs = texts(6);
        inputs[3] = "poison".into();
        let c = client(MockEmbedder::new(4).failing_on("poison"), true);

        let out = c.embed_batch(&inputs, 4).await;

        assert_eq!(out.len(), 6);
        assert!(out[3].fallback);
        assert_eq!(out[3].vector, vec![0.0; 4]);
        for (i, e) in out.iter().enumerate() {
            if i != 3 {
                assert!(!e.fallback, "position {i} should be a real embedding");
                assert!((norm(&e.vector) - 1.0).abs() < 1e-5);
            }
        }
    }

    #[tokio::test]
    async fn batch_with_concurrency_keeps_order() {
        let mock = MockEmbedder::new(4);
        let mut config = EmbeddingConfig::new(4);
        config.concurrency = 3;
        let c = EmbeddingClient::new(Arc::new(mock), config);
        let inputs = texts(10);
        let out = c.embed_batch(&inputs, 2).await;
        for (text, embedding) in inputs.iter().zip(&out) {
            assert_eq!(embedding.vector, c.embed(text).await.unwrap());
        }
    }

    #[tokio::test]
    async fn non_batching_provider_gets_one_call_per_item() {
        let mock = MockEmbedder::new(4).without_batching();
        let c = client(mock.clone(), true);
        let out = c.embed_batch(&texts(5), 25).await;
        assert_eq!(out.len(), 5);
        assert_eq!(mock.calls(), 5);
    }

    #[tokio::test]
    async fn batch_size_zero_is_treated_as_one() {
        let mock = MockEmbedder::new(4);
        let c = client(mock.clone(), true);
        assert_eq!(c.embed_batch(&texts(3), 0).await.len(), 3);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn empty_batch_makes_no_calls() {
        let mock = MockEmbedder::new(4);
        let c = client(mock.clone(), true);
        assert!(c.embed_batch(&[], 10).await.is_empty());
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn normalize_leaves_zero_vector() {
        let mut v = vec![0.0; 3];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0; 3]);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalized_vectors_have_unit_norm(v in proptest::collection::vec(-100.0f32..100.0, 1..64)) {
            prop_assume!(norm(&v) > 1e-3);
            let mut n = v.clone();
            l2_normalize(&mut n);
            prop_assert!((norm(&n) - 1.0).abs() < 1e-4);
        }
    }
}
