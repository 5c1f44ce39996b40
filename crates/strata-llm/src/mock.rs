//! Test-only mock embedding provider.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

/// Deterministic in-process embedder.
///
/// Unknown texts map to a pseudo-random vector derived from their bytes, so equal
/// inputs always embed identically.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    pub dimension: usize,
    pub fixed: HashMap<String, Vec<f32>>,
    pub fail_on: HashSet<String>,
    pub batch: bool,
    /// Milliseconds to sleep before answering.
    pub delay_ms: u64,
    calls: Arc<AtomicUsize>,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(8)
    }
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            fixed: HashMap::new(),
            fail_on: HashSet::new(),
            batch: true,
            delay_ms: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Return `vector` whenever `text` is embedded.
    #[must_use]
    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.fixed.insert(text.into(), vector);
        self
    }

    /// Fail any request that contains `text`.
    #[must_use]
    pub fn failing_on(mut self, text: impl Into<String>) -> Self {
        self.fail_on.insert(text.into());
        self
    }

    #[must_use]
    pub fn without_batching(mut self) -> Self {
        self.batch = false;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Number of provider calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.fixed.get(text) {
            return v.clone();
        }
        // FNV-1a seed, then an LCG per component
        let mut state = text.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });
        (0..self.dimension)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                #[allow(clippy::cast_precision_loss)]
                let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
                unit * 2.0 - 1.0
            })
            .collect()
    }
}

impl EmbeddingProvider for MockEmbedder {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-embedding"
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if let Some(bad) = texts.iter().find(|t| self.fail_on.contains(*t)) {
            return Err(LlmError::Other(format!("mock embedding failure for {bad:?}")));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_text_same_vector() {
        let m = MockEmbedder::new(16);
        let a = m.embed_many(&["hello".into()]).await.unwrap();
        let b = m.embed_many(&["hello".into()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 16);
        assert!(a[0].iter().all(|x| (-1.0..=1.0).contains(x)));
    }

    #[tokio::test]
    async fn fixed_vectors_take_precedence() {
        let m = MockEmbedder::new(2).with_vector("q", vec![1.0, 0.0]);
        let v = m.embed_many(&["q".into()]).await.unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0]]);
    }

    #[tokio::test]
    async fn failing_text_fails_whole_call() {
        let m = MockEmbedder::new(2).failing_on("bad");
        let result = m.embed_many(&["ok".into(), "bad".into()]).await;
        assert!(result.is_err());
        assert_eq!(m.calls(), 1);
    }
}
