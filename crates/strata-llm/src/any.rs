#[cfg(feature = "mock")]
use crate::mock::MockEmbedder;
use crate::ollama::OllamaEmbedder;
use crate::openai::OpenAiEmbedder;

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

/// Generates a match over all `AnyEmbedder` variants, binding the inner provider
/// and evaluating the given expression for each arm.
macro_rules! delegate_embedder {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyEmbedder::OpenAi($p) => $expr,
            AnyEmbedder::Ollama($p) => $expr,
            #[cfg(feature = "mock")]
            AnyEmbedder::Mock($p) => $expr,
        }
    };
}

/// Embedding provider chosen at construction time from configuration.
#[derive(Debug, Clone)]
pub enum AnyEmbedder {
    OpenAi(OpenAiEmbedder),
    Ollama(OllamaEmbedder),
    #[cfg(feature = "mock")]
    Mock(MockEmbedder),
}

impl EmbeddingProvider for AnyEmbedder {
    fn name(&self) -> &'static str {
        delegate_embedder!(self, |p| p.name())
    }

    fn model(&self) -> &str {
        delegate_embedder!(self, |p| p.model())
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        delegate_embedder!(self, |p| p.embed_many(texts).await)
    }

    fn supports_batch(&self) -> bool {
        delegate_embedder!(self, |p| p.supports_batch())
    }
}
