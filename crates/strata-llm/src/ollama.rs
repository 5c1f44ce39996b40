use ollama_rs::Ollama;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

/// Embedding provider backed by a local Ollama server (`/api/embed`).
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: Ollama,
    model: String,
}

impl OllamaEmbedder {
    #[must_use]
    pub fn new(base_url: &str, model: String) -> Self {
        let (host, port) = parse_host_port(base_url);
        Self {
            client: Ollama::new(host, port),
            model,
        }
    }
}

impl EmbeddingProvider for OllamaEmbedder {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = GenerateEmbeddingsRequest::new(
            self.model.clone(),
            EmbeddingsInput::Multiple(texts.to_vec()),
        );

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(|e| LlmError::Other(format!("Ollama embedding request failed: {e}")))?;

        if response.embeddings.is_empty() {
            return Err(LlmError::EmptyResponse { provider: "ollama" });
        }
        if response.embeddings.len() != texts.len() {
            return Err(LlmError::CountMismatch {
                provider: "ollama",
                expected: texts.len(),
                actual: response.embeddings.len(),
            });
        }
        Ok(response.embeddings)
    }
}

fn parse_host_port(url: &str) -> (String, u16) {
    let url = url.trim_end_matches('/');
    if let Some(colon_pos) = url.rfind(':') {
        let port_str = &url[colon_pos + 1..];
        if let Ok(port) = port_str.parse::<u16>() {
            let host = url[..colon_pos].to_string();
            return (host, port);
        }
    }
    (url.to_string(), 11434)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_with_port() {
        let (host, port) = parse_host_port("http://localhost:11434");
        assert_eq!(host, "http://localhost");
        assert_eq!(port, 11434);
    }

    #[test]
    fn parse_host_port_defaults_port() {
        let (host, port) = parse_host_port("http://gpu-box");
        assert_eq!(host, "http://gpu-box");
        assert_eq!(port, 11434);
    }

    #[test]
    fn parse_host_port_trailing_slashes() {
        let (host, port) = parse_host_port("http://10.0.0.5:8080///");
        assert_eq!(host, "http://10.0.0.5");
        assert_eq!(port, 8080);
    }

    #[test]
    fn parse_host_port_invalid_port_falls_back() {
        let (host, port) = parse_host_port("http://localhost:99999");
        assert_eq!(host, "http://localhost:99999");
        assert_eq!(port, 11434);
    }

    #[test]
    fn reports_name_and_model() {
        let e = OllamaEmbedder::new("http://localhost:11434", "nomic-embed-text".into());
        assert_eq!(e.name(), "ollama");
        assert_eq!(e.model(), "nomic-embed-text");
        assert!(e.supports_batch());
    }

    #[tokio::test]
    async fn empty_input_skips_request() {
        let e = OllamaEmbedder::new("http://127.0.0.1:1", "m".into());
        assert!(e.embed_many(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_errors() {
        let e = OllamaEmbedder::new("http://127.0.0.1:1", "m".into());
        assert!(e.embed_many(&["x".into()]).await.is_err());
    }
}
