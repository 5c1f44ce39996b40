use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;
use crate::retry::send_with_retry;

const MAX_RETRIES: u32 = 3;

/// Embedding provider for any OpenAI-compatible `/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    dimensions: Option<usize>,
}

impl fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl OpenAiEmbedder {
    /// Create an embedder for `model` at `base_url` (e.g. `https://api.openai.com/v1`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        api_key: Option<String>,
        mut base_url: String,
        model: String,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            client: crate::http::embedding_client(request_timeout)?,
            api_key,
            base_url,
            model,
            dimensions: None,
        })
    }

    /// Ask the server to shorten vectors to `dimensions` (supported by `text-embedding-3-*`).
    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = EmbeddingRequest {
            input: texts,
            model: &self.model,
            dimensions: self.dimensions,
        };
        let url = format!("{}/embeddings", self.base_url);

        let response = send_with_retry("openai", MAX_RETRIES, || {
            let mut req = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send()
        })
        .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %text, "embedding API error");
            return Err(LlmError::Status {
                provider: "openai",
                status: status.as_u16(),
            });
        }

        let resp: EmbeddingResponse = serde_json::from_str(&text)?;
        order_by_index(resp.data, texts.len())
    }
}

/// Arrange response items by their `index` field; servers may return them out of order.
fn order_by_index(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>, LlmError> {
    if data.is_empty() && expected > 0 {
        return Err(LlmError::EmptyResponse { provider: "openai" });
    }
    if data.len() != expected {
        return Err(LlmError::CountMismatch {
            provider: "openai",
            expected,
            actual: data.len(),
        });
    }
    data.sort_by_key(|d| d.index);
    if data.iter().enumerate().any(|(i, d)| d.index != i) {
        return Err(LlmError::Other(
            "embedding response indices are not a permutation of the inputs".into(),
        ));
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{json_response, spawn_mock_server};

    fn embedder(port: u16) -> OpenAiEmbedder {
        OpenAiEmbedder::new(
            Some("sk-test".into()),
            format!("http://127.0.0.1:{port}/v1/"),
            "text-embedding-3-small".into(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn new_trims_trailing_slashes() {
        let e = OpenAiEmbedder::new(
            None,
            "http://localhost:8080/v1///".into(),
            "m".into(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(e.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn debug_redacts_api_key() {
        let e = embedder(1);
        let dbg = format!("{e:?}");
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains("sk-test"));
    }

    #[test]
    fn order_by_index_restores_input_order() {
        let data = vec![
            EmbeddingData {
                index: 1,
                embedding: vec![2.0],
            },
            EmbeddingData {
                index: 0,
                embedding: vec![1.0],
            },
        ];
        assert_eq!(order_by_index(data, 2).unwrap(), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn order_by_index_rejects_short_response() {
        let data = vec![EmbeddingData {
            index: 0,
            embedding: vec![1.0],
        }];
        assert!(matches!(
            order_by_index(data, 2),
            Err(LlmError::CountMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn order_by_index_rejects_duplicate_indices() {
        let data = vec![
            EmbeddingData {
                index: 0,
                embedding: vec![1.0],
            },
            EmbeddingData {
                index: 0,
                embedding: vec![2.0],
            },
        ];
        assert!(order_by_index(data, 2).is_err());
    }

    #[tokio::test]
    async fn embed_many_sends_all_inputs_in_one_request() {
        let body = r#"{"data":[{"index":0,"embedding":[0.1,0.2]},{"index":1,"embedding":[0.3,0.4]}]}"#;
        let (port, handle) = spawn_mock_server(vec![json_response(200, body)]).await;

        let vectors = embedder(port)
            .embed_many(&["alpha".into(), "beta".into()])
            .await
            .unwrap();

        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        let requests = handle.await.unwrap();
        let sent: serde_json::Value = serde_json::from_str(&requests[0]).unwrap();
        assert_eq!(sent["input"], serde_json::json!(["alpha", "beta"]));
        assert_eq!(sent["model"], "text-embedding-3-small");
        assert!(sent.get("dimensions").is_none());
    }

    #[tokio::test]
    async fn embed_many_maps_error_status() {
        let (port, _handle) =
            spawn_mock_server(vec![json_response(400, r#"{"error":"bad"}"#)]).await;

        let result = embedder(port).embed_many(&["x".into()]).await;

        assert!(matches!(
            result,
            Err(LlmError::Status {
                provider: "openai",
                status: 400
            })
        ));
    }

    #[tokio::test]
    async fn embed_many_empty_input_skips_request() {
        let vectors = embedder(1).embed_many(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_errors() {
        let result = embedder(1).embed_many(&["x".into()]).await;
        assert!(matches!(result, Err(LlmError::Http(_))));
    }
}
