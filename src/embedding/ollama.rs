//! Ollama embeddings over `POST {base}/api/embed`.

use super::{EmbeddingClient, EmbeddingClientError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Embedding client for a local Ollama runtime.
pub struct OllamaEmbeddingClient {
    http: Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbeddingClient {
    /// Build a client for the runtime at `base_url` serving `model`.
    pub fn new(base_url: &str, model: &str) -> Result<Self, EmbeddingClientError> {
        if model.trim().is_empty() {
            return Err(EmbeddingClientError::InvalidInput(
                "missing Ollama model name".to_string(),
            ));
        }
        let http = Client::builder().user_agent("rusty-rag/embed").build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/embed", base_url.trim_end_matches('/')),
            model: model.trim().to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(model = %self.model, inputs = texts.len(), "Requesting Ollama embeddings");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model: &self.model,
                input: &texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingClientError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbedResponse = response.json().await?;
        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingClientError::InvalidResponse(format!(
                "Ollama returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}
