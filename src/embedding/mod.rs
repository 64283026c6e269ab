//! Embedding client abstraction and adapters.
//!
//! Every backend converts a batch of texts into one vector per text, in input order. HTTP
//! backends report non-success responses as [`EmbeddingClientError::Upstream`] so the gateway
//! and the pipeline can tell a struggling provider from a malformed request.

mod ollama;
mod openai;

pub use ollama::OllamaEmbeddingClient;
pub use openai::OpenAIEmbeddingClient;

use crate::config::{Config, EmbeddingProvider};
use crate::gateway::Retryable;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider answered with a non-success status.
    #[error("Embedding provider returned {status}: {body}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// HTTP layer failed before receiving a response.
    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider response did not match the request.
    #[error("Malformed embedding response: {0}")]
    InvalidResponse(String),
    /// Client configuration or input cannot be used.
    #[error("Invalid embedding request: {0}")]
    InvalidInput(String),
}

impl Retryable for EmbeddingClientError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => *status >= 500 || *status == 429,
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::InvalidResponse(_) | Self::InvalidInput(_) => false,
        }
    }
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce one embedding vector per supplied text, in the same order.
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;
}

/// Deterministic embedding client that hashes bytes into vector slots; needs no provider.
pub struct HashEmbeddingClient {
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Construct a client producing vectors of `dimension` components.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        for (idx, byte) in text.to_lowercase().bytes().enumerate() {
            let position = (usize::from(byte) * 31 + idx % 7) % dimension;
            embedding[position] += 1.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::InvalidInput(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        Ok(texts
            .iter()
            .map(|text| Self::encode(text, self.dimension))
            .collect())
    }
}

/// Build the embedding client selected by configuration.
pub fn build_embedding_client(
    config: &Config,
) -> Result<Arc<dyn EmbeddingClient>, EmbeddingClientError> {
    tracing::info!(
        provider = ?config.embedding_provider,
        model = %config.embedding_model,
        dimension = config.embedding_dimension,
        "Initializing embedding client"
    );
    let client: Arc<dyn EmbeddingClient> = match config.embedding_provider {
        EmbeddingProvider::Hash => Arc::new(HashEmbeddingClient::new(config.embedding_dimension)),
        EmbeddingProvider::Ollama => Arc::new(OllamaEmbeddingClient::new(
            &config.ollama_url,
            &config.embedding_model,
        )?),
        EmbeddingProvider::OpenAI => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                EmbeddingClientError::InvalidInput("OPENAI_API_KEY is required".to_string())
            })?;
            Arc::new(OpenAIEmbeddingClient::new(
                &config.openai_base_url,
                api_key,
                &config.embedding_model,
                Some(config.embedding_dimension),
            )?)
        }
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_client_is_deterministic_and_normalized() {
        let client = HashEmbeddingClient::new(16);
        let vectors = client
            .embed(vec!["alpha beta".into(), "alpha beta".into(), "".into()])
            .await
            .expect("vectors");
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[1]);
        assert!(vectors.iter().all(|vector| vector.len() == 16));

        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(vectors[2].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn upstream_classification() {
        let busy = EmbeddingClientError::Upstream {
            status: 503,
            body: String::new(),
        };
        let rejected = EmbeddingClientError::Upstream {
            status: 400,
            body: String::new(),
        };
        assert!(busy.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!EmbeddingClientError::InvalidResponse("x".into()).is_retryable());
    }
}
