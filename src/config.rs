use crate::gateway::{BreakerSettings, RetryPolicy};
use crate::pipeline::PipelineSettings;
use crate::processing::ChunkingSettings;
use crate::search::SearchSettings;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OBJECT_STORE_ROOT: &str = "data";

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the Rusty RAG server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Base URL of the Ollama runtime.
    pub ollama_url: String,
    /// API key for the OpenAI embeddings endpoint.
    pub openai_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible API.
    pub openai_base_url: String,
    /// Base URL of the Qdrant instance; `None` selects the in-process store.
    pub qdrant_url: Option<String>,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Active vector collection shared by ingestion and search.
    pub vector_collection: String,
    /// Base URL of an S3-compatible object store.
    pub object_store_url: Option<String>,
    /// Optional bearer token for the HTTP object store.
    pub object_store_token: Option<String>,
    /// Filesystem root used when no object store URL is configured.
    pub object_store_root: PathBuf,
    /// Upper bound on chunk length in bytes.
    pub chunk_max_bytes: usize,
    /// Bytes shared between adjacent chunks.
    pub chunk_overlap_bytes: usize,
    /// Maximum number of texts sent per embedding call.
    pub embed_batch_size: usize,
    /// Attempts allowed per pipeline stage before the job fails.
    pub stage_max_attempts: u32,
    /// Initial backoff between retries.
    pub retry_base_delay_ms: u64,
    /// Upper bound on the backoff between retries.
    pub retry_max_delay_ms: u64,
    /// Timeout applied to every external call.
    pub call_timeout_ms: u64,
    /// Attempts made by the gateway for a single external call.
    pub call_max_attempts: u32,
    /// Failures inside the rolling window that open a breaker.
    pub breaker_failure_threshold: u32,
    /// Rolling window for breaker failure counting.
    pub breaker_window_ms: u64,
    /// Time an open breaker waits before allowing trial calls.
    pub breaker_cooldown_ms: u64,
    /// Trial calls admitted while half-open.
    pub breaker_half_open_trials: u32,
    /// Jobs allowed past `queued` at the same time.
    pub max_concurrent_jobs: usize,
    /// Finished jobs kept queryable before the oldest are forgotten.
    pub max_retained_jobs: usize,
    /// Idle interval before the progress stream emits a heartbeat.
    pub progress_heartbeat_secs: u64,
    /// Largest page size accepted by search.
    pub search_max_top_k: usize,
    /// Deepest ranked window search will page through.
    pub search_max_window: usize,
    /// Optional minimum similarity for search results.
    pub search_score_threshold: Option<f32>,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends for the processing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI embeddings API.
    OpenAI,
    /// Deterministic in-process hashing, for offline use.
    Hash,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let embedding_model = load_env("EMBEDDING_MODEL")?;
        let embedding_dimension: usize = load_env("EMBEDDING_DIMENSION")?
            .parse()
            .map_err(|_| ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string()))?;
        if embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".to_string()));
        }
        let vector_collection = load_env_optional("VECTOR_COLLECTION")
            .unwrap_or_else(|| default_collection_name(&embedding_model, embedding_dimension));

        Ok(Self {
            embedding_provider: load_env("EMBEDDING_PROVIDER")?
                .parse()
                .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string()))?,
            embedding_model,
            embedding_dimension,
            ollama_url: load_env_optional("OLLAMA_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            openai_api_key: load_env_optional("OPENAI_API_KEY"),
            openai_base_url: load_env_optional("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            qdrant_url: load_env_optional("QDRANT_URL"),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            vector_collection,
            object_store_url: load_env_optional("OBJECT_STORE_URL"),
            object_store_token: load_env_optional("OBJECT_STORE_TOKEN"),
            object_store_root: load_env_optional("OBJECT_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OBJECT_STORE_ROOT)),
            chunk_max_bytes: load_parsed("CHUNK_MAX_BYTES", 1200)?,
            chunk_overlap_bytes: load_parsed("CHUNK_OVERLAP_BYTES", 120)?,
            embed_batch_size: load_parsed("EMBED_BATCH_SIZE", 32)?,
            stage_max_attempts: load_parsed("STAGE_MAX_ATTEMPTS", 3)?,
            retry_base_delay_ms: load_parsed("RETRY_BASE_DELAY_MS", 200)?,
            retry_max_delay_ms: load_parsed("RETRY_MAX_DELAY_MS", 5_000)?,
            call_timeout_ms: load_parsed("CALL_TIMEOUT_MS", 10_000)?,
            call_max_attempts: load_parsed("CALL_MAX_ATTEMPTS", 2)?,
            breaker_failure_threshold: load_parsed("BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_window_ms: load_parsed("BREAKER_WINDOW_MS", 30_000)?,
            breaker_cooldown_ms: load_parsed("BREAKER_COOLDOWN_MS", 15_000)?,
            breaker_half_open_trials: load_parsed("BREAKER_HALF_OPEN_TRIALS", 1)?,
            max_concurrent_jobs: load_parsed("MAX_CONCURRENT_JOBS", 4)?,
            max_retained_jobs: load_parsed("MAX_RETAINED_JOBS", 1_000)?,
            progress_heartbeat_secs: load_parsed("PROGRESS_HEARTBEAT_SECS", 15)?,
            search_max_top_k: load_parsed("SEARCH_MAX_TOP_K", 100)?,
            search_max_window: load_parsed("SEARCH_MAX_WINDOW", 1_000)?,
            search_score_threshold: load_env_optional("SEARCH_SCORE_THRESHOLD")
                .map(|value| {
                    value.parse().map_err(|_| {
                        ConfigError::InvalidValue("SEARCH_SCORE_THRESHOLD".to_string())
                    })
                })
                .transpose()?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }

    /// Retry policy applied by the gateway to a single external call.
    pub fn call_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.call_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Breaker parameters shared by every external dependency.
    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker_failure_threshold.max(1),
            window: Duration::from_millis(self.breaker_window_ms),
            cooldown: Duration::from_millis(self.breaker_cooldown_ms),
            half_open_trials: self.breaker_half_open_trials.max(1),
        }
    }

    /// Orchestrator parameters.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            collection: self.vector_collection.clone(),
            dimension: self.embedding_dimension,
            chunking: ChunkingSettings {
                max_bytes: self.chunk_max_bytes,
                overlap_bytes: self.chunk_overlap_bytes,
            },
            embed_batch_size: self.embed_batch_size.max(1),
            stage_retry: RetryPolicy {
                max_attempts: self.stage_max_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
            },
            max_concurrent_jobs: self.max_concurrent_jobs.max(1),
            max_retained_jobs: self.max_retained_jobs.max(1),
            heartbeat: Duration::from_secs(self.progress_heartbeat_secs.max(1)),
        }
    }

    /// Search service parameters.
    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            collection: self.vector_collection.clone(),
            dimension: self.embedding_dimension,
            max_top_k: self.search_max_top_k.max(1),
            max_window: self.search_max_window.max(1),
            score_threshold: self.search_score_threshold,
        }
    }

    /// Timeout applied to every gateway call.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.max(1))
    }
}

/// Collection name derived from the embedding model and its dimensionality.
pub fn default_collection_name(model: &str, dimension: usize) -> String {
    let slug: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("docs_{}_{dimension}", slug.trim_matches('_'))
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_parsed<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "hash" => Ok(Self::Hash),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, if [`init_config`] has run.
pub fn get_config() -> Option<&'static Config> {
    CONFIG.get()
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        qdrant_url = ?config.qdrant_url,
        collection = %config.vector_collection,
        server_port = ?config.server_port,
        embedding_provider = ?config.embedding_provider,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}
