//! Service facade wiring adapters, orchestrator, and search together.

use crate::config::Config;
use crate::embedding::{EmbeddingClientError, build_embedding_client};
use crate::gateway::{BreakerSnapshot, GatewayError, Gateways, SystemClock};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::{
    IngestError, IngestRequest, JobId, JobProgress, JobRegistry, Orchestrator, PipelineDeps,
    PipelineSettings, ProgressEvent, progress_stream,
};
use crate::qdrant::QdrantStore;
use crate::search::{SearchError, SearchQuery, SearchResultPage, SearchService, SearchSettings};
use crate::storage::{FsObjectStore, HttpObjectStore, ObjectStore, ObjectStoreError};
use crate::vector::{MemoryVectorStore, VectorStore, VectorStoreError};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures while bootstrapping the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Object store client could not be built.
    #[error("object store setup failed: {0}")]
    ObjectStore(#[from] ObjectStoreError),
    /// Embedding client could not be built.
    #[error("embedding client setup failed: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Vector store client could not be built.
    #[error("vector store setup failed: {0}")]
    VectorStore(#[from] VectorStoreError),
    /// Active collection could not be prepared.
    #[error("collection bootstrap failed: {0}")]
    Collection(#[from] GatewayError<VectorStoreError>),
}

/// Counters plus breaker states, as served by `GET /metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    /// Pipeline counters.
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    /// One entry per external dependency.
    pub breakers: Vec<BreakerSnapshot>,
}

/// Operations exposed to callers of the pipeline (the HTTP layer and tests).
#[async_trait]
pub trait PipelineApi: Send + Sync {
    /// Register a document for ingestion; returns immediately with the job id.
    fn start_ingest(&self, request: IngestRequest) -> Result<JobId, IngestError>;

    /// Current progress snapshot of a job.
    fn job_progress(&self, job_id: &JobId) -> Result<JobProgress, IngestError>;

    /// Cancel a job that is still queued.
    fn abort(&self, job_id: &JobId) -> Result<JobProgress, IngestError>;

    /// Live progress events for a job, ending at its terminal stage.
    fn stream_progress(
        &self,
        job_id: &JobId,
    ) -> Result<BoxStream<'static, ProgressEvent>, IngestError>;

    /// Ranked, paginated search.
    async fn search(&self, query: SearchQuery) -> Result<SearchResultPage, SearchError>;

    /// Counters and breaker states.
    fn metrics_report(&self) -> MetricsReport;
}

/// Production implementation of [`PipelineApi`].
///
/// Build it once near process start and share it behind an `Arc`; the orchestrator and the
/// search service share the same gateways, so a breaker tripped by ingestion also guards search.
pub struct PipelineService {
    orchestrator: Orchestrator,
    search: SearchService,
    gateways: Gateways,
    metrics: Arc<PipelineMetrics>,
    heartbeat: Duration,
}

impl PipelineService {
    /// Build every adapter selected by `config` and prepare the active collection.
    pub async fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let object_store: Arc<dyn ObjectStore> = match &config.object_store_url {
            Some(url) => Arc::new(HttpObjectStore::new(
                url,
                config.object_store_token.clone(),
            )?),
            None => {
                tracing::info!(
                    root = %config.object_store_root.display(),
                    "Using filesystem object store"
                );
                Arc::new(FsObjectStore::new(config.object_store_root.clone()))
            }
        };
        let embedder = build_embedding_client(config)?;
        let vector_store: Arc<dyn VectorStore> = match &config.qdrant_url {
            Some(url) => Arc::new(QdrantStore::new(url, config.qdrant_api_key.clone())?),
            None => {
                tracing::warn!("QDRANT_URL not set; indexed entries live in memory only");
                Arc::new(MemoryVectorStore::new())
            }
        };
        let gateways = Gateways::new(
            config.breaker_settings(),
            config.call_retry_policy(),
            config.call_timeout(),
            Arc::new(SystemClock::new()),
        );

        Self::from_parts(
            PipelineDeps {
                object_store,
                embedder,
                vector_store,
                gateways,
            },
            config.pipeline_settings(),
            config.search_settings(),
        )
        .await
    }

    /// Assemble the service from prebuilt adapters.
    pub async fn from_parts(
        deps: PipelineDeps,
        pipeline: PipelineSettings,
        search: SearchSettings,
    ) -> Result<Self, ServiceError> {
        let store = &deps.vector_store;
        let collection = pipeline.collection.as_str();
        let dimension = pipeline.dimension;
        tracing::debug!(collection, dimension, "Ensuring active collection");
        deps.gateways
            .vector_store
            .call("ensure_collection", || {
                store.ensure_collection(collection, dimension)
            })
            .await?;
        tracing::info!(collection, dimension, "Active collection ready");

        let metrics = Arc::new(PipelineMetrics::new());
        let gateways = deps.gateways.clone();
        let search = SearchService::new(
            deps.embedder.clone(),
            deps.vector_store.clone(),
            gateways.clone(),
            search,
            metrics.clone(),
        );
        let heartbeat = pipeline.heartbeat;
        let registry = Arc::new(JobRegistry::with_retention(pipeline.max_retained_jobs));
        let orchestrator = Orchestrator::new(
            deps,
            pipeline,
            registry,
            metrics.clone(),
        );
        Ok(Self {
            orchestrator,
            search,
            gateways,
            metrics,
            heartbeat,
        })
    }

    /// Underlying orchestrator.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

#[async_trait]
impl PipelineApi for PipelineService {
    fn start_ingest(&self, request: IngestRequest) -> Result<JobId, IngestError> {
        self.orchestrator.start(request)
    }

    fn job_progress(&self, job_id: &JobId) -> Result<JobProgress, IngestError> {
        self.orchestrator
            .registry()
            .progress(job_id)
            .ok_or_else(|| IngestError::UnknownJob(job_id.clone()))
    }

    fn abort(&self, job_id: &JobId) -> Result<JobProgress, IngestError> {
        self.orchestrator.abort(job_id)
    }

    fn stream_progress(
        &self,
        job_id: &JobId,
    ) -> Result<BoxStream<'static, ProgressEvent>, IngestError> {
        progress_stream(
            self.orchestrator.registry().clone(),
            job_id.clone(),
            self.heartbeat,
        )
        .ok_or_else(|| IngestError::UnknownJob(job_id.clone()))
    }

    async fn search(&self, query: SearchQuery) -> Result<SearchResultPage, SearchError> {
        self.search.search(query).await
    }

    fn metrics_report(&self) -> MetricsReport {
        MetricsReport {
            counters: self.metrics.snapshot(),
            breakers: self.gateways.snapshots(),
        }
    }
}
