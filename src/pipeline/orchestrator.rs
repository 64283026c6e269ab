//! Drives admitted jobs through their stages.

use super::registry::Admission;
use super::{
    Document, ErrorKind, IngestError, IngestRequest, JobId, JobProgress, JobRegistry,
    PipelineSettings, Stage, StageError, chunk_id, unix_millis_now,
};
use crate::embedding::EmbeddingClient;
use crate::gateway::Gateways;
use crate::metrics::PipelineMetrics;
use crate::processing::{Chunk, chunk_text, content_hash, detect_kind, normalize};
use crate::storage::ObjectStore;
use crate::vector::{EntryPayload, IndexedEntry, VectorStore};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// External capabilities used by the stages, each reached through its gateway.
#[derive(Clone)]
pub struct PipelineDeps {
    /// Source of raw document bytes.
    pub object_store: Arc<dyn ObjectStore>,
    /// Chunk vectorizer.
    pub embedder: Arc<dyn EmbeddingClient>,
    /// Destination of indexed entries.
    pub vector_store: Arc<dyn VectorStore>,
    /// Breaker, timeout, and retry wrappers for the three dependencies.
    pub gateways: Gateways,
}

/// Intermediate results carried between stages of one job.
#[derive(Default)]
struct Work {
    text: String,
    content_hash: String,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

struct Shared {
    registry: Arc<JobRegistry>,
    deps: PipelineDeps,
    settings: PipelineSettings,
    permits: Arc<Semaphore>,
    metrics: Arc<PipelineMetrics>,
}

/// Entry point for starting and cancelling ingestion jobs.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Build an orchestrator recording jobs in `registry`.
    pub fn new(
        deps: PipelineDeps,
        settings: PipelineSettings,
        registry: Arc<JobRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            shared: Arc::new(Shared {
                registry,
                deps,
                settings,
                permits,
                metrics,
            }),
        }
    }

    /// Job table shared with readers.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.shared.registry
    }

    /// Admit a request and spawn its job; returns the existing job id when coalesced.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, request: IngestRequest) -> Result<JobId, IngestError> {
        let overwrite = request.overwrite;
        let document = request.into_document()?;
        let document_id = document.document_id.clone();

        match self.shared.registry.admit(document, overwrite) {
            Admission::Coalesced(job_id) => {
                tracing::info!(job_id = %job_id, document_id = %document_id, "Joined in-flight ingestion job");
                Ok(job_id)
            }
            Admission::Created {
                job_id,
                wait_for,
                aborted,
            } => {
                if let Some(prior) = aborted {
                    self.shared.metrics.record_job_aborted();
                    tracing::info!(job_id = %prior, replaced_by = %job_id, "Aborted queued job superseded by overwrite");
                }
                if let Some(prior) = &wait_for {
                    tracing::info!(job_id = %prior, replaced_by = %job_id, "Running job superseded by overwrite");
                }
                self.shared.metrics.record_job_started();
                tracing::info!(job_id = %job_id, document_id = %document_id, "Ingestion job queued");

                let shared = self.shared.clone();
                let spawned = job_id.clone();
                tokio::spawn(async move { shared.run(spawned, wait_for).await });
                Ok(job_id)
            }
        }
    }

    /// Cancel a job that has not left `queued`.
    pub fn abort(&self, job_id: &JobId) -> Result<JobProgress, IngestError> {
        let progress = self.shared.registry.abort(job_id)?;
        self.shared.metrics.record_job_aborted();
        tracing::info!(job_id = %job_id, "Ingestion job aborted");
        Ok(progress)
    }
}

impl Shared {
    async fn run(self: Arc<Self>, job_id: JobId, wait_for: Option<JobId>) {
        if let Some(prior) = wait_for {
            tracing::debug!(job_id = %job_id, waiting_for = %prior, "Waiting for superseded job");
            self.registry.wait_terminal(&prior).await;
        }
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            self.finish_failed(
                &job_id,
                StageError::fatal(ErrorKind::Internal, "worker pool closed"),
            );
            return;
        };

        let Some(record) = self.registry.record(&job_id) else {
            return;
        };
        if record.progress.stage != Stage::Queued {
            tracing::debug!(job_id = %job_id, stage = %record.progress.stage, "Job left the queue before starting");
            return;
        }
        let document = record.document;
        let mut work = Work::default();
        let mut current = Stage::Queued;

        while let Some(next) = current.next() {
            if self.registry.is_superseded(&job_id) {
                self.finish_failed(
                    &job_id,
                    StageError::fatal(
                        ErrorKind::Superseded,
                        "replaced by a newer ingest of the same document",
                    ),
                );
                return;
            }
            if let Err(error) = self.registry.transition(&job_id, next) {
                tracing::debug!(job_id = %job_id, error = %error, "Job stopped outside the pipeline");
                return;
            }
            if next == Stage::Completed {
                break;
            }
            tracing::debug!(job_id = %job_id, stage = %next, "Stage started");
            if let Err(error) = self.run_stage(&job_id, &document, next, &mut work).await {
                self.finish_failed(&job_id, error);
                return;
            }
            current = next;
        }

        self.metrics.record_job_completed(work.chunks.len() as u64);
        tracing::info!(
            job_id = %job_id,
            document_id = %document.document_id,
            chunks = work.chunks.len(),
            "Ingestion completed"
        );
    }

    /// Run one stage, retrying transient failures up to the configured attempt cap.
    async fn run_stage(
        &self,
        job_id: &JobId,
        document: &Document,
        stage: Stage,
        work: &mut Work,
    ) -> Result<(), StageError> {
        let policy = self.settings.stage_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.execute(job_id, document, stage, work).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            self.registry.record_failure(job_id, &error);
            if !error.retryable || !policy.allows_retry(attempt) {
                return Err(error);
            }
            let delay = policy.backoff(attempt);
            tracing::warn!(
                job_id = %job_id,
                stage = %stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Stage failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn execute(
        &self,
        job_id: &JobId,
        document: &Document,
        stage: Stage,
        work: &mut Work,
    ) -> Result<(), StageError> {
        match stage {
            Stage::Normalizing => self.normalize(job_id, document, work).await,
            Stage::Chunking => self.chunk(job_id, work),
            Stage::Embedding => self.embed(job_id, work).await,
            Stage::Indexing => self.index(document, work).await,
            other => Err(StageError::fatal(
                ErrorKind::Internal,
                format!("{other} has no stage work"),
            )),
        }
    }

    async fn normalize(
        &self,
        job_id: &JobId,
        document: &Document,
        work: &mut Work,
    ) -> Result<(), StageError> {
        let location = &document.storage;
        let store = &self.deps.object_store;
        let gateway = &self.deps.gateways.object_store;

        let metadata = gateway
            .call("metadata", || store.metadata(location))
            .await?;
        let bytes = gateway.call("bytes", || store.bytes(location)).await?;

        let kind = detect_kind(
            metadata.get("content-type").map(String::as_str),
            &location.key,
        );
        let normalized = normalize(&bytes, kind)?;
        let hash = content_hash(&bytes);
        tracing::debug!(
            job_id = %job_id,
            kind = normalized.kind.as_str(),
            bytes = bytes.len(),
            "Document normalized"
        );

        self.registry
            .set_document_info(job_id, hash.clone(), normalized.kind);
        work.content_hash = hash;
        work.text = normalized.text;
        Ok(())
    }

    fn chunk(&self, job_id: &JobId, work: &mut Work) -> Result<(), StageError> {
        let chunks = chunk_text(&work.text, self.settings.chunking)?;
        if chunks.is_empty() {
            return Err(StageError::fatal(
                ErrorKind::Malformed,
                "document produced no chunks",
            ));
        }
        self.registry.set_totals(job_id, Some(chunks.len()), None);
        work.chunks = chunks;
        work.vectors.clear();
        Ok(())
    }

    /// Embed in batches; batches finished by an earlier attempt are kept.
    async fn embed(&self, job_id: &JobId, work: &mut Work) -> Result<(), StageError> {
        let batch_size = self.settings.embed_batch_size.max(1);
        let embedder = &self.deps.embedder;

        while work.vectors.len() < work.chunks.len() {
            let start = work.vectors.len();
            let end = (start + batch_size).min(work.chunks.len());
            let texts: Vec<String> = work.chunks[start..end]
                .iter()
                .map(|chunk| chunk.text.clone())
                .collect();

            let vectors = self
                .deps
                .gateways
                .embedding
                .call("embed", || embedder.embed(texts.clone()))
                .await?;

            if vectors.len() != texts.len() {
                return Err(StageError::fatal(
                    ErrorKind::Upstream,
                    format!(
                        "embedding returned {} vectors for {} chunks",
                        vectors.len(),
                        texts.len()
                    ),
                ));
            }
            if let Some(vector) = vectors
                .iter()
                .find(|vector| vector.len() != self.settings.dimension)
            {
                return Err(StageError::fatal(
                    ErrorKind::DimensionMismatch,
                    format!(
                        "vector has {} dimensions but collection `{}` expects {}",
                        vector.len(),
                        self.settings.collection,
                        self.settings.dimension
                    ),
                ));
            }

            work.vectors.extend(vectors);
            self.registry
                .set_totals(job_id, None, Some(work.vectors.len()));
        }
        Ok(())
    }

    async fn index(&self, document: &Document, work: &Work) -> Result<(), StageError> {
        let indexed_at_ms = unix_millis_now();
        let entries: Vec<IndexedEntry> = work
            .chunks
            .iter()
            .zip(&work.vectors)
            .map(|(chunk, vector)| IndexedEntry {
                chunk_id: chunk_id(
                    &document.tenant_id,
                    &document.storage.bucket,
                    &document.document_id,
                    chunk.ordinal,
                ),
                vector: vector.clone(),
                payload: EntryPayload {
                    tenant_id: document.tenant_id.clone(),
                    bucket: document.storage.bucket.clone(),
                    document_id: document.document_id.clone(),
                    source_id: document.source_id.clone(),
                    ordinal: chunk.ordinal,
                    start: chunk.start,
                    end: chunk.end,
                    text: chunk.text.clone(),
                    tags: document.tags.clone(),
                    content_hash: work.content_hash.clone(),
                    indexed_at_ms,
                },
            })
            .collect();

        let store = &self.deps.vector_store;
        let gateway = &self.deps.gateways.vector_store;
        let collection = self.settings.collection.as_str();

        for batch in entries.chunks(self.settings.embed_batch_size.max(1)) {
            gateway
                .call("upsert", || store.upsert(collection, batch.to_vec()))
                .await?;
        }
        gateway
            .call("delete_stale", || {
                store.delete_stale(
                    collection,
                    &document.tenant_id,
                    &document.storage.bucket,
                    &document.document_id,
                    entries.len(),
                )
            })
            .await?;
        tracing::debug!(
            collection,
            document_id = %document.document_id,
            entries = entries.len(),
            "Document indexed"
        );
        Ok(())
    }

    fn finish_failed(&self, job_id: &JobId, error: StageError) {
        match self.registry.fail(job_id, &error) {
            Ok(progress) => {
                self.metrics.record_job_failed();
                tracing::error!(
                    job_id = %job_id,
                    document_id = %progress.document_id,
                    kind = %error.kind,
                    error = %error.message,
                    "Ingestion failed"
                );
            }
            Err(err) => {
                tracing::debug!(job_id = %job_id, error = %err, "Failure not recorded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingClientError, HashEmbeddingClient};
    use crate::gateway::{BreakerSettings, RetryPolicy, SystemClock};
    use crate::storage::FsObjectStore;
    use crate::vector::MemoryVectorStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const COLLECTION: &str = "docs_test_8";

    /// Fails the second call only.
    struct Flaky {
        calls: AtomicUsize,
        inner: HashEmbeddingClient,
    }

    #[async_trait]
    impl EmbeddingClient for Flaky {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(EmbeddingClientError::Upstream {
                    status: 503,
                    body: "warming up".into(),
                });
            }
            self.inner.embed(texts).await
        }
    }

    struct Gate {
        open: Semaphore,
        inner: HashEmbeddingClient,
    }

    #[async_trait]
    impl EmbeddingClient for Gate {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            if let Ok(permit) = self.open.acquire().await {
                permit.forget();
            }
            self.inner.embed(texts).await
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryVectorStore>,
        orchestrator: Orchestrator,
    }

    async fn fixture(embedder: Arc<dyn EmbeddingClient>, dimension: usize, max_jobs: usize) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let docs = dir.path().join("raw").join("docs");
        std::fs::create_dir_all(&docs).expect("mkdir");
        std::fs::write(docs.join("a.txt"), "First sentence here. Second sentence there.")
            .expect("write");
        std::fs::write(docs.join("blob"), [0u8, 1, 2, 3, 4, 5, 6, 7]).expect("write");

        let store = Arc::new(MemoryVectorStore::new());
        store.ensure_collection(COLLECTION, 8).await.expect("collection");
        let deps = PipelineDeps {
            object_store: Arc::new(FsObjectStore::new(dir.path())),
            embedder,
            vector_store: store.clone(),
            gateways: Gateways::new(
                BreakerSettings {
                    failure_threshold: 100,
                    ..BreakerSettings::default()
                },
                RetryPolicy::none(),
                Duration::from_secs(5),
                Arc::new(SystemClock::new()),
            ),
        };
        let mut settings = PipelineSettings::new(COLLECTION, dimension);
        settings.chunking.max_bytes = 24;
        settings.chunking.overlap_bytes = 0;
        settings.embed_batch_size = 1;
        settings.max_concurrent_jobs = max_jobs;
        settings.stage_retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let orchestrator = Orchestrator::new(
            deps,
            settings,
            Arc::new(JobRegistry::new()),
            Arc::new(PipelineMetrics::new()),
        );
        Fixture {
            _dir: dir,
            store,
            orchestrator,
        }
    }

    fn request(key: &str) -> IngestRequest {
        IngestRequest {
            tenant_id: "acme".into(),
            source_id: "upload".into(),
            bucket: "raw".into(),
            key: key.into(),
            overwrite: false,
            tags: vec!["Alpha".into()],
        }
    }

    async fn finished(orchestrator: &Orchestrator, job_id: &JobId) -> JobProgress {
        orchestrator.registry().wait_terminal(job_id).await;
        orchestrator.registry().progress(job_id).expect("progress")
    }

    #[tokio::test]
    async fn transient_embedding_failures_are_retried_and_batches_resume() {
        let embedder = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            inner: HashEmbeddingClient::new(8),
        });
        let fx = fixture(embedder.clone(), 8, 2).await;

        let job = fx.orchestrator.start(request("docs/a.txt")).expect("start");
        let progress = finished(&fx.orchestrator, &job).await;

        assert_eq!(progress.stage, Stage::Completed);
        assert_eq!(progress.chunks_total, 2);
        assert_eq!(progress.vectors_total, 2);
        assert_eq!(progress.last_error.map(|e| e.kind), Some(ErrorKind::Upstream));
        assert_eq!(fx.store.document_entry_count(COLLECTION, "a.txt"), 2);

        let record = fx.orchestrator.registry().record(&job).expect("record");
        let embedding = record
            .stages
            .iter()
            .find(|stage| stage.stage == Stage::Embedding)
            .expect("embedding stage");
        assert_eq!(embedding.attempts, 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(record.document.tags, vec!["alpha"]);
        assert!(record.document.content_hash.is_some());
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_without_retry() {
        let fx = fixture(Arc::new(HashEmbeddingClient::new(4)), 8, 2).await;
        let job = fx.orchestrator.start(request("docs/a.txt")).expect("start");
        let progress = finished(&fx.orchestrator, &job).await;

        assert_eq!(progress.stage, Stage::Failed);
        assert_eq!(
            progress.last_error.map(|e| e.kind),
            Some(ErrorKind::DimensionMismatch)
        );
        let record = fx.orchestrator.registry().record(&job).expect("record");
        let embedding = record
            .stages
            .iter()
            .find(|stage| stage.stage == Stage::Embedding)
            .expect("embedding stage");
        assert_eq!(embedding.attempts, 1);
        assert!(fx.store.is_empty(COLLECTION));
    }

    #[tokio::test]
    async fn missing_and_binary_documents_fail_fatally() {
        let fx = fixture(Arc::new(HashEmbeddingClient::new(8)), 8, 2).await;

        let missing = fx.orchestrator.start(request("docs/absent")).expect("start");
        let progress = finished(&fx.orchestrator, &missing).await;
        assert_eq!(progress.stage, Stage::Failed);
        assert_eq!(progress.last_error.map(|e| e.kind), Some(ErrorKind::Missing));

        let binary = fx.orchestrator.start(request("docs/blob")).expect("start");
        let progress = finished(&fx.orchestrator, &binary).await;
        assert_eq!(
            progress.last_error.map(|e| e.kind),
            Some(ErrorKind::Unsupported)
        );
    }

    #[tokio::test]
    async fn queued_jobs_wait_for_a_slot_and_can_be_aborted() {
        let gate = Arc::new(Gate {
            open: Semaphore::new(0),
            inner: HashEmbeddingClient::new(8),
        });
        let fx = fixture(gate.clone(), 8, 1).await;

        let running = fx.orchestrator.start(request("docs/a.txt")).expect("start");
        let mut blocked = request("docs/other");
        blocked.source_id = "second".into();
        let waiting = fx.orchestrator.start(blocked).expect("start");

        while fx.orchestrator.registry().progress(&running).map(|p| p.stage) != Some(Stage::Embedding) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(
            fx.orchestrator.registry().progress(&waiting).map(|p| p.stage),
            Some(Stage::Queued)
        );
        let aborted = fx.orchestrator.abort(&waiting).expect("abort");
        assert_eq!(aborted.stage, Stage::Aborted);
        assert!(matches!(
            fx.orchestrator.abort(&running),
            Err(IngestError::NotAbortable { .. })
        ));

        gate.open.add_permits(16);
        let progress = finished(&fx.orchestrator, &running).await;
        assert_eq!(progress.stage, Stage::Completed);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_synchronously() {
        let fx = fixture(Arc::new(HashEmbeddingClient::new(8)), 8, 1).await;
        assert!(matches!(
            fx.orchestrator.start(request("uploads/a.txt")),
            Err(IngestError::InvalidRequest(_))
        ));
    }
}
