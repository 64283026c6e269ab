use async_trait::async_trait;
use futures_util::StreamExt;
use rustyrag::embedding::{EmbeddingClient, EmbeddingClientError, HashEmbeddingClient};
use rustyrag::gateway::{BreakerSettings, BreakerState, Gateways, RetryPolicy, SystemClock};
use rustyrag::pipeline::{
    ErrorKind, IngestRequest, JobId, JobProgress, PipelineDeps, PipelineSettings, ProgressEvent,
    Stage,
};
use rustyrag::search::{SearchError, SearchQuery, SearchSettings};
use rustyrag::service::{PipelineApi, PipelineService};
use rustyrag::storage::FsObjectStore;
use rustyrag::vector::MemoryVectorStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const COLLECTION: &str = "docs_e2e_16";
const DIMENSION: usize = 16;

struct Harness {
    dir: TempDir,
    store: Arc<MemoryVectorStore>,
    service: PipelineService,
}

impl Harness {
    async fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        let breaker = BreakerSettings {
            failure_threshold: 2,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            half_open_trials: 1,
        };
        let stage_retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        Self::with_policies(embedder, breaker, RetryPolicy::none(), stage_retry).await
    }

    async fn with_policies(
        embedder: Arc<dyn EmbeddingClient>,
        breaker: BreakerSettings,
        call_retry: RetryPolicy,
        stage_retry: RetryPolicy,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        for bucket in ["raw", "archive"] {
            std::fs::create_dir_all(dir.path().join(bucket).join("docs")).expect("mkdir");
        }
        let store = Arc::new(MemoryVectorStore::new());

        let deps = PipelineDeps {
            object_store: Arc::new(FsObjectStore::new(dir.path())),
            embedder,
            vector_store: store.clone(),
            gateways: Gateways::new(
                breaker,
                call_retry,
                Duration::from_secs(5),
                Arc::new(SystemClock::new()),
            ),
        };
        let mut pipeline = PipelineSettings::new(COLLECTION, DIMENSION);
        pipeline.chunking.max_bytes = 40;
        pipeline.chunking.overlap_bytes = 0;
        pipeline.embed_batch_size = 2;
        pipeline.stage_retry = stage_retry;
        let mut search = SearchSettings::new(COLLECTION, DIMENSION);
        search.max_top_k = 20;

        let service = PipelineService::from_parts(deps, pipeline, search)
            .await
            .expect("service");
        Self {
            dir,
            store,
            service,
        }
    }

    fn write(&self, document_id: &str, contents: &str) {
        self.write_to("raw", document_id, contents);
    }

    fn write_to(&self, bucket: &str, document_id: &str, contents: &str) {
        let path = self.dir.path().join(bucket).join("docs").join(document_id);
        std::fs::write(path, contents).expect("write document");
    }

    async fn ingest(&self, document_id: &str, tags: &[&str]) -> JobProgress {
        self.ingest_request(request(document_id, tags)).await
    }

    async fn ingest_request(&self, request: IngestRequest) -> JobProgress {
        let job_id = self.service.start_ingest(request).expect("start");
        self.finish(&job_id).await
    }

    async fn finish(&self, job_id: &JobId) -> JobProgress {
        let mut events = self.service.stream_progress(job_id).expect("stream");
        let mut last = None;
        while let Some(event) = events.next().await {
            if let ProgressEvent::Progress(progress) = event {
                last = Some(progress);
            }
        }
        last.expect("terminal progress")
    }
}

fn request(document_id: &str, tags: &[&str]) -> IngestRequest {
    scoped_request("acme", "raw", document_id, tags)
}

fn scoped_request(tenant_id: &str, bucket: &str, document_id: &str, tags: &[&str]) -> IngestRequest {
    IngestRequest {
        tenant_id: tenant_id.into(),
        source_id: "upload".into(),
        bucket: bucket.into(),
        key: format!("docs/{document_id}"),
        overwrite: false,
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
    }
}

const LONG_TEXT: &str = "Rust ownership keeps memory safe. Borrowing lets code read data without moving it. \
Lifetimes describe how long references stay valid. Traits define shared behavior across types. \
Async functions return futures that an executor drives.";

#[tokio::test]
async fn job_passes_every_stage_in_order() {
    let harness = Harness::new(Arc::new(HashEmbeddingClient::new(DIMENSION))).await;
    harness.write("guide.md", LONG_TEXT);

    let job_id = harness
        .service
        .start_ingest(request("guide.md", &["rust"]))
        .expect("start");
    let stages: Vec<Stage> = harness
        .service
        .stream_progress(&job_id)
        .expect("stream")
        .filter_map(|event| async move {
            match event {
                ProgressEvent::Progress(progress) => Some(progress.stage),
                ProgressEvent::Heartbeat { .. } => None,
            }
        })
        .collect()
        .await;

    assert_eq!(
        stages,
        vec![
            Stage::Queued,
            Stage::Normalizing,
            Stage::Chunking,
            Stage::Embedding,
            Stage::Indexing,
            Stage::Completed,
        ]
    );
    let progress = harness.service.job_progress(&job_id).expect("progress");
    assert!(progress.chunks_total > 1);
    assert_eq!(progress.chunks_total, progress.vectors_total);
    assert_eq!(
        harness.store.document_entry_count(COLLECTION, "guide.md"),
        progress.chunks_total
    );

    let report = harness.service.metrics_report();
    assert_eq!(report.counters.jobs_completed, 1);
    assert_eq!(report.counters.chunks_indexed, progress.chunks_total as u64);
}

#[tokio::test]
async fn reingestion_is_idempotent_and_prunes_stale_chunks() {
    let harness = Harness::new(Arc::new(HashEmbeddingClient::new(DIMENSION))).await;
    harness.write("guide.md", LONG_TEXT);

    let first = harness.ingest("guide.md", &[]).await;
    let second = harness.ingest("guide.md", &[]).await;
    assert_eq!(first.stage, Stage::Completed);
    assert_eq!(second.stage, Stage::Completed);
    assert_ne!(first.job_id, second.job_id);
    assert_eq!(
        harness.store.document_entry_count(COLLECTION, "guide.md"),
        first.chunks_total
    );

    harness.write("guide.md", "Short now.");
    let shrunk = harness.ingest("guide.md", &[]).await;
    assert_eq!(shrunk.chunks_total, 1);
    assert_eq!(harness.store.document_entry_count(COLLECTION, "guide.md"), 1);
}

#[tokio::test]
async fn same_document_id_across_tenants_and_buckets_stays_separate() {
    let harness = Harness::new(Arc::new(HashEmbeddingClient::new(DIMENSION))).await;
    harness.write("guide.md", LONG_TEXT);
    harness.write_to("archive", "guide.md", LONG_TEXT);

    let acme = harness.ingest("guide.md", &[]).await;
    let globex = harness
        .ingest_request(scoped_request("globex", "raw", "guide.md", &[]))
        .await;
    let archived = harness
        .ingest_request(scoped_request("acme", "archive", "guide.md", &[]))
        .await;
    for progress in [&acme, &globex, &archived] {
        assert_eq!(progress.stage, Stage::Completed);
    }
    let n = acme.chunks_total;
    assert_eq!(harness.store.document_entry_count(COLLECTION, "guide.md"), 3 * n);

    harness.write("guide.md", "Short now.");
    let shrunk = harness.ingest("guide.md", &[]).await;
    assert_eq!(shrunk.chunks_total, 1);
    assert_eq!(
        harness.store.document_entry_count(COLLECTION, "guide.md"),
        1 + 2 * n,
        "pruning one document must not touch another tenant or bucket"
    );

    let page = harness
        .service
        .search(SearchQuery::new("globex", "ownership", 20))
        .await
        .expect("page");
    assert_eq!(page.results.len(), n);
}

#[tokio::test]
async fn dropping_a_progress_stream_leaves_the_job_running() {
    let harness = Harness::new(Arc::new(HashEmbeddingClient::new(DIMENSION))).await;
    harness.write("guide.md", LONG_TEXT);

    let job_id = harness
        .service
        .start_ingest(request("guide.md", &[]))
        .expect("start");
    let mut abandoned = harness.service.stream_progress(&job_id).expect("stream");
    assert!(abandoned.next().await.is_some());
    drop(abandoned);

    assert_eq!(harness.finish(&job_id).await.stage, Stage::Completed);
    let progress = harness.service.job_progress(&job_id).expect("progress");
    assert_eq!(progress.stage, Stage::Completed);
}

#[tokio::test]
async fn concurrent_requests_coalesce_onto_one_job() {
    let harness = Harness::new(Arc::new(HashEmbeddingClient::new(DIMENSION))).await;
    harness.write("guide.md", LONG_TEXT);

    let first = harness
        .service
        .start_ingest(request("guide.md", &[]))
        .expect("start");
    let second = harness
        .service
        .start_ingest(request("guide.md", &[]))
        .expect("start");
    assert_eq!(first, second);
    assert_eq!(harness.finish(&first).await.stage, Stage::Completed);
    assert_eq!(harness.service.metrics_report().counters.jobs_started, 1);
}

#[tokio::test]
async fn paginated_search_is_contiguous_and_terminates() {
    let harness = Harness::new(Arc::new(HashEmbeddingClient::new(DIMENSION))).await;
    harness.write("guide.md", LONG_TEXT);
    harness.write("notes.txt", LONG_TEXT);
    harness.ingest("guide.md", &["Rust", "book"]).await;
    let notes = harness.ingest("notes.txt", &["rust"]).await;
    let total = notes.chunks_total * 2;

    let mut query = SearchQuery::new("acme", "how do references work", 3);
    let mut seen = Vec::new();
    let mut pages = 0;
    loop {
        let page = harness.service.search(query.clone()).await.expect("page");
        assert!(page.results.len() <= 3);
        seen.extend(
            page.results
                .iter()
                .map(|hit| (hit.document_id.clone(), hit.ordinal, hit.score)),
        );
        pages += 1;
        match page.next_cursor {
            Some(cursor) => query.cursor = Some(cursor),
            None => break,
        }
        assert!(pages <= total, "pagination did not terminate");
    }

    assert_eq!(seen.len(), total);
    let unique: HashSet<(String, usize)> = seen
        .iter()
        .map(|(document_id, ordinal, _)| (document_id.clone(), *ordinal))
        .collect();
    assert_eq!(unique.len(), total);
    for pair in seen.windows(2) {
        let (ref doc_a, ord_a, score_a) = pair[0];
        let (ref doc_b, ord_b, score_b) = pair[1];
        assert!(score_a >= score_b);
        if score_a == score_b {
            assert!((ord_a, doc_a) <= (ord_b, doc_b));
        }
    }

    let mut tagged = SearchQuery::new("acme", "ownership", 20);
    tagged.tags = vec!["book".into(), "RUST".into()];
    let page = harness.service.search(tagged).await.expect("page");
    assert!(!page.results.is_empty());
    assert!(page.results.iter().all(|hit| hit.document_id == "guide.md"));

    let mut stale = SearchQuery::new("acme", "something else", 3);
    stale.cursor = harness
        .service
        .search(SearchQuery::new("acme", "ownership", 3))
        .await
        .expect("page")
        .next_cursor;
    assert!(matches!(
        harness.service.search(stale).await,
        Err(SearchError::BadCursor(_))
    ));
}

struct Unavailable;

#[async_trait]
impl EmbeddingClient for Unavailable {
    async fn embed(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        Err(EmbeddingClientError::Upstream {
            status: 503,
            body: "overloaded".into(),
        })
    }
}

#[tokio::test]
async fn embedding_outage_fails_job_and_opens_breaker() {
    let harness = Harness::new(Arc::new(Unavailable)).await;
    harness.write("guide.md", LONG_TEXT);

    let progress = harness.ingest("guide.md", &[]).await;
    assert_eq!(progress.stage, Stage::Failed);
    let error = progress.last_error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::Upstream);
    assert!(error.message.contains("503"));
    assert_eq!(harness.store.document_entry_count(COLLECTION, "guide.md"), 0);

    let report = harness.service.metrics_report();
    assert_eq!(report.counters.jobs_failed, 1);
    let embedding = report
        .breakers
        .iter()
        .find(|breaker| breaker.service == "embedding")
        .expect("embedding breaker");
    assert_eq!(embedding.state, BreakerState::Open);

    assert!(matches!(
        harness.service.search(SearchQuery::new("acme", "anything", 3)).await,
        Err(SearchError::Unavailable { service }) if service == "embedding"
    ));
}

#[tokio::test]
async fn outage_under_default_policies_reports_the_upstream_failure() {
    let call_retry = RetryPolicy {
        max_attempts: 2,
        ..RetryPolicy::default()
    };
    let harness = Harness::with_policies(
        Arc::new(Unavailable),
        BreakerSettings::default(),
        call_retry,
        RetryPolicy::default(),
    )
    .await;
    harness.write("guide.md", LONG_TEXT);

    let progress = harness.ingest("guide.md", &[]).await;
    assert_eq!(progress.stage, Stage::Failed);
    let error = progress.last_error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::Upstream, "{}", error.message);
    assert!(error.message.contains("503"));

    let embedding = harness
        .service
        .metrics_report()
        .breakers
        .into_iter()
        .find(|breaker| breaker.service == "embedding")
        .expect("embedding breaker");
    assert_eq!(embedding.state, BreakerState::Open);
}
