//! HTTP surface for the ingestion pipeline.
//!
//! - `POST /ingest` – Register `{tenant_id, source_id, bucket, key, overwrite?, tags?}` and
//!   return `202 {job_id}` immediately.
//! - `GET /jobs/:job_id` – Progress snapshot.
//! - `DELETE /jobs/:job_id` – Abort a queued job (`409` once it has started).
//! - `GET /jobs/:job_id/events` – Server-Sent Events: `progress` per transition, `heartbeat`
//!   while idle; the stream closes after the terminal event.
//! - `GET /search` – Ranked page `{results, next_cursor?}`; `tags` is a comma-separated list.
//! - `GET /metrics` – Pipeline counters and breaker states.

use crate::pipeline::{IngestError, IngestRequest, JobId, JobProgress};
use crate::processing::sanitize::parse_tag_list;
use crate::search::{SearchError, SearchQuery, SearchResultPage, SortBy};
use crate::service::{MetricsReport, PipelineApi};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

const DEFAULT_TOP_K: usize = 10;

/// Build the HTTP router over a pipeline implementation.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: PipelineApi + 'static,
{
    Router::new()
        .route("/ingest", post(start_ingest::<S>))
        .route(
            "/jobs/:job_id",
            get(job_progress::<S>).delete(abort_job::<S>),
        )
        .route("/jobs/:job_id/events", get(job_events::<S>))
        .route("/search", get(search::<S>))
        .route("/metrics", get(metrics::<S>))
        .with_state(service)
}

#[derive(Serialize)]
struct IngestAccepted {
    job_id: JobId,
}

async fn start_ingest<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestAccepted>), AppError>
where
    S: PipelineApi,
{
    let job_id = service.start_ingest(request)?;
    Ok((StatusCode::ACCEPTED, Json(IngestAccepted { job_id })))
}

async fn job_progress<S>(
    State(service): State<Arc<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, AppError>
where
    S: PipelineApi,
{
    Ok(Json(service.job_progress(&JobId::from(job_id))?))
}

async fn abort_job<S>(
    State(service): State<Arc<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, AppError>
where
    S: PipelineApi,
{
    Ok(Json(service.abort(&JobId::from(job_id))?))
}

/// Progress as SSE. The client disconnecting drops the stream, which is all the cleanup needed.
async fn job_events<S>(
    State(service): State<Arc<S>>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError>
where
    S: PipelineApi,
{
    let events = service
        .stream_progress(&JobId::from(job_id))?
        .map(|event| Event::default().event(event.name()).json_data(&event));
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Query string of `GET /search`.
#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    query: String,
    /// Parsed in the handler.
    #[serde(default)]
    top_k: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    doc_id: Option<String>,
    /// Comma-separated tag list; every tag must match.
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    sort_by: Option<String>,
}

impl SearchParams {
    fn top_k(&self) -> Result<usize, SearchError> {
        match self.top_k.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
            None => Ok(DEFAULT_TOP_K),
            Some(raw) => raw.parse().map_err(|_| {
                SearchError::InvalidRequest(format!("top_k must be a positive integer, got `{raw}`"))
            }),
        }
    }

    fn sort_by(&self) -> Result<SortBy, SearchError> {
        match self.sort_by.as_deref().filter(|raw| !raw.trim().is_empty()) {
            None => Ok(SortBy::default()),
            Some(raw) => raw.parse(),
        }
    }
}

async fn search<S>(
    State(service): State<Arc<S>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResultPage>, AppError>
where
    S: PipelineApi,
{
    let top_k = params.top_k()?;
    let sort_by = params.sort_by()?;
    let query = SearchQuery {
        tenant_id: params.tenant_id,
        query: params.query,
        top_k,
        cursor: params.cursor,
        doc_id: params.doc_id,
        tags: parse_tag_list(params.tags.as_deref()),
        sort_by,
    };
    Ok(Json(service.search(query).await?))
}

async fn metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsReport>
where
    S: PipelineApi,
{
    Json(service.metrics_report())
}

enum AppError {
    Ingest(IngestError),
    Search(SearchError),
}

impl From<IngestError> for AppError {
    fn from(inner: IngestError) -> Self {
        Self::Ingest(inner)
    }
}

impl From<SearchError> for AppError {
    fn from(inner: SearchError) -> Self {
        Self::Search(inner)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            Self::Ingest(err) => {
                let (status, kind) = match err {
                    IngestError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                    IngestError::UnknownJob(_) => (StatusCode::NOT_FOUND, "unknown_job"),
                    IngestError::NotAbortable { .. } => (StatusCode::CONFLICT, "not_abortable"),
                };
                (status, kind, err.to_string())
            }
            Self::Search(err) => {
                let (status, kind) = match err {
                    SearchError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
                    SearchError::BadCursor(_) => (StatusCode::BAD_REQUEST, "bad_cursor"),
                    SearchError::Unavailable { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
                    }
                    SearchError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream"),
                    SearchError::DimensionMismatch(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "dimension_mismatch")
                    }
                };
                (status, kind, err.to_string())
            }
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), kind, error = %message, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), kind, error = %message, "Request rejected");
        }
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}
