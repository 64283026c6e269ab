//! Ranked, cursor-paginated retrieval over indexed chunks.

mod cursor;
mod service;

pub use cursor::{decode_cursor, encode_cursor, query_fingerprint};
pub use service::SearchService;

use crate::embedding::EmbeddingClientError;
use crate::gateway::GatewayError;
use crate::vector::VectorStoreError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Search parameters fixed by configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    /// Collection queried; shared with ingestion.
    pub collection: String,
    /// Expected query vector dimensionality.
    pub dimension: usize,
    /// Largest accepted page size.
    pub max_top_k: usize,
    /// Deepest rank a cursor may reach.
    pub max_window: usize,
    /// Minimum similarity forwarded to the vector store.
    pub score_threshold: Option<f32>,
}

impl SearchSettings {
    /// Defaults for `collection` with `dimension`-sized vectors.
    pub fn new(collection: impl Into<String>, dimension: usize) -> Self {
        Self {
            collection: collection.into(),
            dimension,
            max_top_k: 100,
            max_window: 1_000,
            score_threshold: None,
        }
    }
}

/// Result ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Similarity descending.
    #[default]
    Relevance,
    /// Most recently indexed first.
    Recency,
}

impl SortBy {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::Recency => "recency",
        }
    }
}

impl FromStr for SortBy {
    type Err = SearchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "relevance" => Ok(Self::Relevance),
            "recency" => Ok(Self::Recency),
            other => Err(SearchError::InvalidRequest(format!(
                "sort_by must be `relevance` or `recency`, got `{other}`"
            ))),
        }
    }
}

/// One search request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchQuery {
    /// Tenant whose documents are searched.
    pub tenant_id: String,
    /// Free-text query.
    pub query: String,
    /// Page size.
    pub top_k: usize,
    /// Token returned as `next_cursor` by the previous page.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Restrict results to one document.
    #[serde(default)]
    pub doc_id: Option<String>,
    /// Required tags; every tag must match.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Result ordering.
    #[serde(default)]
    pub sort_by: SortBy,
}

impl SearchQuery {
    /// Relevance-ordered first page for `query`.
    pub fn new(tenant_id: impl Into<String>, query: impl Into<String>, top_k: usize) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            query: query.into(),
            top_k,
            cursor: None,
            doc_id: None,
            tags: Vec::new(),
            sort_by: SortBy::Relevance,
        }
    }
}

/// One ranked chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Similarity to the query; higher is closer.
    pub score: f32,
    /// Chunk text.
    pub text: String,
    /// Owning document.
    pub document_id: String,
    /// Chunk position within the document.
    pub ordinal: usize,
    /// Document tags.
    pub tags: Vec<String>,
    /// Stable entry key.
    pub chunk_id: String,
    /// Source the document came from.
    pub source_id: String,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResultPage {
    /// Hits in rank order.
    pub results: Vec<SearchHit>,
    /// Token for the following page; absent once results are exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Search failures.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Query parameters are unusable.
    #[error("invalid search request: {0}")]
    InvalidRequest(String),
    /// Cursor is malformed or belongs to a different query.
    #[error("bad cursor: {0}")]
    BadCursor(String),
    /// A dependency's breaker is open.
    #[error("{service} unavailable")]
    Unavailable {
        /// Dependency refusing calls.
        service: String,
    },
    /// A dependency failed or timed out.
    #[error("upstream failure: {0}")]
    Upstream(String),
    /// Query vector does not fit the collection.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl<E> From<GatewayError<E>> for SearchError
where
    E: Into<SearchError>,
{
    fn from(error: GatewayError<E>) -> Self {
        match error {
            GatewayError::CircuitOpen { service } => Self::Unavailable { service },
            GatewayError::Timeout {
                service,
                operation,
                timeout_ms,
            } => Self::Upstream(format!(
                "{service} call `{operation}` timed out after {timeout_ms}ms"
            )),
            GatewayError::Call(inner) => inner.into(),
        }
    }
}

impl From<EmbeddingClientError> for SearchError {
    fn from(error: EmbeddingClientError) -> Self {
        Self::Upstream(error.to_string())
    }
}

impl From<VectorStoreError> for SearchError {
    fn from(error: VectorStoreError) -> Self {
        match error {
            VectorStoreError::DimensionMismatch { .. } => {
                Self::DimensionMismatch(error.to_string())
            }
            other => Self::Upstream(other.to_string()),
        }
    }
}
