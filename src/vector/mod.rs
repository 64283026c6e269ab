//! Vector store capability shared by the index stage and search.
//!
//! Entries are keyed by chunk id, so upserting the same id twice replaces the earlier entry.
//! Search results come back ranked by [`compare_ranked`]: similarity first, then ascending
//! chunk ordinal, then ascending document id.

mod memory;

pub use memory::MemoryVectorStore;

use crate::gateway::Retryable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Payload stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPayload {
    /// Owning tenant.
    pub tenant_id: String,
    /// Object store bucket the document was read from.
    #[serde(default)]
    pub bucket: String,
    /// Parent document.
    pub document_id: String,
    /// Caller-supplied source identifier.
    pub source_id: String,
    /// Position of the chunk within its document.
    pub ordinal: usize,
    /// Byte offset where the chunk starts in the normalized text.
    pub start: usize,
    /// Byte offset one past the chunk's last byte.
    pub end: usize,
    /// Chunk text.
    pub text: String,
    /// Tag labels used for filtering.
    #[serde(default)]
    pub tags: Vec<String>,
    /// SHA-256 of the source document bytes.
    pub content_hash: String,
    /// Unix milliseconds at which the entry was written.
    pub indexed_at_ms: i64,
}

/// Vector store record: a chunk's embedding plus its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEntry {
    /// Chunk id; the upsert key.
    pub chunk_id: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Stored payload.
    pub payload: EntryPayload,
}

/// Search hit returned by a vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    /// Chunk id.
    pub id: String,
    /// Similarity; higher is better.
    pub score: f32,
    /// Stored payload.
    pub payload: EntryPayload,
}

/// Constraints applied to a similarity search. Tenant scoping is mandatory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    /// Tenant whose entries are searched.
    pub tenant_id: String,
    /// Restrict results to one document.
    pub document_id: Option<String>,
    /// Every listed tag must be present on an entry.
    pub tags: Vec<String>,
}

impl SearchFilter {
    /// Whether `payload` satisfies the filter.
    pub fn matches(&self, payload: &EntryPayload) -> bool {
        payload.tenant_id == self.tenant_id
            && self
                .document_id
                .as_ref()
                .is_none_or(|document_id| &payload.document_id == document_id)
            && self.tags.iter().all(|tag| payload.tags.contains(tag))
    }
}

/// Errors raised by vector store backends.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// Base URL failed to parse.
    #[error("Invalid vector store URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Backend answered with an unexpected status.
    #[error("Unexpected vector store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// Collection has not been created.
    #[error("collection `{0}` does not exist")]
    UnknownCollection(String),
    /// Vector length differs from the collection's dimensionality.
    #[error("vector has {actual} dimensions but collection expects {expected}")]
    DimensionMismatch {
        /// Collection dimensionality.
        expected: usize,
        /// Offending vector length.
        actual: usize,
    },
    /// Backend response could not be interpreted.
    #[error("Malformed vector store response: {0}")]
    InvalidResponse(String),
}

impl Retryable for VectorStoreError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::InvalidUrl(_)
            | Self::UnknownCollection(_)
            | Self::DimensionMismatch { .. }
            | Self::InvalidResponse(_) => false,
        }
    }
}

/// Similarity-search storage for chunk embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create `collection` with `dimension`-sized vectors if it does not exist yet.
    async fn ensure_collection(
        &self,
        collection: &str,
        dimension: usize,
    ) -> Result<(), VectorStoreError>;

    /// Insert or replace entries keyed by chunk id. Returns the number written.
    async fn upsert(
        &self,
        collection: &str,
        entries: Vec<IndexedEntry>,
    ) -> Result<usize, VectorStoreError>;

    /// Up to `limit` entries matching `filter`, ranked by [`compare_ranked`].
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: &SearchFilter,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredEntry>, VectorStoreError>;

    /// Remove a document's entries whose ordinal is `keep_below` or greater. The document is
    /// identified by tenant, bucket, and document id together.
    async fn delete_stale(
        &self,
        collection: &str,
        tenant_id: &str,
        bucket: &str,
        document_id: &str,
        keep_below: usize,
    ) -> Result<(), VectorStoreError>;
}

/// Relevance order: score descending, then ordinal ascending, then document id ascending.
pub fn compare_ranked(a: &ScoredEntry, b: &ScoredEntry) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| compare_tie_break(&a.payload, &b.payload))
}

/// Deterministic tie-break on equal primary keys.
pub fn compare_tie_break(a: &EntryPayload, b: &EntryPayload) -> Ordering {
    a.ordinal
        .cmp(&b.ordinal)
        .then_with(|| a.document_id.cmp(&b.document_id))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn payload(document_id: &str, ordinal: usize) -> EntryPayload {
        EntryPayload {
            tenant_id: "acme".into(),
            bucket: "raw".into(),
            document_id: document_id.into(),
            source_id: "upload".into(),
            ordinal,
            start: 0,
            end: 4,
            text: format!("{document_id}#{ordinal}"),
            tags: Vec::new(),
            content_hash: "hash".into(),
            indexed_at_ms: 0,
        }
    }

    pub(crate) fn entry(document_id: &str, ordinal: usize, vector: Vec<f32>) -> IndexedEntry {
        IndexedEntry {
            chunk_id: format!("{document_id}:{ordinal}"),
            vector,
            payload: payload(document_id, ordinal),
        }
    }
}
