//! Object store capability: existence, metadata, and byte fetches for raw source documents.
//!
//! Documents live under `docs/{document_id}` inside a bucket. A missing object is reported as
//! [`ObjectStoreError::Missing`], which the gateway treats as an answer rather than an outage.

mod fs;
mod http;

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;

use crate::gateway::Retryable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Key prefix under which raw source documents are stored.
pub const DOCUMENT_PREFIX: &str = "docs/";

/// Metadata headers/attributes reported for an object, keyed by lowercase name.
pub type ObjectMetadata = BTreeMap<String, String>;

/// Bucket + key address of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageRef {
    /// Bucket name.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
}

impl StorageRef {
    /// Reference a raw source document by id.
    pub fn for_document(bucket: impl Into<String>, document_id: &str) -> Self {
        Self {
            bucket: bucket.into(),
            key: format!("{DOCUMENT_PREFIX}{document_id}"),
        }
    }

    /// Document id encoded in a `docs/{document_id}` key.
    pub fn document_id(&self) -> Option<&str> {
        self.key
            .strip_prefix(DOCUMENT_PREFIX)
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }
}

impl std::fmt::Display for StorageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Errors raised by object store backends.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// No object exists at the reference.
    #[error("object {0} is missing")]
    Missing(StorageRef),
    /// Reference cannot be mapped onto the backend.
    #[error("invalid object reference: {0}")]
    InvalidReference(String),
    /// Base URL failed to parse.
    #[error("Invalid object store URL: {0}")]
    InvalidUrl(String),
    /// Backend answered with an unexpected status.
    #[error("Unexpected object store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// HTTP layer failed before receiving a response.
    #[error("object store request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Filesystem access failed.
    #[error("object store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Retryable for ObjectStoreError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Missing(_) | Self::InvalidReference(_) | Self::InvalidUrl(_) => false,
            Self::UnexpectedStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Io(_) => true,
        }
    }
}

/// Content-addressed storage holding raw source documents.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether an object exists at `location`.
    async fn exists(&self, location: &StorageRef) -> Result<bool, ObjectStoreError>;

    /// Object metadata (content type, length, and backend-specific attributes).
    async fn metadata(&self, location: &StorageRef) -> Result<ObjectMetadata, ObjectStoreError>;

    /// Full object contents.
    async fn bytes(&self, location: &StorageRef) -> Result<Vec<u8>, ObjectStoreError>;
}
