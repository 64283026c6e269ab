//! Stage failure taxonomy and synchronous request errors.

use super::{JobId, Stage};
use crate::embedding::EmbeddingClientError;
use crate::gateway::{GatewayError, Retryable};
use crate::processing::{ChunkingError, NormalizeError};
use crate::storage::ObjectStoreError;
use crate::vector::VectorStoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification recorded as a job's `last_error.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An external call exceeded its timeout.
    Timeout,
    /// A dependency's breaker was open.
    CircuitOpen,
    /// A dependency answered with an error.
    Upstream,
    /// The source object does not exist.
    Missing,
    /// The document is empty or structurally broken.
    Malformed,
    /// The document is not text.
    Unsupported,
    /// A vector's length differs from the collection's.
    DimensionMismatch,
    /// A newer job for the same document replaced this one.
    Superseded,
    /// Misconfiguration or an unexpected internal condition.
    Internal,
}

impl ErrorKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::Upstream => "upstream",
            Self::Missing => "missing",
            Self::Malformed => "malformed",
            Self::Unsupported => "unsupported",
            Self::DimensionMismatch => "dimension_mismatch",
            Self::Superseded => "superseded",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single stage attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Whether the stage may be attempted again.
    pub retryable: bool,
}

impl StageError {
    /// Error that another attempt may clear.
    pub fn transient(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }

    /// Error that fails the job immediately.
    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }
}

impl<E> From<GatewayError<E>> for StageError
where
    E: Into<StageError>,
{
    fn from(error: GatewayError<E>) -> Self {
        match error {
            GatewayError::CircuitOpen { service } => {
                Self::transient(ErrorKind::CircuitOpen, format!("{service} circuit open"))
            }
            GatewayError::Timeout {
                service,
                operation,
                timeout_ms,
            } => Self::transient(
                ErrorKind::Timeout,
                format!("{service} `{operation}` timed out after {timeout_ms}ms"),
            ),
            GatewayError::Call(inner) => inner.into(),
        }
    }
}

impl From<ObjectStoreError> for StageError {
    fn from(error: ObjectStoreError) -> Self {
        let retryable = error.is_retryable();
        let kind = match &error {
            ObjectStoreError::Missing(_) => ErrorKind::Missing,
            ObjectStoreError::InvalidReference(_) => ErrorKind::Malformed,
            ObjectStoreError::InvalidUrl(_) => ErrorKind::Internal,
            _ => ErrorKind::Upstream,
        };
        Self {
            kind,
            message: error.to_string(),
            retryable,
        }
    }
}

impl From<EmbeddingClientError> for StageError {
    fn from(error: EmbeddingClientError) -> Self {
        let retryable = error.is_retryable();
        let kind = match &error {
            EmbeddingClientError::InvalidInput(_) => ErrorKind::Internal,
            _ => ErrorKind::Upstream,
        };
        Self {
            kind,
            message: error.to_string(),
            retryable,
        }
    }
}

impl From<VectorStoreError> for StageError {
    fn from(error: VectorStoreError) -> Self {
        let retryable = error.is_retryable();
        let kind = match &error {
            VectorStoreError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            VectorStoreError::UnknownCollection(_) | VectorStoreError::InvalidUrl(_) => {
                ErrorKind::Internal
            }
            _ => ErrorKind::Upstream,
        };
        Self {
            kind,
            message: error.to_string(),
            retryable,
        }
    }
}

impl From<NormalizeError> for StageError {
    fn from(error: NormalizeError) -> Self {
        let kind = match &error {
            NormalizeError::Unsupported(_) => ErrorKind::Unsupported,
            NormalizeError::Malformed(_) => ErrorKind::Malformed,
        };
        Self::fatal(kind, error.to_string())
    }
}

impl From<ChunkingError> for StageError {
    fn from(error: ChunkingError) -> Self {
        Self::fatal(ErrorKind::Internal, error.to_string())
    }
}

/// Errors returned synchronously to callers of the ingestion entry points.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    /// Request fields are missing or malformed.
    #[error("invalid ingest request: {0}")]
    InvalidRequest(String),
    /// No job with this id exists.
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    /// Only queued jobs can be aborted.
    #[error("job {job_id} is {stage} and can no longer be aborted")]
    NotAbortable {
        /// Job the abort targeted.
        job_id: JobId,
        /// Stage the job was in.
        stage: Stage,
    },
}
