//! Job, document, and progress records.

use super::{ErrorKind, IngestError, Stage, StageError};
use crate::processing::DocumentKind;
use crate::processing::sanitize::{sanitize_identifier, sanitize_tags};
use crate::storage::StorageRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Opaque ingestion job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller request to ingest one stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Caller-defined source label.
    pub source_id: String,
    /// Bucket holding the raw document.
    pub bucket: String,
    /// Object key, `docs/{document_id}`.
    pub key: String,
    /// Replace an in-flight job for the same document instead of joining it.
    #[serde(default)]
    pub overwrite: bool,
    /// Labels stored on every chunk.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl IngestRequest {
    /// Check required fields and derive the document record.
    pub fn into_document(self) -> Result<Document, IngestError> {
        let tenant_id = sanitize_identifier(&self.tenant_id)
            .ok_or_else(|| IngestError::InvalidRequest("tenant_id is required".into()))?;
        let source_id = sanitize_identifier(&self.source_id)
            .ok_or_else(|| IngestError::InvalidRequest("source_id is required".into()))?;
        let bucket = sanitize_identifier(&self.bucket)
            .ok_or_else(|| IngestError::InvalidRequest("bucket is required".into()))?;
        let storage = StorageRef {
            bucket,
            key: self.key.trim().to_string(),
        };
        let document_id = storage
            .document_id()
            .map(str::to_string)
            .ok_or_else(|| {
                IngestError::InvalidRequest(format!(
                    "key `{}` must have the form docs/{{document_id}}",
                    storage.key
                ))
            })?;

        Ok(Document {
            document_id,
            tenant_id,
            source_id,
            storage,
            tags: sanitize_tags(&self.tags),
            content_hash: None,
            kind: None,
            created_at: timestamp_now(),
        })
    }
}

/// Document owned by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    /// Identifier parsed from the storage key.
    pub document_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Caller-defined source label.
    pub source_id: String,
    /// Location of the raw bytes.
    pub storage: StorageRef,
    /// Sanitized labels.
    pub tags: Vec<String>,
    /// SHA-256 of the raw bytes, once fetched.
    pub content_hash: Option<String>,
    /// Decoding kind, once detected.
    pub kind: Option<DocumentKind>,
    /// RFC3339 creation time.
    pub created_at: String,
}

/// Last recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Classification.
    pub kind: ErrorKind,
    /// Detail.
    pub message: String,
}

impl From<&StageError> for ErrorSummary {
    fn from(error: &StageError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
        }
    }
}

/// Observable job state, also the payload of progress events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Job identifier.
    pub job_id: JobId,
    /// Document being ingested.
    pub document_id: String,
    /// Current stage.
    pub stage: Stage,
    /// Failed attempts of the current stage.
    pub attempts: u32,
    /// Most recent failure, kept after later successes.
    pub last_error: Option<ErrorSummary>,
    /// Chunks produced by the chunking stage.
    pub chunks_total: usize,
    /// Vectors produced so far.
    pub vectors_total: usize,
    /// RFC3339 time of the last change.
    pub updated_at: String,
}

/// Entry and exit of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    /// Stage entered.
    pub stage: Stage,
    /// Failed attempts while in the stage.
    pub attempts: u32,
    /// RFC3339 entry time.
    pub entered_at: String,
    /// RFC3339 exit time; `None` while current.
    pub exited_at: Option<String>,
}

/// Full job state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    /// Job identifier.
    pub job_id: JobId,
    /// Document being ingested.
    pub document: Document,
    /// Stage history, oldest first.
    pub stages: Vec<StageRecord>,
    /// Current snapshot.
    pub progress: JobProgress,
}

impl JobRecord {
    pub(crate) fn new(job_id: JobId, document: Document) -> Self {
        let now = timestamp_now();
        let progress = JobProgress {
            job_id: job_id.clone(),
            document_id: document.document_id.clone(),
            stage: Stage::Queued,
            attempts: 0,
            last_error: None,
            chunks_total: 0,
            vectors_total: 0,
            updated_at: now.clone(),
        };
        Self {
            job_id,
            document,
            stages: vec![StageRecord {
                stage: Stage::Queued,
                attempts: 0,
                entered_at: now,
                exited_at: None,
            }],
            progress,
        }
    }
}

/// Current time in RFC3339.
pub(crate) fn timestamp_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Current time in Unix milliseconds.
pub(crate) fn unix_millis_now() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str) -> IngestRequest {
        IngestRequest {
            tenant_id: " acme ".into(),
            source_id: "upload".into(),
            bucket: "raw".into(),
            key: key.into(),
            overwrite: false,
            tags: vec!["Finance".into(), "finance".into(), " q3 ".into()],
        }
    }

    #[test]
    fn document_id_comes_from_key() {
        let document = request("docs/report-7").into_document().expect("document");
        assert_eq!(document.document_id, "report-7");
        assert_eq!(document.tenant_id, "acme");
        assert_eq!(document.tags, vec!["finance", "q3"]);
    }

    #[test]
    fn rejects_keys_outside_docs_prefix_and_blank_fields() {
        assert!(matches!(
            request("images/report-7").into_document(),
            Err(IngestError::InvalidRequest(_))
        ));
        let mut blank = request("docs/a");
        blank.tenant_id = "  ".into();
        assert!(matches!(
            blank.into_document(),
            Err(IngestError::InvalidRequest(_))
        ));
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let now = timestamp_now();
        assert!(now.contains('T') && now.ends_with('Z'));
        assert!(unix_millis_now() > 1_600_000_000_000);
    }
}
