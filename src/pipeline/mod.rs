//! Ingestion pipeline: normalize → chunk → embed → index, one job per document.
//!
//! [`Orchestrator`] admits jobs through the [`JobRegistry`], runs each one on its own task,
//! and retries transient stage failures with bounded exponential backoff. Progress is read
//! from the registry or followed with [`progress_stream`].

mod error;
mod job;
mod orchestrator;
mod progress;
mod registry;
mod stage;

pub use error::{ErrorKind, IngestError, StageError};
pub use job::{
    Document, ErrorSummary, IngestRequest, JobId, JobProgress, JobRecord, StageRecord,
};
pub use orchestrator::{Orchestrator, PipelineDeps};
pub use progress::{ProgressEvent, progress_stream};
pub use registry::{Admission, DEFAULT_RETAINED_JOBS, JobRegistry, TransitionError};
pub use stage::Stage;

pub(crate) use job::unix_millis_now;

use crate::gateway::RetryPolicy;
use crate::processing::ChunkingSettings;
use std::time::Duration;
use uuid::Uuid;

/// Orchestrator parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Collection written by the index stage.
    pub collection: String,
    /// Dimensionality every vector must have.
    pub dimension: usize,
    /// Chunker bounds.
    pub chunking: ChunkingSettings,
    /// Texts per embedding call and entries per upsert.
    pub embed_batch_size: usize,
    /// Per-stage attempt cap and backoff.
    pub stage_retry: RetryPolicy,
    /// Jobs allowed past `queued` at once.
    pub max_concurrent_jobs: usize,
    /// Finished jobs the registry keeps before evicting the oldest.
    pub max_retained_jobs: usize,
    /// Idle interval between progress heartbeats.
    pub heartbeat: Duration,
}

impl PipelineSettings {
    /// Defaults for `collection` vectors of `dimension` components.
    pub fn new(collection: impl Into<String>, dimension: usize) -> Self {
        Self {
            collection: collection.into(),
            dimension,
            chunking: ChunkingSettings::default(),
            embed_batch_size: 32,
            stage_retry: RetryPolicy::default(),
            max_concurrent_jobs: 4,
            max_retained_jobs: DEFAULT_RETAINED_JOBS,
            heartbeat: Duration::from_secs(15),
        }
    }
}

/// Deterministic chunk id, so re-ingesting a document overwrites its previous entries.
///
/// Each component is length-prefixed before hashing, so no choice of separator characters in
/// one component can make two different documents share an id.
pub fn chunk_id(tenant_id: &str, bucket: &str, document_id: &str, ordinal: usize) -> String {
    let mut name = Vec::with_capacity(tenant_id.len() + bucket.len() + document_id.len() + 32);
    for part in [tenant_id, bucket, document_id] {
        name.extend_from_slice(&(part.len() as u64).to_be_bytes());
        name.extend_from_slice(part.as_bytes());
    }
    name.extend_from_slice(&(ordinal as u64).to_be_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_stable_and_distinct() {
        let id = chunk_id("acme", "raw", "doc", 0);
        assert_eq!(id, chunk_id("acme", "raw", "doc", 0));
        assert_ne!(id, chunk_id("acme", "raw", "doc", 1));
        assert_ne!(id, chunk_id("globex", "raw", "doc", 0));
        assert_ne!(id, chunk_id("acme", "archive", "doc", 0));
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn separators_inside_components_do_not_collide() {
        assert_ne!(
            chunk_id("a:b", "raw", "c", 0),
            chunk_id("a", "raw", "b:c", 0)
        );
        assert_ne!(
            chunk_id("acme", "raw:docs", "x", 0),
            chunk_id("acme", "raw", "docs:x", 0)
        );
        assert_ne!(chunk_id("acme", "", "raw", 0), chunk_id("acme", "raw", "", 0));
    }
}
