//! Process-wide job table.
//!
//! The registry is the single mutual-exclusion point of the pipeline: admitting a job checks for
//! an in-flight job of the same `(tenant, bucket, key)` and records the new one under the same
//! lock. Every transition is appended to the job's event history and announced through a
//! `watch` channel, so progress streams can replay from any position without missing a stage.
//!
//! Finished jobs are kept for lookups up to a retention cap; past it the oldest finished job is
//! dropped together with its history. Jobs that have not finished are never evicted.

use super::job::{Document, ErrorSummary, JobProgress, JobRecord, StageRecord, timestamp_now};
use super::{IngestError, JobId, Stage, StageError};
use crate::processing::DocumentKind;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

type DocumentKey = (String, String, String);

/// Finished jobs retained by [`JobRegistry::new`].
pub const DEFAULT_RETAINED_JOBS: usize = 1_000;

/// Result of [`JobRegistry::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new job was recorded in `queued`.
    Created {
        /// New job.
        job_id: JobId,
        /// Superseded job still running; the new job must wait for it to finish.
        wait_for: Option<JobId>,
        /// Superseded job that was still queued and has been aborted.
        aborted: Option<JobId>,
    },
    /// An in-flight job for the same document was returned instead.
    Coalesced(JobId),
}

/// Rejected state change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// Job id not present.
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    /// Transition table forbids the move.
    #[error("job {job_id} cannot move from {from} to {to}")]
    Illegal {
        /// Job concerned.
        job_id: JobId,
        /// Current stage.
        from: Stage,
        /// Requested stage.
        to: Stage,
    },
}

struct JobEntry {
    record: JobRecord,
    history: Vec<JobProgress>,
    version: watch::Sender<usize>,
    superseded: bool,
    /// Superseded job that must finish before this one starts.
    waits_for: Option<JobId>,
}

impl JobEntry {
    fn key(&self) -> DocumentKey {
        let document = &self.record.document;
        (
            document.tenant_id.clone(),
            document.storage.bucket.clone(),
            document.storage.key.clone(),
        )
    }

    fn publish(&mut self) {
        self.history.push(self.record.progress.clone());
        let len = self.history.len();
        self.version.send_modify(|version| *version = len);
    }

    fn touch(&mut self) {
        self.record.progress.updated_at = timestamp_now();
    }
}

struct Inner {
    jobs: HashMap<JobId, JobEntry>,
    in_flight: HashMap<DocumentKey, JobId>,
    /// Terminal jobs, oldest first.
    finished: VecDeque<JobId>,
    retain: usize,
}

impl Inner {
    fn apply_transition(&mut self, job_id: &JobId, to: Stage) -> Result<JobProgress, TransitionError> {
        let entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| TransitionError::UnknownJob(job_id.clone()))?;
        let from = entry.record.progress.stage;
        if !from.can_transition(to) {
            return Err(TransitionError::Illegal {
                job_id: job_id.clone(),
                from,
                to,
            });
        }

        let now = timestamp_now();
        if let Some(current) = entry.record.stages.last_mut() {
            current.exited_at = Some(now.clone());
        }
        entry.record.stages.push(StageRecord {
            stage: to,
            attempts: 0,
            entered_at: now.clone(),
            exited_at: to.is_terminal().then(|| now.clone()),
        });
        entry.record.progress.stage = to;
        entry.record.progress.attempts = 0;
        entry.record.progress.updated_at = now;
        entry.publish();
        let progress = entry.record.progress.clone();

        if to.is_terminal() {
            let key = entry.key();
            if self.in_flight.get(&key) == Some(job_id) {
                self.in_flight.remove(&key);
            }
            self.finished.push_back(job_id.clone());
            self.evict();
        }
        Ok(progress)
    }

    fn evict(&mut self) {
        while self.finished.len() > self.retain {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            self.jobs.remove(&oldest);
            tracing::debug!(job_id = %oldest, "Finished job evicted from registry");
        }
    }
}

/// Shared table of ingestion jobs.
pub struct JobRegistry {
    inner: Mutex<Inner>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Create an empty registry keeping [`DEFAULT_RETAINED_JOBS`] finished jobs.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_JOBS)
    }

    /// Create an empty registry keeping at most `retain` finished jobs (at least one).
    pub fn with_retention(retain: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                in_flight: HashMap::new(),
                finished: VecDeque::new(),
                retain: retain.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically coalesce with, supersede, or create a job for `document`.
    ///
    /// Without `overwrite` an in-flight job for the same document is returned unchanged. With
    /// `overwrite` a new job is always created; the previous one is aborted when still queued
    /// and otherwise flagged to fail with `superseded` at its next stage boundary.
    pub fn admit(&self, document: Document, overwrite: bool) -> Admission {
        let mut inner = self.lock();
        let key = (
            document.tenant_id.clone(),
            document.storage.bucket.clone(),
            document.storage.key.clone(),
        );

        let mut wait_for = None;
        let mut aborted = None;
        if let Some(existing) = inner.in_flight.get(&key).cloned() {
            if !overwrite {
                return Admission::Coalesced(existing);
            }
            let queued = inner
                .jobs
                .get(&existing)
                .filter(|entry| entry.record.progress.stage == Stage::Queued)
                .map(|entry| entry.waits_for.clone());
            if let Some(inherited) = queued {
                // The aborted job may itself have been waiting on a running predecessor.
                wait_for = inherited;
                if inner.apply_transition(&existing, Stage::Aborted).is_ok() {
                    aborted = Some(existing);
                }
            } else if let Some(entry) = inner.jobs.get_mut(&existing) {
                entry.superseded = true;
                wait_for = Some(existing);
            }
        }

        let job_id = JobId::generate();
        let mut entry = JobEntry {
            record: JobRecord::new(job_id.clone(), document),
            history: Vec::new(),
            version: watch::channel(0).0,
            superseded: false,
            waits_for: wait_for.clone(),
        };
        entry.publish();
        inner.jobs.insert(job_id.clone(), entry);
        inner.in_flight.insert(key, job_id.clone());

        Admission::Created {
            job_id,
            wait_for,
            aborted,
        }
    }

    /// Move a job along the transition table and publish the new state.
    pub fn transition(&self, job_id: &JobId, to: Stage) -> Result<JobProgress, TransitionError> {
        self.lock().apply_transition(job_id, to)
    }

    /// Count a failed attempt of the current stage.
    pub fn record_failure(&self, job_id: &JobId, error: &StageError) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(job_id) {
            entry.record.progress.attempts += 1;
            entry.record.progress.last_error = Some(ErrorSummary::from(error));
            if let Some(current) = entry.record.stages.last_mut() {
                current.attempts += 1;
            }
            entry.touch();
        }
    }

    /// Record `error` and move the job to `failed`.
    pub fn fail(&self, job_id: &JobId, error: &StageError) -> Result<JobProgress, TransitionError> {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(job_id) {
            entry.record.progress.last_error = Some(ErrorSummary::from(error));
        }
        inner.apply_transition(job_id, Stage::Failed)
    }

    /// Cancel a queued job.
    pub fn abort(&self, job_id: &JobId) -> Result<JobProgress, IngestError> {
        let mut inner = self.lock();
        let stage = inner
            .jobs
            .get(job_id)
            .map(|entry| entry.record.progress.stage)
            .ok_or_else(|| IngestError::UnknownJob(job_id.clone()))?;
        inner
            .apply_transition(job_id, Stage::Aborted)
            .map_err(|_| IngestError::NotAbortable {
                job_id: job_id.clone(),
                stage,
            })
    }

    /// Attach the content hash and decoding kind found during normalization.
    pub fn set_document_info(&self, job_id: &JobId, content_hash: String, kind: DocumentKind) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(job_id) {
            entry.record.document.content_hash = Some(content_hash);
            entry.record.document.kind = Some(kind);
        }
    }

    /// Update chunk and vector totals.
    pub fn set_totals(&self, job_id: &JobId, chunks_total: Option<usize>, vectors_total: Option<usize>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.jobs.get_mut(job_id) {
            if let Some(chunks) = chunks_total {
                entry.record.progress.chunks_total = chunks;
            }
            if let Some(vectors) = vectors_total {
                entry.record.progress.vectors_total = vectors;
            }
            entry.touch();
        }
    }

    /// Whether a newer job has replaced this one.
    pub fn is_superseded(&self, job_id: &JobId) -> bool {
        self.lock()
            .jobs
            .get(job_id)
            .is_some_and(|entry| entry.superseded)
    }

    /// Current progress snapshot.
    pub fn progress(&self, job_id: &JobId) -> Option<JobProgress> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|entry| entry.record.progress.clone())
    }

    /// Full job record.
    pub fn record(&self, job_id: &JobId) -> Option<JobRecord> {
        self.lock().jobs.get(job_id).map(|entry| entry.record.clone())
    }

    /// Receiver notified whenever the job publishes a transition.
    pub fn subscribe(&self, job_id: &JobId) -> Option<watch::Receiver<usize>> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|entry| entry.version.subscribe())
    }

    /// Published events from position `cursor` on, and whether the job is terminal.
    pub fn events_since(&self, job_id: &JobId, cursor: usize) -> Option<(Vec<JobProgress>, bool)> {
        self.lock().jobs.get(job_id).map(|entry| {
            let events = entry.history.get(cursor..).unwrap_or_default().to_vec();
            (events, entry.record.progress.stage.is_terminal())
        })
    }

    /// Resolve once the job reaches a terminal stage or is unknown.
    pub async fn wait_terminal(&self, job_id: &JobId) {
        let Some(mut changes) = self.subscribe(job_id) else {
            return;
        };
        loop {
            let done = self
                .progress(job_id)
                .is_none_or(|progress| progress.stage.is_terminal());
            if done || changes.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ErrorKind, IngestRequest};

    fn document(key: &str) -> Document {
        IngestRequest {
            tenant_id: "acme".into(),
            source_id: "upload".into(),
            bucket: "raw".into(),
            key: key.into(),
            overwrite: false,
            tags: Vec::new(),
        }
        .into_document()
        .expect("document")
    }

    fn created(admission: Admission) -> (JobId, Option<JobId>, Option<JobId>) {
        match admission {
            Admission::Created {
                job_id,
                wait_for,
                aborted,
            } => (job_id, wait_for, aborted),
            Admission::Coalesced(job_id) => panic!("unexpected coalesce into {job_id}"),
        }
    }

    #[test]
    fn concurrent_submissions_coalesce_until_terminal() {
        let registry = JobRegistry::new();
        let (first, _, _) = created(registry.admit(document("docs/a"), false));
        assert_eq!(
            registry.admit(document("docs/a"), false),
            Admission::Coalesced(first.clone())
        );

        registry.transition(&first, Stage::Normalizing).expect("normalizing");
        registry
            .fail(&first, &StageError::fatal(ErrorKind::Missing, "gone"))
            .expect("failed");
        let (second, _, _) = created(registry.admit(document("docs/a"), false));
        assert_ne!(first, second);
    }

    #[test]
    fn overwrite_aborts_queued_and_supersedes_running_jobs() {
        let registry = JobRegistry::new();
        let (queued, _, _) = created(registry.admit(document("docs/a"), false));
        let (replacement, wait_for, aborted) = created(registry.admit(document("docs/a"), true));
        assert_eq!(aborted, Some(queued.clone()));
        assert_eq!(wait_for, None);
        assert_eq!(registry.progress(&queued).map(|p| p.stage), Some(Stage::Aborted));

        registry
            .transition(&replacement, Stage::Normalizing)
            .expect("normalizing");
        let (waiting, wait_for, aborted) = created(registry.admit(document("docs/a"), true));
        assert_eq!(wait_for, Some(replacement.clone()));
        assert_eq!(aborted, None);
        assert!(registry.is_superseded(&replacement));

        let (_, wait_for, aborted) = created(registry.admit(document("docs/a"), true));
        assert_eq!(aborted, Some(waiting));
        assert_eq!(wait_for, Some(replacement));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let registry = JobRegistry::new();
        let (job, _, _) = created(registry.admit(document("docs/a"), false));
        assert!(matches!(
            registry.transition(&job, Stage::Embedding),
            Err(TransitionError::Illegal { .. })
        ));
        registry.transition(&job, Stage::Normalizing).expect("normalizing");
        assert_eq!(
            registry.abort(&job),
            Err(IngestError::NotAbortable {
                job_id: job.clone(),
                stage: Stage::Normalizing
            })
        );
        assert_eq!(
            registry.abort(&JobId::from("nope")),
            Err(IngestError::UnknownJob(JobId::from("nope")))
        );
    }

    #[test]
    fn failures_increment_attempts_and_history_records_transitions() {
        let registry = JobRegistry::new();
        let (job, _, _) = created(registry.admit(document("docs/a"), false));
        registry.transition(&job, Stage::Normalizing).expect("normalizing");
        let error = StageError::transient(ErrorKind::Timeout, "slow");
        registry.record_failure(&job, &error);
        registry.record_failure(&job, &error);

        let progress = registry.progress(&job).expect("progress");
        assert_eq!(progress.attempts, 2);
        assert_eq!(progress.last_error.map(|e| e.kind), Some(ErrorKind::Timeout));

        registry.transition(&job, Stage::Chunking).expect("chunking");
        let record = registry.record(&job).expect("record");
        assert_eq!(record.stages[1].attempts, 2);
        assert!(record.stages[1].exited_at.is_some());
        assert_eq!(record.progress.attempts, 0);

        let (events, terminal) = registry.events_since(&job, 0).expect("events");
        let stages: Vec<_> = events.iter().map(|event| event.stage).collect();
        assert_eq!(stages, vec![Stage::Queued, Stage::Normalizing, Stage::Chunking]);
        assert!(!terminal);
        assert_eq!(registry.events_since(&job, 2).expect("events").0.len(), 1);
        assert!(registry.events_since(&job, 9).expect("events").0.is_empty());
    }

    #[tokio::test]
    async fn wait_terminal_resolves_after_abort() {
        let registry = std::sync::Arc::new(JobRegistry::new());
        let (job, _, _) = created(registry.admit(document("docs/a"), false));

        let waiter = {
            let registry = registry.clone();
            let job = job.clone();
            tokio::spawn(async move { registry.wait_terminal(&job).await })
        };
        tokio::task::yield_now().await;
        registry.abort(&job).expect("abort");
        waiter.await.expect("waiter");
    }

    #[tokio::test]
    async fn oldest_finished_jobs_are_evicted_past_the_retention_cap() {
        let registry = JobRegistry::with_retention(2);
        let (running, _, _) = created(registry.admit(document("docs/running"), false));
        registry.transition(&running, Stage::Normalizing).expect("normalizing");

        let finished: Vec<JobId> = ["docs/a", "docs/b", "docs/c"]
            .into_iter()
            .map(|key| {
                let (job, _, _) = created(registry.admit(document(key), false));
                registry.abort(&job).expect("abort");
                job
            })
            .collect();
        assert!(registry.progress(&finished[0]).is_none());
        assert!(registry.events_since(&finished[0], 0).is_none());
        assert!(registry.progress(&finished[1]).is_some());
        assert!(registry.progress(&finished[2]).is_some());
        assert_eq!(
            registry.progress(&running).map(|p| p.stage),
            Some(Stage::Normalizing),
            "unfinished jobs are never evicted"
        );

        let (replacement, wait_for, _) = created(registry.admit(document("docs/running"), true));
        assert_eq!(wait_for, Some(running.clone()));
        registry
            .fail(&running, &StageError::fatal(ErrorKind::Superseded, "replaced"))
            .expect("failed");
        for key in ["docs/d", "docs/e"] {
            let (job, _, _) = created(registry.admit(document(key), false));
            registry.abort(&job).expect("abort");
        }
        assert!(registry.progress(&running).is_none());
        registry.wait_terminal(&running).await;

        assert_eq!(
            registry.admit(document("docs/running"), false),
            Admission::Coalesced(replacement.clone())
        );
        assert_eq!(registry.progress(&replacement).map(|p| p.stage), Some(Stage::Queued));
    }
}
