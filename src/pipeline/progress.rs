//! Progress stream: replays a job's transitions and emits heartbeats while idle.
//!
//! The stream ends after the terminal event. Dropping it (the client went away) is the only
//! cancellation signal; nothing else needs to be told.

use super::job::timestamp_now;
use super::{JobId, JobProgress, JobRegistry};
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Item emitted on a progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A stage transition.
    Progress(JobProgress),
    /// Nothing changed for one heartbeat interval.
    Heartbeat {
        /// RFC3339 emission time.
        at: String,
    },
}

impl ProgressEvent {
    /// Event name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Stream every transition of `job_id` from the beginning, or `None` for an unknown job.
pub fn progress_stream(
    registry: Arc<JobRegistry>,
    job_id: JobId,
    heartbeat: Duration,
) -> Option<BoxStream<'static, ProgressEvent>> {
    let mut changes = registry.subscribe(&job_id)?;
    let heartbeat = heartbeat.max(Duration::from_millis(1));

    let stream = async_stream::stream! {
        let mut cursor = 0;
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let Some((events, terminal)) = registry.events_since(&job_id, cursor) else {
                break;
            };
            cursor += events.len();
            for event in events {
                yield ProgressEvent::Progress(event);
            }
            if terminal {
                break;
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    yield ProgressEvent::Heartbeat { at: timestamp_now() };
                }
            }
        }
        tracing::debug!(job_id = %job_id, "Progress stream finished");
    };
    Some(Box::pin(stream))
}
