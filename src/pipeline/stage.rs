//! Job lifecycle as an explicit state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an ingestion job in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Admitted, waiting for a worker slot.
    Queued,
    /// Fetching and decoding the raw document.
    Normalizing,
    /// Splitting normalized text into chunks.
    Chunking,
    /// Converting chunks into vectors.
    Embedding,
    /// Writing vectors to the vector store.
    Indexing,
    /// Every stage succeeded.
    Completed,
    /// A stage failed permanently or exhausted its retries.
    Failed,
    /// Cancelled before it started.
    Aborted,
}

/// Every permitted `(from, to)` move.
const TRANSITIONS: &[(Stage, Stage)] = &[
    (Stage::Queued, Stage::Normalizing),
    (Stage::Normalizing, Stage::Chunking),
    (Stage::Chunking, Stage::Embedding),
    (Stage::Embedding, Stage::Indexing),
    (Stage::Indexing, Stage::Completed),
    (Stage::Queued, Stage::Failed),
    (Stage::Normalizing, Stage::Failed),
    (Stage::Chunking, Stage::Failed),
    (Stage::Embedding, Stage::Failed),
    (Stage::Indexing, Stage::Failed),
    (Stage::Queued, Stage::Aborted),
];

impl Stage {
    /// Stages in forward order.
    pub const FORWARD: [Stage; 6] = [
        Stage::Queued,
        Stage::Normalizing,
        Stage::Chunking,
        Stage::Embedding,
        Stage::Indexing,
        Stage::Completed,
    ];

    /// Wire name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Normalizing => "normalizing",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Indexing => "indexing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// The forward successor, if any.
    pub fn next(self) -> Option<Stage> {
        TRANSITIONS
            .iter()
            .find(|(from, to)| *from == self && !matches!(to, Stage::Failed | Stage::Aborted))
            .map(|(_, to)| *to)
    }

    /// Whether the table permits moving from `self` to `to`.
    pub fn can_transition(self, to: Stage) -> bool {
        TRANSITIONS.contains(&(self, to))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
