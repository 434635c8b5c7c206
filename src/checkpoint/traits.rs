//! Checkpoint ledger trait and record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Unknown status '{0}'")]
    UnknownStatus(String),

    #[error("Ledger lock poisoned")]
    LockPoisoned,

    #[error("Entry '{0}' is already done")]
    AlreadyDone(String),
}

/// Result type for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Processing status of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Done,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Done => "done",
            CheckpointStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CheckpointStatus::Pending),
            "done" => Ok(CheckpointStatus::Done),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(CheckpointError::UnknownStatus(other.to_string())),
        }
    }
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: String,
    pub status: CheckpointStatus,
    /// Failure reason; set only for `Failed`.
    pub reason: Option<String>,
    /// Number of times this input has been scheduled.
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    /// Extracted row; set only for `Done`.
    pub row: Option<serde_json::Value>,
}

/// Aggregate counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointCounts {
    pub done: usize,
    pub failed: usize,
    pub pending: usize,
}

impl CheckpointCounts {
    pub fn total(&self) -> usize {
        self.done + self.failed + self.pending
    }
}

/// Persisted progress ledger shared by every batch worker.
///
/// Implementations serialize all mutations: each transition is one atomic
/// write, and `mark_done` persists the status and the extracted row together.
pub trait CheckpointStore: Send + Sync {
    /// True if `id` is recorded as done.
    fn is_done(&self, id: &str) -> CheckpointResult<bool>;

    /// Status of `id` without loading its row.
    fn status(&self, id: &str) -> CheckpointResult<Option<CheckpointStatus>>;

    /// Look up a single entry.
    fn entry(&self, id: &str) -> CheckpointResult<Option<CheckpointEntry>>;

    /// Record that `id` has been scheduled.
    ///
    /// Creates a pending entry, or moves a failed one back to pending and
    /// bumps its attempt counter. Fails with `AlreadyDone` for done entries.
    fn mark_pending(&self, id: &str) -> CheckpointResult<CheckpointEntry>;

    /// Record success and the extracted row in one transaction.
    fn mark_done(&self, id: &str, row: &serde_json::Value) -> CheckpointResult<()>;

    /// Record failure with a human-readable reason.
    fn mark_failed(&self, id: &str, reason: &str) -> CheckpointResult<()>;

    /// Every entry, ordered by id.
    fn all_entries(&self) -> CheckpointResult<Vec<CheckpointEntry>>;

    /// Extracted rows in completion order.
    fn rows(&self) -> CheckpointResult<Vec<(String, serde_json::Value)>>;

    fn counts(&self) -> CheckpointResult<CheckpointCounts>;

    /// Wipe the ledger and its rows atomically.
    fn reset(&self) -> CheckpointResult<()>;
}

/// Trait for stores that can be opened from a path
pub trait OpenCheckpointStore: CheckpointStore + Sized {
    /// Open or create a ledger at the given path
    fn open(path: impl AsRef<Path>) -> CheckpointResult<Self>;

    /// Create an in-memory ledger (useful for testing)
    fn open_in_memory() -> CheckpointResult<Self>;
}
