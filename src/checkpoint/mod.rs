//! Checkpoint ledger
//!
//! Records per-input processing status so batch runs can resume after a
//! crash or stop and re-runs skip finished work. `SqliteCheckpointStore` is
//! the persistent implementation.

mod sqlite;
mod traits;

pub use sqlite::SqliteCheckpointStore;
pub use traits::{
    CheckpointCounts, CheckpointEntry, CheckpointError, CheckpointResult, CheckpointStatus,
    CheckpointStore, OpenCheckpointStore,
};
