//! Narrex: resumable narrative extraction over long-form text
//!
//! Runs a small task graph per document (preprocessing, then character,
//! plot and satisfaction analyses in parallel, then a merge) and drives it
//! across thousands of files with a checkpoint ledger that makes runs
//! resumable and idempotent.
//!
//! # Core Concepts
//!
//! - **ExtractionGraph**: fan-out/join over one document; task failures degrade the result
//! - **AdmissionGate**: process-wide bound on concurrent collaborator calls
//! - **BatchRunner**: bounded worker pool with commit-before-release checkpointing
//! - **CheckpointStore**: per-input Done/Failed/Pending ledger plus extracted rows
//!
//! # Example
//!
//! ```
//! use narrex::{AdmissionGate, ExtractionGraph, MockClient};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let gate = AdmissionGate::new(Arc::new(MockClient::available()), 6);
//! let document = ExtractionGraph::new(gate).run("第一章 山雨欲来").await.unwrap();
//! assert!(document.errors.is_empty());
//! # });
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod extract;
pub mod image;
pub mod inference;

pub use batch::{
    enumerate_inputs, BatchError, BatchInput, BatchRunner, BatchStats, CancellationToken,
    ExtractionJob, FailedPolicy, ImageJob,
};
pub use checkpoint::{
    CheckpointEntry, CheckpointError, CheckpointStatus, CheckpointStore, OpenCheckpointStore,
    SqliteCheckpointStore,
};
pub use config::{Config, ConfigError};
pub use extract::{
    ErrorKind, ExtractionGraph, GraphError, MergedDocument, ResultEnvelope, SharedStateRecord,
    TaskNode,
};
pub use image::{CharacterPrompt, ImageBackend, ImageError, MockImageBackend};
pub use inference::{AdmissionGate, InferenceClient, InferenceError, MockClient, TaskKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
