//! Per-document extraction
//!
//! A fixed task graph: preprocessing, then character, plot and satisfaction
//! analyses concurrently, then a single merge once all three have reported.
//! Task failures degrade the merged document instead of aborting it.

mod graph;
mod merge;
mod node;
mod state;

pub use graph::{ExtractionGraph, GraphEvent, GraphPhase, GraphRun};
pub use merge::MergedDocument;
pub use node::{extract_json, normalize_text, StateField, TaskNode};
pub use state::{
    Completion, CompletionFlags, ErrorKind, ErrorRecord, GraphError, ResultEnvelope,
    SharedStateRecord,
};
