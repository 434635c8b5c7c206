//! Extraction graph: preprocess, fan out three analyses, join, merge
//!
//! Analysis tasks run as independent tokio tasks and report on a completion
//! channel. The scheduler owns the state record, applies each completion as
//! it arrives and evaluates the join condition after every event, so the
//! merge runs exactly once regardless of completion order.

use super::merge::MergedDocument;
use super::node::TaskNode;
use super::state::{Completion, ErrorRecord, GraphError, SharedStateRecord};
use crate::inference::{AdmissionGate, InvokeOptions, TaskKind};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

/// Lifecycle phases of one graph execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphPhase {
    Start,
    Preprocessing,
    Analyzing,
    Merging,
    Done,
}

/// One entry in the execution trace.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    Entered(GraphPhase),
    TaskStarted(TaskKind),
    TaskCompleted { kind: TaskKind, success: bool },
    JoinEvaluated { ready: bool },
}

/// Result of one graph execution.
#[derive(Debug, Clone)]
pub struct GraphRun {
    pub document: MergedDocument,
    /// Structured error log, same order as `document.errors`.
    pub errors: Vec<ErrorRecord>,
    pub trace: Vec<GraphEvent>,
}

impl GraphRun {
    /// Number of times the merge step ran (always one for a finished run).
    pub fn merges(&self) -> usize {
        self.trace
            .iter()
            .filter(|e| **e == GraphEvent::Entered(GraphPhase::Merging))
            .count()
    }
}

/// Runs the fixed preprocess -> {character, plot, satisfaction} -> merge graph.
#[derive(Clone)]
pub struct ExtractionGraph {
    gate: AdmissionGate,
    options: InvokeOptions,
}

impl ExtractionGraph {
    pub fn new(gate: AdmissionGate) -> Self {
        Self {
            gate,
            options: InvokeOptions::default(),
        }
    }

    /// Per-task collaborator deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options = InvokeOptions::with_timeout(timeout);
        self
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Run the graph and return only the merged document.
    pub async fn run(&self, raw_text: &str) -> Result<MergedDocument, GraphError> {
        Ok(self.execute(raw_text).await?.document)
    }

    /// Run the graph over one document.
    ///
    /// Dropping the returned future aborts any analysis still in flight.
    #[instrument(skip_all, fields(chars = raw_text.chars().count()))]
    pub async fn execute(&self, raw_text: &str) -> Result<GraphRun, GraphError> {
        let mut trace = vec![GraphEvent::Entered(GraphPhase::Start)];
        let mut state = SharedStateRecord::new(raw_text);

        trace.push(GraphEvent::Entered(GraphPhase::Preprocessing));
        let preprocess = TaskNode::new(TaskKind::Preprocess);
        let input = preprocess.input(&state)?;
        trace.push(GraphEvent::TaskStarted(TaskKind::Preprocess));
        let completion = preprocess.execute(input, &self.gate, &self.options).await;
        trace.push(GraphEvent::TaskCompleted {
            kind: TaskKind::Preprocess,
            success: completion.envelope.success,
        });
        state.apply(completion)?;

        trace.push(GraphEvent::Entered(GraphPhase::Analyzing));
        let (tx, mut rx) = mpsc::channel::<Completion>(TaskKind::ANALYSES.len());
        let mut tasks = JoinSet::new();
        for kind in TaskKind::ANALYSES {
            let node = TaskNode::new(kind);
            let input = node.input(&state)?;
            let gate = self.gate.clone();
            let options = self.options.clone();
            let tx = tx.clone();
            trace.push(GraphEvent::TaskStarted(kind));
            tasks.spawn(async move {
                let completion = node.execute(input, &gate, &options).await;
                // Receiver only disappears if the graph itself was dropped.
                let _ = tx.send(completion).await;
            });
        }
        drop(tx);

        loop {
            match rx.recv().await {
                Some(completion) => {
                    let kind = completion.kind;
                    trace.push(GraphEvent::TaskCompleted {
                        kind,
                        success: completion.envelope.success,
                    });
                    state.apply(completion)?;
                    let ready = state.analyses_complete();
                    debug!(task = %kind, ready, "join evaluated");
                    trace.push(GraphEvent::JoinEvaluated { ready });
                    if ready {
                        break;
                    }
                }
                None => {
                    // Every sender is gone but some analysis never reported.
                    for kind in TaskKind::ANALYSES {
                        if !state.flags().is_set(kind) {
                            trace.push(GraphEvent::TaskCompleted {
                                kind,
                                success: false,
                            });
                            state.apply(Completion::aborted(kind))?;
                        }
                    }
                    trace.push(GraphEvent::JoinEvaluated { ready: true });
                    break;
                }
            }
        }
        drop(tasks);

        trace.push(GraphEvent::Entered(GraphPhase::Merging));
        let document = MergedDocument::from_state(&state)?;
        trace.push(GraphEvent::Entered(GraphPhase::Done));

        Ok(GraphRun {
            document,
            errors: state.errors().to_vec(),
            trace,
        })
    }
}
