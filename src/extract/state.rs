//! Per-document state threaded through the extraction graph

use crate::inference::{InferenceError, TaskKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the graph itself (not by its tasks).
///
/// Task failures never surface here; they are captured in envelopes and the
/// error log. These variants indicate a scheduling contract violation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("{task} started before {requires} completed")]
    MissingInput { task: TaskKind, requires: TaskKind },

    #[error("{0} result already recorded")]
    SlotAlreadyWritten(TaskKind),

    #[error("merge attempted before all analyses completed")]
    MergeBeforeJoin,
}

/// Classification used for error records and batch statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CollaboratorTimeout,
    CollaboratorRefusal,
    CollaboratorUnavailable,
    MissingInput,
    CheckpointWrite,
    /// Writing a document's own output (image files, row encoding) failed.
    OutputWrite,
    InputRead,
    AllAnalysesFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CollaboratorTimeout => "collaborator_timeout",
            ErrorKind::CollaboratorRefusal => "collaborator_refusal",
            ErrorKind::CollaboratorUnavailable => "collaborator_unavailable",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::CheckpointWrite => "checkpoint_write",
            ErrorKind::OutputWrite => "output_write",
            ErrorKind::InputRead => "input_read",
            ErrorKind::AllAnalysesFailed => "all_analyses_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&InferenceError> for ErrorKind {
    fn from(err: &InferenceError) -> Self {
        match err {
            InferenceError::Timeout(_) => ErrorKind::CollaboratorTimeout,
            InferenceError::Refusal(_) => ErrorKind::CollaboratorRefusal,
            InferenceError::Unavailable(_) => ErrorKind::CollaboratorUnavailable,
        }
    }
}

/// One entry in a document's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub task: TaskKind,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(task: TaskKind, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            task,
            kind,
            message: message.into(),
        }
    }

    pub fn from_inference(task: TaskKind, err: &InferenceError) -> Self {
        Self::new(task, ErrorKind::from(err), err.to_string())
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.task, self.kind, self.message)
    }
}

/// Uniform result of one task.
///
/// Exactly one of `payload` / `error` is present, matching `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub task_name: String,
}

impl ResultEnvelope {
    pub fn succeeded(task: TaskKind, payload: serde_json::Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            task_name: task.as_str().to_string(),
        }
    }

    pub fn failed(task: TaskKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            task_name: task.as_str().to_string(),
        }
    }
}

/// Monotonic per-task completion flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionFlags {
    preprocess: bool,
    character: bool,
    plot: bool,
    satisfaction: bool,
}

impl CompletionFlags {
    pub fn is_set(&self, kind: TaskKind) -> bool {
        match kind {
            TaskKind::Preprocess => self.preprocess,
            TaskKind::Character => self.character,
            TaskKind::Plot => self.plot,
            TaskKind::Satisfaction => self.satisfaction,
        }
    }

    /// Set a flag. Flags are never cleared.
    fn set(&mut self, kind: TaskKind) {
        match kind {
            TaskKind::Preprocess => self.preprocess = true,
            TaskKind::Character => self.character = true,
            TaskKind::Plot => self.plot = true,
            TaskKind::Satisfaction => self.satisfaction = true,
        }
    }

    /// Join condition: every analysis flag is set.
    pub fn analyses_complete(&self) -> bool {
        TaskKind::ANALYSES.iter().all(|k| self.is_set(*k))
    }
}

/// What a finished task hands back to the scheduler.
#[derive(Debug, Clone)]
pub struct Completion {
    pub kind: TaskKind,
    pub envelope: ResultEnvelope,
    /// Cleaned text; set only by preprocessing (collaborator or fallback).
    pub cleaned_text: Option<String>,
    pub error: Option<ErrorRecord>,
}

impl Completion {
    /// Completion for an analysis task that ended without reporting (aborted or panicked).
    pub fn aborted(kind: TaskKind) -> Self {
        let message = "task ended without reporting a result";
        Self {
            kind,
            envelope: ResultEnvelope::failed(kind, message),
            cleaned_text: None,
            error: Some(ErrorRecord::new(
                kind,
                ErrorKind::CollaboratorUnavailable,
                message,
            )),
        }
    }
}

/// The mutable record owned by one in-flight graph execution.
#[derive(Debug, Clone)]
pub struct SharedStateRecord {
    raw_text: Arc<str>,
    preprocessed_text: Option<Arc<str>>,
    character: Option<ResultEnvelope>,
    plot: Option<ResultEnvelope>,
    satisfaction: Option<ResultEnvelope>,
    flags: CompletionFlags,
    completed_tasks: Vec<TaskKind>,
    errors: Vec<ErrorRecord>,
}

impl SharedStateRecord {
    pub fn new(raw_text: impl Into<Arc<str>>) -> Self {
        Self {
            raw_text: raw_text.into(),
            preprocessed_text: None,
            character: None,
            plot: None,
            satisfaction: None,
            flags: CompletionFlags::default(),
            completed_tasks: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// Cleaned text; empty until preprocessing completes.
    pub fn preprocessed_text(&self) -> &str {
        self.preprocessed_text.as_deref().unwrap_or("")
    }

    pub fn flags(&self) -> CompletionFlags {
        self.flags
    }

    pub fn analyses_complete(&self) -> bool {
        self.flags.analyses_complete()
    }

    pub fn analysis(&self, kind: TaskKind) -> Option<&ResultEnvelope> {
        match kind {
            TaskKind::Preprocess => None,
            TaskKind::Character => self.character.as_ref(),
            TaskKind::Plot => self.plot.as_ref(),
            TaskKind::Satisfaction => self.satisfaction.as_ref(),
        }
    }

    /// Tasks in completion order.
    pub fn completed_tasks(&self) -> &[TaskKind] {
        &self.completed_tasks
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// The input a task reads, enforcing upstream ordering.
    pub fn input_for(&self, kind: TaskKind) -> Result<Arc<str>, GraphError> {
        match kind {
            TaskKind::Preprocess => Ok(self.raw_text.clone()),
            analysis => match (&self.preprocessed_text, self.flags.preprocess) {
                (Some(text), true) => Ok(text.clone()),
                _ => Err(GraphError::MissingInput {
                    task: analysis,
                    requires: TaskKind::Preprocess,
                }),
            },
        }
    }

    /// Write a task's output into its slot, set its flag and append to the logs.
    pub fn apply(&mut self, completion: Completion) -> Result<(), GraphError> {
        let kind = completion.kind;
        if self.flags.is_set(kind) {
            return Err(GraphError::SlotAlreadyWritten(kind));
        }

        match kind {
            TaskKind::Preprocess => {
                let text = completion.cleaned_text.unwrap_or_default();
                self.preprocessed_text = Some(Arc::from(text));
            }
            TaskKind::Character => self.character = Some(completion.envelope),
            TaskKind::Plot => self.plot = Some(completion.envelope),
            TaskKind::Satisfaction => self.satisfaction = Some(completion.envelope),
        }

        self.flags.set(kind);
        self.completed_tasks.push(kind);
        if let Some(error) = completion.error {
            self.errors.push(error);
        }
        Ok(())
    }
}
