//! Merged per-document output

use super::state::{ErrorRecord, GraphError, ResultEnvelope, SharedStateRecord};
use crate::inference::TaskKind;
use serde::{Deserialize, Serialize};

/// The merged record persisted for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedDocument {
    pub characters: ResultEnvelope,
    pub plot: ResultEnvelope,
    pub satisfaction_points: ResultEnvelope,
    /// Character count of the raw text.
    pub original_text_length: usize,
    /// Character count of the preprocessed text.
    pub cleaned_text_length: usize,
    pub errors: Vec<String>,
    pub completed_tasks: Vec<TaskKind>,
    pub parallel_execution: bool,
}

impl MergedDocument {
    /// Assemble the output record. Only valid once the join condition holds.
    pub fn from_state(state: &SharedStateRecord) -> Result<Self, GraphError> {
        let slot = |kind: TaskKind| {
            state
                .analysis(kind)
                .cloned()
                .ok_or(GraphError::MergeBeforeJoin)
        };
        if !state.analyses_complete() {
            return Err(GraphError::MergeBeforeJoin);
        }

        Ok(Self {
            characters: slot(TaskKind::Character)?,
            plot: slot(TaskKind::Plot)?,
            satisfaction_points: slot(TaskKind::Satisfaction)?,
            original_text_length: state.raw_text().chars().count(),
            cleaned_text_length: state.preprocessed_text().chars().count(),
            errors: state.errors().iter().map(ErrorRecord::to_string).collect(),
            completed_tasks: state.completed_tasks().to_vec(),
            parallel_execution: true,
        })
    }

    pub fn analyses(&self) -> [&ResultEnvelope; 3] {
        [&self.characters, &self.plot, &self.satisfaction_points]
    }

    pub fn all_analyses_failed(&self) -> bool {
        self.analyses().iter().all(|e| !e.success)
    }

    pub fn failed_analyses(&self) -> usize {
        self.analyses().iter().filter(|e| !e.success).count()
    }
}
