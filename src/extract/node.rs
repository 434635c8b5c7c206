//! Task nodes: one collaborator call each, with a uniform result

use super::state::{Completion, ErrorRecord, GraphError, ResultEnvelope, SharedStateRecord};
use crate::inference::{AdmissionGate, InferenceError, InvokeOptions, TaskKind};
use std::sync::Arc;
use tracing::{debug, warn};

/// A field of [`SharedStateRecord`] a node reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateField {
    RawText,
    PreprocessedText,
    AnalysisResult(TaskKind),
}

/// A unit of work bound to one task kind.
///
/// Nodes never raise past their boundary: collaborator failures come back as
/// a failed envelope plus an error record. Only a scheduling violation
/// (reading input whose producer has not completed) is an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskNode {
    kind: TaskKind,
}

impl TaskNode {
    pub fn new(kind: TaskKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn reads(&self) -> &'static [StateField] {
        match self.kind {
            TaskKind::Preprocess => &[StateField::RawText],
            _ => &[StateField::PreprocessedText],
        }
    }

    pub fn writes(&self) -> StateField {
        match self.kind {
            TaskKind::Preprocess => StateField::PreprocessedText,
            analysis => StateField::AnalysisResult(analysis),
        }
    }

    /// Read this node's input, failing if its upstream producer has not completed.
    pub fn input(&self, state: &SharedStateRecord) -> Result<Arc<str>, GraphError> {
        state.input_for(self.kind)
    }

    /// Invoke the collaborator on `input` and package the outcome.
    pub async fn execute(
        &self,
        input: Arc<str>,
        gate: &AdmissionGate,
        options: &InvokeOptions,
    ) -> Completion {
        let result = gate.invoke(self.kind, &input, options).await;
        match self.kind {
            TaskKind::Preprocess => preprocess_completion(&input, result),
            kind => analysis_completion(kind, result),
        }
    }

    /// Read input, execute and write back in one step.
    pub async fn run(
        &self,
        state: &mut SharedStateRecord,
        gate: &AdmissionGate,
        options: &InvokeOptions,
    ) -> Result<ResultEnvelope, GraphError> {
        let input = self.input(state)?;
        let completion = self.execute(input, gate, options).await;
        let envelope = completion.envelope.clone();
        state.apply(completion)?;
        Ok(envelope)
    }
}

fn preprocess_completion(
    raw: &str,
    result: Result<crate::inference::InferenceReply, InferenceError>,
) -> Completion {
    let kind = TaskKind::Preprocess;
    match result {
        Ok(reply) if !reply.text.trim().is_empty() => {
            let cleaned = reply.text.trim().to_string();
            debug!(chars = cleaned.chars().count(), "preprocessing complete");
            Completion {
                kind,
                envelope: ResultEnvelope::succeeded(
                    kind,
                    serde_json::json!({ "cleaned_length": cleaned.chars().count() }),
                ),
                cleaned_text: Some(cleaned),
                error: None,
            }
        }
        other => {
            let err = match other {
                Err(e) => e,
                Ok(_) => InferenceError::Refusal("empty response".to_string()),
            };
            warn!(error = %err, "preprocessing failed, using local normalisation");
            let cleaned = normalize_text(raw);
            let record = ErrorRecord::from_inference(kind, &err);
            Completion {
                kind,
                envelope: ResultEnvelope::failed(kind, err.to_string()),
                cleaned_text: Some(cleaned),
                error: Some(record),
            }
        }
    }
}

fn analysis_completion(
    kind: TaskKind,
    result: Result<crate::inference::InferenceReply, InferenceError>,
) -> Completion {
    match result {
        Ok(reply) => {
            let payload =
                extract_json(&reply.text).unwrap_or(serde_json::Value::String(reply.text));
            Completion {
                kind,
                envelope: ResultEnvelope::succeeded(kind, payload),
                cleaned_text: None,
                error: None,
            }
        }
        Err(err) => {
            warn!(task = %kind, error = %err, "analysis failed");
            Completion {
                kind,
                envelope: ResultEnvelope::failed(kind, err.to_string()),
                cleaned_text: None,
                error: Some(ErrorRecord::from_inference(kind, &err)),
            }
        }
    }
}

/// Local cleanup used when the collaborator cannot preprocess.
///
/// Drops control characters, folds every whitespace run into a single
/// space, and trims both ends.
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.chars() {
        if ch.is_whitespace() {
            pending_space = true;
        } else if ch.is_control() {
            continue;
        } else {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        }
    }
    out
}

/// Pull a JSON object or array out of free-form collaborator output.
///
/// Tries the whole text, then a fenced code block, then the outermost
/// brace or bracket span.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    fn structured(candidate: &str) -> Option<serde_json::Value> {
        serde_json::from_str::<serde_json::Value>(candidate.trim())
            .ok()
            .filter(|v| v.is_object() || v.is_array())
    }

    let trimmed = text.trim();
    if let Some(v) = structured(trimmed) {
        return Some(v);
    }

    let fenced = trimmed
        .find("```json")
        .map(|start| &trimmed[start + 7..])
        .or_else(|| trimmed.find("```").map(|start| &trimmed[start + 3..]))
        .and_then(|after| after.find("```").map(|end| &after[..end]));
    if let Some(v) = fenced.and_then(structured) {
        return Some(v);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Some(v) = structured(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}
