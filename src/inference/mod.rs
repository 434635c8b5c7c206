//! Inference collaborator boundary
//!
//! Defines the client trait the extraction graph calls for every task,
//! the closed set of task kinds, and the error taxonomy callers see.
//! Three pieces live here:
//! - `InferenceClient`: transport-agnostic trait (HTTP, mock)
//! - `AdmissionGate`: process-wide semaphore + deadline around every call
//! - `MockClient`: scripted responses, failures and delays (testing, dry runs)

mod gate;
pub mod http;

pub use gate::AdmissionGate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// The closed set of inference tasks a document goes through.
///
/// `Preprocess` runs first; the three analysis kinds fan out after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Preprocess,
    Character,
    Plot,
    Satisfaction,
}

impl TaskKind {
    /// The analysis kinds, in declaration order.
    pub const ANALYSES: [TaskKind; 3] = [TaskKind::Character, TaskKind::Plot, TaskKind::Satisfaction];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Preprocess => "preprocess",
            TaskKind::Character => "character",
            TaskKind::Plot => "plot",
            TaskKind::Satisfaction => "satisfaction",
        }
    }

    pub fn is_analysis(&self) -> bool {
        !matches!(self, TaskKind::Preprocess)
    }

    /// Built-in directive sent to the collaborator when no override is configured.
    pub fn default_directive(&self) -> &'static str {
        match self {
            TaskKind::Preprocess => {
                "Clean the following novel text. Remove markup, stray symbols and \
                 formatting noise, normalise whitespace, and return only the cleaned text."
            }
            TaskKind::Character => {
                "Identify the characters in the following novel text. Return a JSON object \
                 with a \"characters\" array; each entry has name, role, importance and \
                 relationships."
            }
            TaskKind::Plot => {
                "Analyse the plot of the following novel text. Return a JSON object with \
                 summary, main_events, conflicts and turning_points."
            }
            TaskKind::Satisfaction => {
                "Identify the reader-satisfaction beats in the following novel text. Return a \
                 JSON object with a \"points\" array; each entry has type, description and \
                 intensity."
            }
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preprocess" => Ok(TaskKind::Preprocess),
            "character" => Ok(TaskKind::Character),
            "plot" => Ok(TaskKind::Plot),
            "satisfaction" => Ok(TaskKind::Satisfaction),
            other => Err(format!("unknown task kind '{}'", other)),
        }
    }
}

/// Per-invocation options chosen by the caller.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Deadline for the collaborator call, measured from admission.
    pub timeout: Duration,
}

impl InvokeOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// What the collaborator produced for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceReply {
    /// Response text
    pub text: String,
    /// Transport metadata (model, usage), if any
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InferenceReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Errors surfaced by inference collaborators.
///
/// Transport failures and semantic refusals are distinct variants.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    #[error("collaborator timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("collaborator refused: {0}")]
    Refusal(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Client trait for the text-understanding collaborator.
///
/// Abstracts over transport so the graph does not depend on how the
/// collaborator is reached. Implementations must be cheap to share across
/// tasks; each invocation is independent.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Check if the collaborator is reachable.
    async fn is_available(&self) -> bool;

    /// Run one task over `text`.
    async fn invoke(
        &self,
        kind: TaskKind,
        text: &str,
        options: &InvokeOptions,
    ) -> Result<InferenceReply, InferenceError>;
}

/// One scripted behaviour for a task kind.
#[derive(Debug, Clone)]
struct Script {
    outcome: Option<Result<String, InferenceError>>,
    delay: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            outcome: None,
            delay: Duration::ZERO,
        }
    }
}

/// Mock client for testing; returns scripted responses.
///
/// Unscripted kinds answer with a default: preprocessing echoes the input,
/// analysis kinds return a small JSON object naming the task.
pub struct MockClient {
    available: bool,
    scripts: HashMap<TaskKind, Script>,
    /// Any invocation whose text contains one of these markers fails as unavailable.
    outage_markers: Vec<String>,
    calls: [AtomicUsize; 4],
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockClient {
    /// Create a mock client that reports as available.
    pub fn available() -> Self {
        Self {
            available: true,
            scripts: HashMap::new(),
            outage_markers: Vec::new(),
            calls: Default::default(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock client that reports as unavailable and fails every call.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::available()
        }
    }

    /// Register a response for a task kind.
    pub fn with_response(mut self, kind: TaskKind, text: impl Into<String>) -> Self {
        self.scripts.entry(kind).or_default().outcome = Some(Ok(text.into()));
        self
    }

    /// Register a failure for a task kind.
    pub fn with_failure(mut self, kind: TaskKind, error: InferenceError) -> Self {
        self.scripts.entry(kind).or_default().outcome = Some(Err(error));
        self
    }

    /// Delay every response for a task kind.
    pub fn with_delay(mut self, kind: TaskKind, delay: Duration) -> Self {
        self.scripts.entry(kind).or_default().delay = delay;
        self
    }

    /// Fail every invocation whose text contains `marker`.
    pub fn with_outage_for(mut self, marker: impl Into<String>) -> Self {
        self.outage_markers.push(marker.into());
        self
    }

    /// Number of invocations received for a task kind.
    pub fn calls(&self, kind: TaskKind) -> usize {
        self.calls[Self::slot(kind)].load(Ordering::SeqCst)
    }

    /// Total invocations across all task kinds.
    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    /// Highest number of invocations observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn slot(kind: TaskKind) -> usize {
        match kind {
            TaskKind::Preprocess => 0,
            TaskKind::Character => 1,
            TaskKind::Plot => 2,
            TaskKind::Satisfaction => 3,
        }
    }

    fn default_response(kind: TaskKind, text: &str) -> String {
        match kind {
            TaskKind::Preprocess => text.to_string(),
            other => serde_json::json!({ "task": other.as_str(), "chars": text.chars().count() })
                .to_string(),
        }
    }
}

/// Decrements the in-flight counter even when the call is abandoned mid-delay.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceClient for MockClient {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn invoke(
        &self,
        kind: TaskKind,
        text: &str,
        _options: &InvokeOptions,
    ) -> Result<InferenceReply, InferenceError> {
        self.calls[Self::slot(kind)].fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let script = self.scripts.get(&kind).cloned().unwrap_or_default();
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        if !self.available {
            return Err(InferenceError::Unavailable(
                "mock client configured as unavailable".to_string(),
            ));
        }
        if self.outage_markers.iter().any(|m| text.contains(m.as_str())) {
            return Err(InferenceError::Unavailable(format!(
                "mock outage for {} task",
                kind
            )));
        }

        match script.outcome {
            Some(Ok(response)) => Ok(InferenceReply::text(response)),
            Some(Err(e)) => Err(e),
            None => Ok(InferenceReply::text(Self::default_response(kind, text))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_available_client_returns_scripted_response() {
        let client = MockClient::available().with_response(TaskKind::Plot, "{\"summary\":\"x\"}");

        assert!(client.is_available().await);

        let reply = client
            .invoke(TaskKind::Plot, "input", &InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.text, "{\"summary\":\"x\"}");
        assert_eq!(client.calls(TaskKind::Plot), 1);
        assert_eq!(client.calls(TaskKind::Character), 0);
    }

    #[tokio::test]
    async fn mock_unavailable_client_returns_error() {
        let client = MockClient::unavailable();

        assert!(!client.is_available().await);

        let err = client
            .invoke(TaskKind::Preprocess, "input", &InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn mock_defaults_echo_preprocess_and_describe_analysis() {
        let client = MockClient::available();
        let options = InvokeOptions::default();

        let pre = client.invoke(TaskKind::Preprocess, "abc", &options).await.unwrap();
        assert_eq!(pre.text, "abc");

        let ch = client.invoke(TaskKind::Character, "abc", &options).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&ch.text).unwrap();
        assert_eq!(parsed["task"], "character");
    }

    #[tokio::test]
    async fn outage_marker_fails_only_matching_text() {
        let client = MockClient::available().with_outage_for("OUTAGE");
        let options = InvokeOptions::default();

        assert!(client.invoke(TaskKind::Plot, "fine", &options).await.is_ok());
        let err = client
            .invoke(TaskKind::Plot, "an OUTAGE here", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Unavailable(_)));
    }

    #[test]
    fn task_kind_round_trips_through_str() {
        for kind in [TaskKind::Preprocess, TaskKind::Character, TaskKind::Plot, TaskKind::Satisfaction] {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("summary".parse::<TaskKind>().is_err());
        assert!(!TaskKind::Preprocess.is_analysis());
        assert!(TaskKind::ANALYSES.iter().all(|k| k.is_analysis()));
    }
}
