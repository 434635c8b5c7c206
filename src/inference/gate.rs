//! Process-wide admission control for inference calls
//!
//! Every collaborator invocation in the process goes through one gate, so
//! the file-level and fan-out bounds cannot multiply past the collaborator's
//! safe concurrent-request ceiling.

use super::{InferenceClient, InferenceError, InferenceReply, InvokeOptions, TaskKind};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Semaphore + deadline wrapper shared by every graph and batch in the process.
#[derive(Clone)]
pub struct AdmissionGate {
    inner: Arc<dyn InferenceClient>,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl AdmissionGate {
    /// Wrap `inner`, allowing at most `limit` invocations in flight.
    ///
    /// A limit of zero is raised to one.
    pub fn new(inner: Arc<dyn InferenceClient>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Maximum concurrent invocations admitted.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits not currently held.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Check if the wrapped collaborator is reachable (not gated).
    pub async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    /// Invoke the collaborator once admitted.
    ///
    /// The deadline in `options` starts after admission, so queueing behind
    /// other documents never counts against a task.
    pub async fn invoke(
        &self,
        kind: TaskKind,
        text: &str,
        options: &InvokeOptions,
    ) -> Result<InferenceReply, InferenceError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| InferenceError::Unavailable(format!("admission gate closed: {}", e)))?;
        debug!(task = %kind, in_use = self.limit - self.permits.available_permits(), "admitted");

        match tokio::time::timeout(options.timeout, self.inner.invoke(kind, text, options)).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout(options.timeout)),
        }
    }
}
