//! Resumable bounded-concurrency batch runner
//!
//! Drives a [`BatchJob`] over many inputs. At most `file_concurrency`
//! documents are in flight; each worker commits its checkpoint transition
//! before its slot is released, so a crash never loses a finished document.

use super::cancel::CancellationToken;
use crate::checkpoint::{CheckpointError, CheckpointStatus, CheckpointStore};
use crate::extract::ErrorKind;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors that abort a whole batch run.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("cannot read input directory {}: {source}", .path.display())]
    InputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint ledger error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("checkpoint ledger unreliable after {consecutive} consecutive write failures: {last_error}")]
    LedgerUnreliable {
        consecutive: usize,
        last_error: String,
    },

    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),
}

/// Result type for batch operations
pub type BatchResult<T> = Result<T, BatchError>;

/// Whether inputs recorded as failed are scheduled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedPolicy {
    Retry,
    Skip,
}

impl FromStr for FailedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(FailedPolicy::Retry),
            "skip" => Ok(FailedPolicy::Skip),
            other => Err(format!("unknown failed policy '{}' (expected retry or skip)", other)),
        }
    }
}

/// Anything the runner can checkpoint.
pub trait BatchItem: Send + Sync + 'static {
    /// Stable identifier used as the ledger key.
    fn id(&self) -> &str;
}

/// A finished document: the row to persist and any task-level errors it carried.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub row: serde_json::Value,
    pub error_kinds: Vec<ErrorKind>,
}

/// A document that could not be completed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Per-document work driven by [`BatchRunner`].
#[async_trait]
pub trait BatchJob: Send + Sync + 'static {
    type Item: BatchItem;

    async fn process(&self, item: &Self::Item) -> Result<JobOutput, JobFailure>;
}

/// Aggregate statistics for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub run_id: String,
    /// Documents that reached a terminal state this run.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Inputs not scheduled (already done, or failed under `FailedPolicy::Skip`).
    pub skipped: usize,
    /// In-flight documents abandoned by cancellation; left pending.
    pub cancelled: usize,
    /// Eligible inputs never dispatched (limit or cancellation).
    pub not_dispatched: usize,
    pub error_kinds: BTreeMap<ErrorKind, usize>,
    pub elapsed_ms: u64,
}

impl BatchStats {
    fn count(&mut self, kind: ErrorKind) {
        *self.error_kinds.entry(kind).or_default() += 1;
    }
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "processed {} (succeeded {}, failed {}), skipped {}, cancelled {}, not dispatched {} in {:.1}s",
            self.processed,
            self.succeeded,
            self.failed,
            self.skipped,
            self.cancelled,
            self.not_dispatched,
            self.elapsed_ms as f64 / 1000.0
        )?;
        for (kind, n) in &self.error_kinds {
            writeln!(f, "  {:<26} {}", kind.as_str(), n)?;
        }
        Ok(())
    }
}

/// What a worker reports back when its slot frees.
enum WorkerReport {
    Finished {
        id: String,
        outcome: Result<JobOutput, JobFailure>,
        commit: Result<(), CheckpointError>,
        elapsed_ms: u64,
    },
    LedgerFailed {
        id: String,
        error: CheckpointError,
    },
    Cancelled {
        id: String,
    },
    /// Another run or copy already finished this id.
    AlreadyDone {
        id: String,
    },
}

/// Bounded worker pool over a shared checkpoint ledger.
pub struct BatchRunner {
    store: Arc<dyn CheckpointStore>,
    file_concurrency: usize,
    failed_policy: FailedPolicy,
    max_consecutive_checkpoint_failures: usize,
    limit: Option<usize>,
    cancel: CancellationToken,
}

impl BatchRunner {
    /// A runner over `store`. The failed-entry policy is always explicit.
    pub fn new(store: Arc<dyn CheckpointStore>, failed_policy: FailedPolicy) -> Self {
        Self {
            store,
            file_concurrency: 4,
            failed_policy,
            max_consecutive_checkpoint_failures: 3,
            limit: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Maximum documents in flight (zero is raised to one).
    pub fn with_file_concurrency(mut self, n: usize) -> Self {
        self.file_concurrency = n.max(1);
        self
    }

    pub fn with_max_consecutive_checkpoint_failures(mut self, n: usize) -> Self {
        self.max_consecutive_checkpoint_failures = n.max(1);
        self
    }

    /// Dispatch at most `n` eligible inputs.
    pub fn with_limit(mut self, n: Option<usize>) -> Self {
        self.limit = n;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Inputs that should be scheduled, plus the number skipped.
    ///
    /// Repeated ids are scheduled once; later copies count as skipped.
    pub fn select_pending<I: BatchItem>(&self, items: Vec<I>) -> BatchResult<(Vec<I>, usize)> {
        let mut eligible = Vec::with_capacity(items.len());
        let mut seen = HashSet::with_capacity(items.len());
        let mut skipped = 0;
        for item in items {
            if !seen.insert(item.id().to_string()) {
                debug!(document = %item.id(), "duplicate id skipped");
                skipped += 1;
                continue;
            }
            let status = self.store.status(item.id())?;
            match (status, self.failed_policy) {
                (Some(CheckpointStatus::Done), _) => skipped += 1,
                (Some(CheckpointStatus::Failed), FailedPolicy::Skip) => skipped += 1,
                _ => eligible.push(item),
            }
        }
        Ok((eligible, skipped))
    }

    /// Run `job` over every eligible item.
    ///
    /// One document's failure never stops the batch. The run aborts only
    /// when the ledger itself keeps failing to commit.
    #[instrument(skip_all, fields(items = items.len(), concurrency = self.file_concurrency))]
    pub async fn run<J: BatchJob>(&self, job: Arc<J>, items: Vec<J::Item>) -> BatchResult<BatchStats> {
        let started = Instant::now();
        let mut stats = BatchStats {
            run_id: Uuid::new_v4().to_string(),
            ..Default::default()
        };

        let (mut eligible, skipped) = self.select_pending(items)?;
        stats.skipped = skipped;
        if let Some(limit) = self.limit {
            if eligible.len() > limit {
                stats.not_dispatched = eligible.len() - limit;
                eligible.truncate(limit);
            }
        }
        info!(
            run_id = %stats.run_id,
            eligible = eligible.len(),
            skipped,
            policy = ?self.failed_policy,
            "batch starting"
        );

        let mut queue = eligible.into_iter();
        let mut workers: JoinSet<WorkerReport> = JoinSet::new();
        let mut consecutive_failures = 0usize;

        loop {
            while workers.len() < self.file_concurrency && !self.cancel.is_cancelled() {
                let Some(item) = queue.next() else { break };
                workers.spawn(Self::work(
                    job.clone(),
                    item,
                    self.store.clone(),
                    self.cancel.clone(),
                ));
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "worker panicked; its entry stays pending");
                    stats.failed += 1;
                    stats.processed += 1;
                    continue;
                }
            };

            if let Some(last_error) = self.record(report, &mut stats, &mut consecutive_failures) {
                if consecutive_failures >= self.max_consecutive_checkpoint_failures {
                    error!(consecutive = consecutive_failures, "checkpoint ledger unreliable, aborting batch");
                    workers.abort_all();
                    return Err(BatchError::LedgerUnreliable {
                        consecutive: consecutive_failures,
                        last_error,
                    });
                }
            }
        }

        stats.not_dispatched += queue.len();
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %stats.run_id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            cancelled = stats.cancelled,
            elapsed_ms = stats.elapsed_ms,
            "batch finished"
        );
        Ok(stats)
    }

    /// Fold one worker report into the stats.
    ///
    /// Returns the ledger error message when the report was a commit failure.
    fn record(
        &self,
        report: WorkerReport,
        stats: &mut BatchStats,
        consecutive_failures: &mut usize,
    ) -> Option<String> {
        match report {
            WorkerReport::Cancelled { id } => {
                info!(document = %id, "cancelled before merge; left pending");
                stats.cancelled += 1;
                None
            }
            WorkerReport::AlreadyDone { id } => {
                info!(document = %id, "already done; skipped");
                stats.skipped += 1;
                None
            }
            WorkerReport::LedgerFailed { id, error } => {
                warn!(document = %id, error = %error, "could not record document as scheduled");
                stats.processed += 1;
                stats.failed += 1;
                stats.count(ErrorKind::CheckpointWrite);
                *consecutive_failures += 1;
                Some(error.to_string())
            }
            WorkerReport::Finished {
                id,
                outcome,
                commit,
                elapsed_ms,
            } => {
                if let Err(CheckpointError::AlreadyDone(_)) = commit {
                    info!(document = %id, "finished elsewhere first; result discarded");
                    stats.skipped += 1;
                    return None;
                }
                stats.processed += 1;
                if let Err(error) = commit {
                    warn!(document = %id, error = %error, "checkpoint commit failed");
                    stats.failed += 1;
                    stats.count(ErrorKind::CheckpointWrite);
                    *consecutive_failures += 1;
                    return Some(error.to_string());
                }
                *consecutive_failures = 0;

                match outcome {
                    Ok(output) => {
                        info!(
                            document = %id,
                            task_errors = output.error_kinds.len(),
                            elapsed_ms,
                            "document done"
                        );
                        stats.succeeded += 1;
                        for kind in output.error_kinds {
                            stats.count(kind);
                        }
                    }
                    Err(failure) => {
                        warn!(document = %id, kind = %failure.kind, error = %failure.message, "document failed");
                        stats.failed += 1;
                        stats.count(failure.kind);
                    }
                }
                None
            }
        }
    }

    /// One worker: schedule, process, then commit before returning.
    async fn work<J: BatchJob>(
        job: Arc<J>,
        item: J::Item,
        store: Arc<dyn CheckpointStore>,
        cancel: CancellationToken,
    ) -> WorkerReport {
        let id = item.id().to_string();
        match store.mark_pending(&id) {
            Ok(_) => {}
            Err(CheckpointError::AlreadyDone(_)) => return WorkerReport::AlreadyDone { id },
            Err(error) => return WorkerReport::LedgerFailed { id, error },
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WorkerReport::Cancelled { id },
            outcome = job.process(&item) => outcome,
        };

        let commit = match &outcome {
            Ok(output) => store.mark_done(&id, &output.row),
            Err(failure) => store.mark_failed(&id, &failure.to_string()),
        };
        WorkerReport::Finished {
            id,
            outcome,
            commit,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{OpenCheckpointStore, SqliteCheckpointStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Doc(String);

    impl BatchItem for Doc {
        fn id(&self) -> &str {
            &self.0
        }
    }

    /// Fails documents whose id starts with "bad".
    #[derive(Default)]
    struct EchoJob {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchJob for EchoJob {
        type Item = Doc;

        async fn process(&self, item: &Doc) -> Result<JobOutput, JobFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if item.0.starts_with("bad") {
                return Err(JobFailure::new(ErrorKind::AllAnalysesFailed, "every analysis failed"));
            }
            Ok(JobOutput {
                row: serde_json::json!({ "id": item.0 }),
                error_kinds: Vec::new(),
            })
        }
    }

    fn docs(ids: &[&str]) -> Vec<Doc> {
        ids.iter().map(|id| Doc(id.to_string())).collect()
    }

    fn store() -> Arc<SqliteCheckpointStore> {
        Arc::new(SqliteCheckpointStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn failures_are_recorded_without_stopping_the_batch() {
        let store = store();
        let runner = BatchRunner::new(store.clone(), FailedPolicy::Retry).with_file_concurrency(2);

        let stats = runner
            .run(Arc::new(EchoJob::default()), docs(&["a", "bad-b", "c"]))
            .await
            .unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.error_kinds.get(&ErrorKind::AllAnalysesFailed), Some(&1));
        assert_eq!(
            store.entry("bad-b").unwrap().unwrap().status,
            CheckpointStatus::Failed
        );
        assert!(store.is_done("a").unwrap());
    }

    #[tokio::test]
    async fn failed_policy_controls_rescheduling() {
        let store = store();
        store.mark_failed("x", "earlier").unwrap();

        let skip = BatchRunner::new(store.clone(), FailedPolicy::Skip);
        let job = Arc::new(EchoJob::default());
        let stats = skip.run(job.clone(), docs(&["x"])).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(job.calls.load(Ordering::SeqCst), 0);

        let retry = BatchRunner::new(store.clone(), FailedPolicy::Retry);
        let stats = retry.run(job.clone(), docs(&["x"])).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(store.entry("x").unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn limit_caps_dispatch() {
        let store = store();
        let runner = BatchRunner::new(store.clone(), FailedPolicy::Retry).with_limit(Some(2));

        let stats = runner
            .run(Arc::new(EchoJob::default()), docs(&["a", "b", "c", "d"]))
            .await
            .unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.not_dispatched, 2);
        assert_eq!(store.counts().unwrap().done, 2);
    }

    #[tokio::test]
    async fn repeated_ids_run_once() {
        let store = store();
        let job = Arc::new(EchoJob::default());
        let runner = BatchRunner::new(store.clone(), FailedPolicy::Retry)
            .with_file_concurrency(2)
            .with_max_consecutive_checkpoint_failures(1);

        let stats = runner
            .run(job.clone(), docs(&["x", "x", "y", "y", "z", "z"]))
            .await
            .unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.skipped, 3);
        assert!(stats.error_kinds.is_empty());
        assert_eq!(job.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.counts().unwrap().done, 3);
    }

    #[tokio::test]
    async fn finished_elsewhere_is_a_skip_not_a_ledger_failure() {
        let store = store();
        let job = Arc::new(EchoJob::default());

        let report = BatchRunner::work(
            job.clone(),
            Doc("x".into()),
            store.clone(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(report, WorkerReport::Finished { .. }));

        // A second copy slips past selection and races the first commit.
        let report = BatchRunner::work(
            job.clone(),
            Doc("x".into()),
            store.clone(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(report, WorkerReport::AlreadyDone { .. }));

        let runner = BatchRunner::new(store.clone(), FailedPolicy::Retry);
        let mut stats = BatchStats::default();
        let mut consecutive = 0;
        let commit_raced = WorkerReport::Finished {
            id: "x".into(),
            outcome: Ok(JobOutput {
                row: serde_json::json!({}),
                error_kinds: Vec::new(),
            }),
            commit: Err(CheckpointError::AlreadyDone("x".into())),
            elapsed_ms: 0,
        };
        assert!(runner.record(commit_raced, &mut stats, &mut consecutive).is_none());
        assert_eq!(consecutive, 0);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn failed_policy_parses() {
        assert_eq!("retry".parse::<FailedPolicy>().unwrap(), FailedPolicy::Retry);
        assert_eq!("skip".parse::<FailedPolicy>().unwrap(), FailedPolicy::Skip);
        assert!("sometimes".parse::<FailedPolicy>().is_err());
    }
}
