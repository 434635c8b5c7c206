//! Common test utilities for narrex integration tests
//!
//! Input corpora on disk, scripted graphs, and a ledger wrapper that can be
//! told to fail writes.

#![allow(dead_code)]

use narrex::checkpoint::{CheckpointCounts, CheckpointEntry, CheckpointResult, CheckpointStatus};
use narrex::{
    AdmissionGate, BatchInput, CheckpointError, CheckpointStore, ExtractionGraph, MockClient,
    OpenCheckpointStore, SqliteCheckpointStore,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Write one file per `(name, text)` pair and return the inputs in the given order.
pub fn write_corpus(dir: &Path, docs: &[(&str, &str)]) -> Vec<BatchInput> {
    docs.iter()
        .map(|(name, text)| {
            let path = dir.join(name);
            std::fs::write(&path, text).unwrap();
            BatchInput::new(path)
        })
        .collect()
}

/// `n` numbered chapters with distinct text.
pub fn numbered_corpus(dir: &Path, n: usize) -> Vec<BatchInput> {
    (1..=n)
        .map(|i| {
            let path = dir.join(format!("chapter{:03}.txt", i));
            std::fs::write(&path, format!("第{}章 正文内容 {}", i, "字".repeat(i))).unwrap();
            BatchInput::new(path)
        })
        .collect()
}

pub fn graph_with(mock: Arc<MockClient>, admission_limit: usize) -> ExtractionGraph {
    ExtractionGraph::new(AdmissionGate::new(mock, admission_limit))
}

pub fn create_test_store() -> Arc<SqliteCheckpointStore> {
    Arc::new(SqliteCheckpointStore::open_in_memory().unwrap())
}

/// Delegates to an in-memory ledger; terminal writes fail while `broken` is set.
pub struct FlakyStore {
    inner: SqliteCheckpointStore,
    broken: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteCheckpointStore::open_in_memory().unwrap(),
            broken: AtomicBool::new(false),
        }
    }

    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> CheckpointResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            Err(CheckpointError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        } else {
            Ok(())
        }
    }
}

impl CheckpointStore for FlakyStore {
    fn is_done(&self, id: &str) -> CheckpointResult<bool> {
        self.inner.is_done(id)
    }

    fn status(&self, id: &str) -> CheckpointResult<Option<CheckpointStatus>> {
        self.inner.status(id)
    }

    fn entry(&self, id: &str) -> CheckpointResult<Option<CheckpointEntry>> {
        self.inner.entry(id)
    }

    fn mark_pending(&self, id: &str) -> CheckpointResult<CheckpointEntry> {
        self.inner.mark_pending(id)
    }

    fn mark_done(&self, id: &str, row: &serde_json::Value) -> CheckpointResult<()> {
        self.check()?;
        self.inner.mark_done(id, row)
    }

    fn mark_failed(&self, id: &str, reason: &str) -> CheckpointResult<()> {
        self.check()?;
        self.inner.mark_failed(id, reason)
    }

    fn all_entries(&self) -> CheckpointResult<Vec<CheckpointEntry>> {
        self.inner.all_entries()
    }

    fn rows(&self) -> CheckpointResult<Vec<(String, serde_json::Value)>> {
        self.inner.rows()
    }

    fn counts(&self) -> CheckpointResult<CheckpointCounts> {
        self.inner.counts()
    }

    fn reset(&self) -> CheckpointResult<()> {
        self.inner.reset()
    }
}
