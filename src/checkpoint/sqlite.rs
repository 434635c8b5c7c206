//! SQLite checkpoint ledger

use super::traits::{
    CheckpointCounts, CheckpointEntry, CheckpointError, CheckpointResult, CheckpointStatus,
    CheckpointStore, OpenCheckpointStore,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed checkpoint ledger
///
/// Two tables: `checkpoints` holds one status row per input id and `rows`
/// holds the extracted record per completed id, with an autoincrement
/// sequence giving completion order. Writers are serialized by the
/// connection mutex and every transition runs in its own transaction.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

type RawEntry = (String, String, Option<String>, u32, String, Option<String>);

impl SqliteCheckpointStore {
    fn init_schema(conn: &Connection) -> CheckpointResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                reason TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_status
                ON checkpoints(status);

            -- Extracted output, one row per completed id
            CREATE TABLE IF NOT EXISTS rows (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                row_json TEXT NOT NULL,
                completed_at TEXT NOT NULL
            );

            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> CheckpointResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CheckpointError::LockPoisoned)
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    fn parse_timestamp(raw: &str) -> CheckpointResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CheckpointError::DateParse(format!("{}: {}", raw, e)))
    }

    fn current_status(
        conn: &Connection,
        id: &str,
    ) -> CheckpointResult<Option<(CheckpointStatus, u32)>> {
        let found: Option<(String, u32)> = conn
            .query_row(
                "SELECT status, attempts FROM checkpoints WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match found {
            Some((status, attempts)) => Ok(Some((status.parse()?, attempts))),
            None => Ok(None),
        }
    }

    fn to_entry(raw: RawEntry) -> CheckpointResult<CheckpointEntry> {
        let (id, status, reason, attempts, updated_at, row_json) = raw;
        let row: Option<serde_json::Value> = row_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?;
        Ok(CheckpointEntry {
            id,
            status: status.parse()?,
            reason,
            attempts,
            timestamp: Self::parse_timestamp(&updated_at)?,
            row,
        })
    }

    fn read_entry(raw: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok((
            raw.get(0)?,
            raw.get(1)?,
            raw.get(2)?,
            raw.get(3)?,
            raw.get(4)?,
            raw.get(5)?,
        ))
    }

    const ENTRY_COLUMNS: &'static str = "SELECT c.id, c.status, c.reason, c.attempts, c.updated_at, r.row_json \
         FROM checkpoints c LEFT JOIN rows r ON r.id = c.id";
}

impl OpenCheckpointStore for SqliteCheckpointStore {
    fn open(path: impl AsRef<Path>) -> CheckpointResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> CheckpointResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn is_done(&self, id: &str) -> CheckpointResult<bool> {
        let conn = self.lock()?;
        Ok(matches!(
            Self::current_status(&conn, id)?,
            Some((CheckpointStatus::Done, _))
        ))
    }

    fn status(&self, id: &str) -> CheckpointResult<Option<CheckpointStatus>> {
        let conn = self.lock()?;
        Ok(Self::current_status(&conn, id)?.map(|(status, _)| status))
    }

    fn entry(&self, id: &str) -> CheckpointResult<Option<CheckpointEntry>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{} WHERE c.id = ?1", Self::ENTRY_COLUMNS),
                params![id],
                Self::read_entry,
            )
            .optional()?;
        raw.map(Self::to_entry).transpose()
    }

    fn mark_pending(&self, id: &str) -> CheckpointResult<CheckpointEntry> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let attempts = match Self::current_status(&tx, id)? {
            Some((CheckpointStatus::Done, _)) => {
                return Err(CheckpointError::AlreadyDone(id.to_string()))
            }
            Some((_, attempts)) => attempts + 1,
            None => 1,
        };
        let now = Utc::now();
        tx.execute(
            r#"
            INSERT INTO checkpoints (id, status, reason, attempts, updated_at)
            VALUES (?1, 'pending', NULL, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                status = 'pending',
                reason = NULL,
                attempts = excluded.attempts,
                updated_at = excluded.updated_at
            "#,
            params![id, attempts, now.to_rfc3339()],
        )?;
        tx.commit()?;

        Ok(CheckpointEntry {
            id: id.to_string(),
            status: CheckpointStatus::Pending,
            reason: None,
            attempts,
            timestamp: now,
            row: None,
        })
    }

    fn mark_done(&self, id: &str, row: &serde_json::Value) -> CheckpointResult<()> {
        let row_json = serde_json::to_string(row)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if let Some((CheckpointStatus::Done, _)) = Self::current_status(&tx, id)? {
            return Err(CheckpointError::AlreadyDone(id.to_string()));
        }
        let now = Self::now();
        tx.execute(
            r#"
            INSERT INTO checkpoints (id, status, reason, attempts, updated_at)
            VALUES (?1, 'done', NULL, 1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                status = 'done',
                reason = NULL,
                updated_at = excluded.updated_at
            "#,
            params![id, now],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO rows (id, row_json, completed_at) VALUES (?1, ?2, ?3)",
            params![id, row_json, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn mark_failed(&self, id: &str, reason: &str) -> CheckpointResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if let Some((CheckpointStatus::Done, _)) = Self::current_status(&tx, id)? {
            return Err(CheckpointError::AlreadyDone(id.to_string()));
        }
        tx.execute(
            r#"
            INSERT INTO checkpoints (id, status, reason, attempts, updated_at)
            VALUES (?1, 'failed', ?2, 1, ?3)
            ON CONFLICT(id) DO UPDATE SET
                status = 'failed',
                reason = excluded.reason,
                updated_at = excluded.updated_at
            "#,
            params![id, reason, Self::now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn all_entries(&self) -> CheckpointResult<Vec<CheckpointEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY c.id", Self::ENTRY_COLUMNS))?;
        let raw: Vec<RawEntry> = stmt
            .query_map([], Self::read_entry)?
            .collect::<Result<_, _>>()?;
        raw.into_iter().map(Self::to_entry).collect()
    }

    fn rows(&self) -> CheckpointResult<Vec<(String, serde_json::Value)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, row_json FROM rows ORDER BY seq")?;
        let raw: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        let mut rows = Vec::with_capacity(raw.len());
        for (id, json) in raw {
            rows.push((id, serde_json::from_str(&json)?));
        }
        Ok(rows)
    }

    fn counts(&self) -> CheckpointResult<CheckpointCounts> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM checkpoints GROUP BY status")?;
        let raw: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut counts = CheckpointCounts::default();
        for (status, n) in raw {
            let n = n as usize;
            match status.parse()? {
                CheckpointStatus::Done => counts.done = n,
                CheckpointStatus::Failed => counts.failed = n,
                CheckpointStatus::Pending => counts.pending = n,
            }
        }
        Ok(counts)
    }

    fn reset(&self) -> CheckpointResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM rows", [])?;
        tx.execute("DELETE FROM checkpoints", [])?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn create_test_store() -> SqliteCheckpointStore {
        SqliteCheckpointStore::open_in_memory().unwrap()
    }

    #[test]
    fn done_entry_carries_row_and_timestamp() {
        let store = create_test_store();
        assert!(!store.is_done("a.txt").unwrap());

        store.mark_pending("a.txt").unwrap();
        store.mark_done("a.txt", &json!({"plot": "x"})).unwrap();

        assert!(store.is_done("a.txt").unwrap());
        let entry = store.entry("a.txt").unwrap().unwrap();
        assert_eq!(entry.status, CheckpointStatus::Done);
        assert_eq!(entry.row, Some(json!({"plot": "x"})));
        assert_eq!(entry.attempts, 1);
        assert!(entry.timestamp <= Utc::now());
    }

    #[test]
    fn status_tracks_transitions() {
        let store = create_test_store();
        assert_eq!(store.status("a").unwrap(), None);

        store.mark_pending("a").unwrap();
        assert_eq!(store.status("a").unwrap(), Some(CheckpointStatus::Pending));
        store.mark_failed("a", "refused").unwrap();
        assert_eq!(store.status("a").unwrap(), Some(CheckpointStatus::Failed));
        store.mark_pending("a").unwrap();
        store.mark_done("a", &json!({"big": "row"})).unwrap();
        assert_eq!(store.status("a").unwrap(), Some(CheckpointStatus::Done));
    }

    #[test]
    fn done_is_final() {
        let store = create_test_store();
        store.mark_done("a", &json!(1)).unwrap();

        assert!(matches!(
            store.mark_done("a", &json!(2)),
            Err(CheckpointError::AlreadyDone(_))
        ));
        assert!(matches!(
            store.mark_failed("a", "late"),
            Err(CheckpointError::AlreadyDone(_))
        ));
        assert!(matches!(
            store.mark_pending("a"),
            Err(CheckpointError::AlreadyDone(_))
        ));
        assert_eq!(store.rows().unwrap(), vec![("a".to_string(), json!(1))]);
    }

    #[test]
    fn rescheduling_failed_entry_bumps_attempts() {
        let store = create_test_store();
        store.mark_pending("a").unwrap();
        store.mark_failed("a", "all analyses failed").unwrap();

        let failed = store.entry("a").unwrap().unwrap();
        assert_eq!(failed.status, CheckpointStatus::Failed);
        assert_eq!(failed.reason.as_deref(), Some("all analyses failed"));
        assert!(failed.row.is_none());

        let retried = store.mark_pending("a").unwrap();
        assert_eq!(retried.attempts, 2);
        let stored = store.entry("a").unwrap().unwrap();
        assert_eq!(stored.status, CheckpointStatus::Pending);
        assert!(stored.reason.is_none());
    }

    #[test]
    fn counts_and_rows_follow_completion_order() {
        let store = create_test_store();
        for id in ["c", "a", "b", "d"] {
            store.mark_pending(id).unwrap();
        }
        store.mark_done("c", &json!("c")).unwrap();
        store.mark_failed("b", "boom").unwrap();
        store.mark_done("a", &json!("a")).unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(
            counts,
            CheckpointCounts {
                done: 2,
                failed: 1,
                pending: 1
            }
        );
        assert_eq!(counts.total(), 4);

        let ids: Vec<String> = store.rows().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["c", "a"]);

        let entries: Vec<String> = store.all_entries().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(entries, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn reset_clears_everything() {
        let store = create_test_store();
        store.mark_done("a", &json!(1)).unwrap();
        store.mark_failed("b", "x").unwrap();

        store.reset().unwrap();

        assert!(store.all_entries().unwrap().is_empty());
        assert!(store.rows().unwrap().is_empty());
        assert_eq!(store.counts().unwrap().total(), 0);
        store.mark_done("a", &json!(2)).unwrap();
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");

        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.mark_done("a", &json!({"n": 1})).unwrap();
            store.mark_pending("b").unwrap();
        }

        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert!(store.is_done("a").unwrap());
        assert_eq!(
            store.entry("b").unwrap().unwrap().status,
            CheckpointStatus::Pending
        );
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteCheckpointStore::open(dir.path().join("ledger.db")).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("doc-{}-{}", worker, i);
                        store.mark_pending(&id).unwrap();
                        store.mark_done(&id, &json!({"worker": worker})).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.counts().unwrap().done, 200);
        assert_eq!(store.rows().unwrap().len(), 200);
    }
}
