//! SQLite database for the append-only run history

use crate::types::RunRecord;
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Append-only store of run records
///
/// Cloning shares the underlying connection. Readers get owned snapshots, so an
/// append that lands while a plan is being built never changes that plan's
/// input.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // WAL lets concurrent CLI invocations read while a run appends
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened run history at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS run_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                test_name TEXT NOT NULL,
                verdict TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                record TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_records_test ON run_records(test_name);
            CREATE INDEX IF NOT EXISTS idx_run_records_started ON run_records(started_at);
            "#,
        )?;

        debug!("Run history schema initialized");
        Ok(())
    }

    /// Append a completed run; records are never updated afterwards
    pub fn append_run(&self, record: &RunRecord) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO run_records (run_id, test_name, verdict, started_at, finished_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.run_id,
                record.test_name,
                record.verdict.to_string(),
                record.started_at.timestamp_millis(),
                record.finished_at.timestamp_millis(),
                serde_json::to_string(record)?,
            ],
        )?;

        debug!("Appended run {} for {}", record.run_id, record.test_name);
        Ok(())
    }

    /// Snapshot of all runs started at or after `since`, oldest first
    pub fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT record FROM run_records WHERE started_at >= ?1 ORDER BY started_at, seq",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    /// Most recent runs of one test, newest first
    pub fn runs_for_test(&self, test_name: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT record FROM run_records WHERE test_name = ?1
             ORDER BY started_at DESC, seq DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![test_name, limit as i64], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    /// Total number of stored runs
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM run_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
