//! Append-only log of finished reasoning traces.
//!
//! # Storage layout
//!
//! | column      | type | description                          |
//! |-------------|------|--------------------------------------|
//! | id          | TEXT | trace UUID, primary key              |
//! | state       | TEXT | `done` or `failed`                   |
//! | question    | TEXT | the question asked                   |
//! | finished_at | TEXT | RFC-3339 completion time (UTC)       |
//! | body        | TEXT | the full trace as JSON               |
//!
//! Rows are only ever inserted. Logging the same trace twice is an error.

use std::sync::{Mutex, MutexGuard, PoisonError};

use neuros_types::{NeurosError, ReasoningTrace, TraceId};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceLogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Trace {0} is still running")]
    NotFinished(TraceId),
    #[error("Trace {0} is already logged")]
    Duplicate(TraceId),
}

impl From<TraceLogError> for NeurosError {
    fn from(e: TraceLogError) -> Self {
        match e {
            TraceLogError::NotFinished(id) => NeurosError::TraceNotFinished(id),
            TraceLogError::Duplicate(id) => NeurosError::TraceFinalized(id),
            other => NeurosError::Storage(other.to_string()),
        }
    }
}

pub struct TraceLog {
    conn: Mutex<Connection>,
}

impl TraceLog {
    pub fn open(path: &str) -> Result<Self, TraceLogError> {
        let log = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        log.init_schema()?;
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self, TraceLogError> {
        let log = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), TraceLogError> {
        self.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS reasoning_traces (
                 id          TEXT PRIMARY KEY,
                 state       TEXT NOT NULL,
                 question    TEXT NOT NULL,
                 finished_at TEXT NOT NULL,
                 body        TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS reasoning_traces_finished
                 ON reasoning_traces (finished_at);",
        )?;
        Ok(())
    }

    /// Insert a terminal trace.
    pub fn append(&self, trace: &ReasoningTrace) -> Result<(), TraceLogError> {
        let Some(finished_at) = trace.finished_at() else {
            return Err(TraceLogError::NotFinished(trace.id()));
        };
        let body = serde_json::to_string(trace)?;
        let inserted = self.lock().execute(
            "INSERT INTO reasoning_traces (id, state, question, finished_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                trace.id().to_string(),
                trace.state().as_str(),
                trace.question(),
                finished_at.to_rfc3339(),
                body,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(TraceLogError::Duplicate(trace.id()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: TraceId) -> Result<Option<ReasoningTrace>, TraceLogError> {
        let body: Option<String> = self
            .lock()
            .query_row(
                "SELECT body FROM reasoning_traces WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(Into::into))
            .transpose()
    }

    /// Most recently finished traces first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ReasoningTrace>, TraceLogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT body FROM reasoning_traces ORDER BY finished_at DESC, id LIMIT ?1",
        )?;
        let bodies = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Into::into))
            .collect()
    }

    pub fn len(&self) -> Result<usize, TraceLogError> {
        let n: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM reasoning_traces", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool, TraceLogError> {
        Ok(self.len()? == 0)
    }
}
