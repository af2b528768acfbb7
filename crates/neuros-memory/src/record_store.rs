//! Record Store.
//!
//! The authoritative, durable home of every [`MemoryRecord`]. All other
//! representations (vectors, analytical aggregates) are projections of what
//! is committed here and can be rebuilt from it.
//!
//! # Storage layout
//!
//! Three SQLite tables are created (if they do not already exist):
//!
//! | table          | purpose                                                  |
//! |----------------|----------------------------------------------------------|
//! | `records`      | one row per record, including tombstones until purged    |
//! | `record_edges` | derived-from provenance edges `child → parent`           |
//! | `change_feed`  | append-only outbox of write/update/delete events         |
//!
//! Every mutation of `records` appends to `change_feed` in the same
//! transaction, so the feed never misses or invents a change.
//!
//! Filter predicates on plain context keys and on importance are narrowed in
//! SQL with `json_extract` / `json_each`; the filter itself still decides on
//! every row that comes back.
//!
//! # Concurrency
//!
//! Mutations carry the version the caller last read. If the stored version
//! differs the mutation fails with [`StoreError::Conflict`] and nothing is
//! written.
//!
//! # Example
//!
//! ```rust
//! use neuros_memory::record_store::{RecordStore, SqliteRecordStore};
//! use neuros_types::{Context, Filter, NewRecord};
//! use serde_json::json;
//!
//! let store = SqliteRecordStore::open_in_memory().unwrap();
//!
//! let mut ctx = Context::new();
//! ctx.insert("project".into(), json!("X"));
//! let record = store.insert(NewRecord::new("timeline extended", ctx)).unwrap();
//! assert_eq!(record.id.to_string(), "r1");
//!
//! let hits = store.query(&Filter::new().eq("project", json!("X"))).unwrap();
//! assert_eq!(hits[0].id, record.id);
//! ```

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use neuros_types::record::{clamp_importance, tags_of};
use neuros_types::{
    ChangeEvent, ChangeKind, Content, Context, Embedding, EmbeddingStatus, Filter, MemoryRecord,
    Modality, NeurosError, NewRecord, Predicate, RecordId, RecordPatch,
};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from record store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record not found: {0}")]
    NotFound(RecordId),
    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: RecordId,
        expected: u64,
        actual: u64,
    },
    #[error("Edge {child} -> {parent} would close a provenance cycle")]
    Cycle { child: RecordId, parent: RecordId },
}

impl From<StoreError> for NeurosError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => NeurosError::NotFound(id),
            StoreError::Conflict {
                id,
                expected,
                actual,
            } => NeurosError::WriteConflict {
                id,
                expected,
                actual,
            },
            StoreError::Cycle { child, parent } => NeurosError::ProvenanceCycle { child, parent },
            other => NeurosError::Storage(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordStore trait
// ─────────────────────────────────────────────────────────────────────────────

/// Record counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub live: u64,
    pub tombstoned: u64,
    /// Live records whose embedding fanout exhausted its retries.
    pub degraded: u64,
    /// Live records still waiting for an embedding.
    pub pending: u64,
}

/// Transactional keyed store of canonical records.
///
/// Methods are synchronous; async callers run them on a blocking thread.
pub trait RecordStore: Send + Sync {
    /// Allocate an id and persist `record` (version 1) together with its
    /// provenance edges and a `write` change event.
    fn insert(&self, record: NewRecord) -> Result<MemoryRecord, StoreError>;

    /// Fetch a live record. Tombstones resolve to `None`.
    fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, StoreError>;

    /// Fetch a record whether or not it has been tombstoned.
    fn get_including_deleted(&self, id: RecordId) -> Result<Option<MemoryRecord>, StoreError>;

    /// Apply `patch` if the stored version equals `expected_version`.
    ///
    /// Any stored embedding is cleared and the status returns to `pending`.
    fn update(
        &self,
        id: RecordId,
        expected_version: u64,
        patch: RecordPatch,
    ) -> Result<MemoryRecord, StoreError>;

    /// Tombstone a record; it becomes purgeable after `grace`.
    fn delete(
        &self,
        id: RecordId,
        expected_version: u64,
        grace: Duration,
    ) -> Result<MemoryRecord, StoreError>;

    /// Physically remove tombstones whose grace period ended before `now`,
    /// along with their provenance edges.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<RecordId>, StoreError>;

    /// Live records matching `filter`, ascending by id.
    fn query(&self, filter: &Filter) -> Result<Vec<MemoryRecord>, StoreError>;

    /// All records ascending by id.
    fn list(&self, include_deleted: bool) -> Result<Vec<MemoryRecord>, StoreError>;

    /// Record that `child` was derived from `parent`.
    fn add_edge(&self, child: RecordId, parent: RecordId) -> Result<(), StoreError>;

    /// Store `embedding` if the record is live and still at
    /// `embedding.content_version`. Returns whether it was attached.
    fn attach_embedding(&self, id: RecordId, embedding: &Embedding) -> Result<bool, StoreError>;

    /// Mark the embedding of `id` as degraded if the record is still at
    /// `content_version`.
    fn mark_degraded(&self, id: RecordId, content_version: u64) -> Result<bool, StoreError>;

    /// Up to `limit` change events with `seq > after_seq`, ascending.
    fn changes_since(&self, after_seq: u64, limit: usize) -> Result<Vec<ChangeEvent>, StoreError>;

    /// Sequence number of the newest change event, or `0`.
    fn latest_seq(&self) -> Result<u64, StoreError>;

    fn counts(&self) -> Result<StoreCounts, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

const RECORD_COLUMNS: &str = "id, payload, modality, context, importance, embedding, \
     embedding_model, embedding_version, embedding_status, version, created_at, updated_at, \
     deleted_at, purge_after";

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| rusqlite::Error::InvalidColumnType(idx, e.to_string(), Type::Text))
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, s)).transpose()
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let id: i64 = row.get(0)?;
    let payload: String = row.get(1)?;
    let modality_str: String = row.get(2)?;
    let context_str: String = row.get(3)?;
    let importance: i64 = row.get(4)?;
    let blob: Option<Vec<u8>> = row.get(5)?;
    let model: Option<String> = row.get(6)?;
    let content_version: Option<i64> = row.get(7)?;
    let status_str: String = row.get(8)?;
    let version: i64 = row.get(9)?;

    let modality = Modality::parse(&modality_str)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(2, modality_str, Type::Text))?;
    let context: Context = serde_json::from_str(&context_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    let embedding_status = EmbeddingStatus::parse(&status_str)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(8, status_str, Type::Text))?;
    let embedding = match (blob, model, content_version) {
        (Some(blob), Some(model_version), Some(v)) => Some(Embedding {
            vector: bytes_to_embedding(&blob),
            model_version,
            content_version: v as u64,
        }),
        _ => None,
    };

    Ok(MemoryRecord {
        id: RecordId(id),
        content: Content { payload, modality },
        context,
        importance: clamp_importance(importance.clamp(0, u8::MAX as i64) as u8),
        embedding,
        embedding_status,
        version: version as u64,
        created_at: parse_ts(10, row.get(10)?)?,
        updated_at: parse_ts(11, row.get(11)?)?,
        deleted_at: parse_opt_ts(12, row.get(12)?)?,
        purge_after: parse_opt_ts(13, row.get(13)?)?,
        derived_from: Vec::new(),
    })
}

fn row_to_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeEvent> {
    let seq: i64 = row.get(0)?;
    let record_id: i64 = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let tags_str: String = row.get(3)?;
    let importance: i64 = row.get(4)?;
    let kind = ChangeKind::parse(&kind_str)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(2, kind_str, Type::Text))?;
    let tags: Vec<String> = serde_json::from_str(&tags_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(ChangeEvent {
        seq: seq as u64,
        record_id: RecordId(record_id),
        kind,
        tags,
        importance: clamp_importance(importance.clamp(0, u8::MAX as i64) as u8),
        at: parse_ts(5, row.get(5)?)?,
    })
}

fn load_parents(conn: &Connection, id: RecordId) -> Result<Vec<RecordId>, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT parent FROM record_edges WHERE child = ?1 ORDER BY parent")?;
    let rows = stmt.query_map(params![id.0], |row| row.get::<_, i64>(0).map(RecordId))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Fill `derived_from` for `records` (ascending by id) with one edge query.
fn attach_parents(conn: &Connection, records: &mut [MemoryRecord]) -> Result<(), StoreError> {
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        return Ok(());
    };
    let mut stmt = conn.prepare_cached(
        "SELECT child, parent FROM record_edges
         WHERE child BETWEEN ?1 AND ?2 ORDER BY child, parent",
    )?;
    let rows = stmt.query_map(params![first.id.0, last.id.0], |row| {
        Ok((RecordId(row.get(0)?), RecordId(row.get(1)?)))
    })?;
    let mut parents: BTreeMap<RecordId, Vec<RecordId>> = BTreeMap::new();
    for row in rows {
        let (child, parent) = row?;
        parents.entry(child).or_default().push(parent);
    }
    for record in records {
        record.derived_from = parents.remove(&record.id).unwrap_or_default();
    }
    Ok(())
}

/// JSON path of a context key, for keys SQLite can address unquoted.
fn json_path(key: &str) -> Option<String> {
    let plain = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    plain.then(|| format!("$.\"{key}\""))
}

fn scalar(value: &Value) -> Option<SqlValue> {
    match value {
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        _ => None,
    }
}

/// SQL conditions implied by `filter`.
///
/// They may admit rows the filter rejects, never the reverse;
/// [`Filter::matches`] runs on whatever they return.
fn filter_sql(filter: &Filter) -> (Vec<String>, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    for predicate in filter.predicates() {
        let (key, min, max, value) = match predicate {
            Predicate::MinImportance { min } => {
                clauses.push("importance >= ?".to_string());
                args.push(SqlValue::Integer(i64::from(*min)));
                continue;
            }
            Predicate::Range { key, min, max } => (key, *min, *max, None),
            Predicate::Eq { key, value } | Predicate::Contains { key, value } => {
                (key, None, None, scalar(value))
            }
            Predicate::Exists { key } => (key, None, None, None),
        };
        let Some(path) = json_path(key) else {
            continue;
        };
        match (predicate, value) {
            (Predicate::Eq { .. }, Some(v)) => {
                clauses.push("json_extract(context, ?) = ?".to_string());
                args.extend([SqlValue::Text(path), v]);
            }
            (Predicate::Contains { .. }, Some(v)) => {
                clauses.push(
                    "EXISTS (SELECT 1 FROM json_each(records.context, ?) AS e WHERE e.value = ?)"
                        .to_string(),
                );
                args.extend([SqlValue::Text(path), v]);
            }
            (Predicate::Range { .. }, _) => {
                clauses.push("json_type(context, ?) IN ('integer', 'real')".to_string());
                args.push(SqlValue::Text(path.clone()));
                if let Some(lo) = min {
                    clauses.push("json_extract(context, ?) >= ?".to_string());
                    args.extend([SqlValue::Text(path.clone()), SqlValue::Real(lo)]);
                }
                if let Some(hi) = max {
                    clauses.push("json_extract(context, ?) <= ?".to_string());
                    args.extend([SqlValue::Text(path), SqlValue::Real(hi)]);
                }
            }
            _ => {
                clauses.push("json_type(context, ?) IS NOT NULL".to_string());
                args.push(SqlValue::Text(path));
            }
        }
    }
    (clauses, args)
}

fn select_records(
    conn: &Connection,
    mut clauses: Vec<String>,
    args: Vec<SqlValue>,
    include_deleted: bool,
) -> Result<Vec<MemoryRecord>, StoreError> {
    if !include_deleted {
        clauses.insert(0, "deleted_at IS NULL".to_string());
    }
    let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id ASC");
    let mut records = {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    attach_parents(conn, &mut records)?;
    Ok(records)
}

fn fetch(
    conn: &Connection,
    id: RecordId,
    include_deleted: bool,
) -> Result<Option<MemoryRecord>, StoreError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1");
    let record = conn
        .query_row(&sql, params![id.0], row_to_record)
        .optional()?;
    match record {
        Some(mut r) if include_deleted || !r.is_deleted() => {
            r.derived_from = load_parents(conn, r.id)?;
            Ok(Some(r))
        }
        _ => Ok(None),
    }
}

fn append_change(
    conn: &Connection,
    id: RecordId,
    kind: ChangeKind,
    context: &Context,
    importance: u8,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let tags = serde_json::to_string(&tags_of(context))?;
    conn.execute(
        "INSERT INTO change_feed (record_id, kind, tags, importance, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id.0, kind.as_str(), tags, importance as i64, ts(at)],
    )?;
    Ok(())
}

/// Insert `child → parent` unless it would close a cycle.
///
/// A cycle exists iff `child` is `parent` itself or one of its ancestors.
fn link(conn: &Connection, child: RecordId, parent: RecordId) -> Result<(), StoreError> {
    if child == parent {
        return Err(StoreError::Cycle { child, parent });
    }
    let parent_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM records WHERE id = ?1)",
        params![parent.0],
        |row| row.get(0),
    )?;
    if !parent_exists {
        return Err(StoreError::NotFound(parent));
    }
    let closes_cycle: bool = conn.query_row(
        "WITH RECURSIVE ancestors(id) AS (
             SELECT parent FROM record_edges WHERE child = ?1
             UNION
             SELECT e.parent FROM record_edges e JOIN ancestors a ON e.child = a.id
         )
         SELECT EXISTS(SELECT 1 FROM ancestors WHERE id = ?2)",
        params![parent.0, child.0],
        |row| row.get(0),
    )?;
    if closes_cycle {
        return Err(StoreError::Cycle { child, parent });
    }
    conn.execute(
        "INSERT OR IGNORE INTO record_edges (child, parent) VALUES (?1, ?2)",
        params![child.0, parent.0],
    )?;
    Ok(())
}

fn check_version(current: &MemoryRecord, expected: u64) -> Result<(), StoreError> {
    if current.version == expected {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            id: current.id,
            expected,
            actual: current.version,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteRecordStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`RecordStore`].
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                payload           TEXT NOT NULL,
                modality          TEXT NOT NULL,
                context           TEXT NOT NULL,
                importance        INTEGER NOT NULL,
                embedding         BLOB,
                embedding_model   TEXT,
                embedding_version INTEGER,
                embedding_status  TEXT NOT NULL,
                version           INTEGER NOT NULL,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL,
                deleted_at        TEXT,
                purge_after       TEXT
            );
            CREATE TABLE IF NOT EXISTS record_edges (
                child  INTEGER NOT NULL,
                parent INTEGER NOT NULL,
                PRIMARY KEY (child, parent)
            );
            CREATE INDEX IF NOT EXISTS record_edges_parent ON record_edges (parent);
            CREATE TABLE IF NOT EXISTS change_feed (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id  INTEGER NOT NULL,
                kind       TEXT NOT NULL,
                tags       TEXT NOT NULL,
                importance INTEGER NOT NULL,
                at         TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert(&self, record: NewRecord) -> Result<MemoryRecord, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let importance = clamp_importance(record.importance);
        let context = serde_json::to_string(&record.context)?;
        tx.execute(
            "INSERT INTO records
                 (payload, modality, context, importance, embedding_status, version,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
            params![
                record.content.payload,
                record.content.modality.as_str(),
                context,
                importance as i64,
                EmbeddingStatus::Pending.as_str(),
                ts(now),
            ],
        )?;
        let id = RecordId(tx.last_insert_rowid());
        for parent in &record.derived_from {
            link(&tx, id, *parent)?;
        }
        append_change(&tx, id, ChangeKind::Write, &record.context, importance, now)?;
        let stored = fetch(&tx, id, true)?.ok_or(StoreError::NotFound(id))?;
        tx.commit()?;
        debug!(id = %id, parents = stored.derived_from.len(), "record inserted");
        Ok(stored)
    }

    fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, StoreError> {
        fetch(&self.lock(), id, false)
    }

    fn get_including_deleted(&self, id: RecordId) -> Result<Option<MemoryRecord>, StoreError> {
        fetch(&self.lock(), id, true)
    }

    fn update(
        &self,
        id: RecordId,
        expected_version: u64,
        patch: RecordPatch,
    ) -> Result<MemoryRecord, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current = fetch(&tx, id, false)?.ok_or(StoreError::NotFound(id))?;
        check_version(&current, expected_version)?;
        if patch.is_empty() {
            return Ok(current);
        }

        let now = Utc::now();
        let content = patch.content.unwrap_or(current.content);
        let context = patch.context.unwrap_or(current.context);
        let importance = clamp_importance(patch.importance.unwrap_or(current.importance));
        let version = current.version + 1;
        tx.execute(
            "UPDATE records
             SET payload = ?1, modality = ?2, context = ?3, importance = ?4,
                 embedding = NULL, embedding_model = NULL, embedding_version = NULL,
                 embedding_status = ?5, version = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                content.payload,
                content.modality.as_str(),
                serde_json::to_string(&context)?,
                importance as i64,
                EmbeddingStatus::Pending.as_str(),
                version as i64,
                ts(now),
                id.0,
            ],
        )?;
        append_change(&tx, id, ChangeKind::Update, &context, importance, now)?;
        let stored = fetch(&tx, id, false)?.ok_or(StoreError::NotFound(id))?;
        tx.commit()?;
        debug!(id = %id, version, "record updated");
        Ok(stored)
    }

    fn delete(
        &self,
        id: RecordId,
        expected_version: u64,
        grace: Duration,
    ) -> Result<MemoryRecord, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current = fetch(&tx, id, false)?.ok_or(StoreError::NotFound(id))?;
        check_version(&current, expected_version)?;

        let now = Utc::now();
        let version = current.version + 1;
        tx.execute(
            "UPDATE records
             SET embedding = NULL, embedding_model = NULL, embedding_version = NULL,
                 version = ?1, updated_at = ?2, deleted_at = ?2, purge_after = ?3
             WHERE id = ?4",
            params![version as i64, ts(now), ts(now + grace), id.0],
        )?;
        append_change(
            &tx,
            id,
            ChangeKind::Delete,
            &current.context,
            current.importance,
            now,
        )?;
        let stored = fetch(&tx, id, true)?.ok_or(StoreError::NotFound(id))?;
        tx.commit()?;
        debug!(id = %id, grace_secs = grace.num_seconds(), "record tombstoned");
        Ok(stored)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<RecordId>, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let candidates: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, purge_after FROM records
                 WHERE deleted_at IS NOT NULL AND purge_after IS NOT NULL
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut purged = Vec::new();
        for (id, purge_after) in candidates {
            if parse_ts(1, purge_after)? > now {
                continue;
            }
            tx.execute(
                "DELETE FROM record_edges WHERE child = ?1 OR parent = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM records WHERE id = ?1", params![id])?;
            purged.push(RecordId(id));
        }
        tx.commit()?;
        if !purged.is_empty() {
            debug!(count = purged.len(), "tombstones purged");
        }
        Ok(purged)
    }

    fn query(&self, filter: &Filter) -> Result<Vec<MemoryRecord>, StoreError> {
        let (clauses, args) = filter_sql(filter);
        let mut records = select_records(&self.lock(), clauses, args, false)?;
        records.retain(|r| filter.matches(r));
        Ok(records)
    }

    fn list(&self, include_deleted: bool) -> Result<Vec<MemoryRecord>, StoreError> {
        select_records(&self.lock(), Vec::new(), Vec::new(), include_deleted)
    }

    fn add_edge(&self, child: RecordId, parent: RecordId) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let child_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM records WHERE id = ?1)",
            params![child.0],
            |row| row.get(0),
        )?;
        if !child_exists {
            return Err(StoreError::NotFound(child));
        }
        link(&tx, child, parent)?;
        tx.commit()?;
        debug!(child = %child, parent = %parent, "provenance edge added");
        Ok(())
    }

    fn attach_embedding(&self, id: RecordId, embedding: &Embedding) -> Result<bool, StoreError> {
        let changed = self.lock().execute(
            "UPDATE records
             SET embedding = ?1, embedding_model = ?2, embedding_version = ?3,
                 embedding_status = ?4
             WHERE id = ?5 AND version = ?3 AND deleted_at IS NULL",
            params![
                embedding_to_bytes(&embedding.vector),
                embedding.model_version,
                embedding.content_version as i64,
                EmbeddingStatus::Ready.as_str(),
                id.0,
            ],
        )?;
        Ok(changed == 1)
    }

    fn mark_degraded(&self, id: RecordId, content_version: u64) -> Result<bool, StoreError> {
        let changed = self.lock().execute(
            "UPDATE records SET embedding_status = ?1
             WHERE id = ?2 AND version = ?3 AND deleted_at IS NULL",
            params![
                EmbeddingStatus::Degraded.as_str(),
                id.0,
                content_version as i64
            ],
        )?;
        Ok(changed == 1)
    }

    fn changes_since(&self, after_seq: u64, limit: usize) -> Result<Vec<ChangeEvent>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, record_id, kind, tags, importance, at FROM change_feed
             WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![after_seq as i64, limit.min(i64::MAX as usize) as i64],
            row_to_change,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn latest_seq(&self) -> Result<u64, StoreError> {
        let seq: i64 = self.lock().query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM change_feed",
            [],
            |row| row.get(0),
        )?;
        Ok(seq as u64)
    }

    fn counts(&self) -> Result<StoreCounts, StoreError> {
        let (live, tombstoned, degraded, pending): (i64, i64, i64, i64) = self.lock().query_row(
            "SELECT
                 COALESCE(SUM(deleted_at IS NULL), 0),
                 COALESCE(SUM(deleted_at IS NOT NULL), 0),
                 COALESCE(SUM(deleted_at IS NULL AND embedding_status = 'degraded'), 0),
                 COALESCE(SUM(deleted_at IS NULL AND embedding_status = 'pending'), 0)
             FROM records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(StoreCounts {
            live: live as u64,
            tombstoned: tombstoned as u64,
            degraded: degraded as u64,
            pending: pending as u64,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
