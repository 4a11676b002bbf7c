//! Local index store backed by SQLite.
//!
//! Holds every indexed record plus the derived tables the aggregation engine
//! maintains, the resumable stream cursor and known-actor bookkeeping. The
//! whole file is a cache: deleting it and replaying the stream (plus
//! backfill) rebuilds it.
//!
//! # Concurrency
//!
//! One writer connection sits behind a mutex; readers check connections out
//! of a small pool. With WAL journaling readers never wait on the writer,
//! so the firehose consumer and query paths run side by side.
//!
//! ```text
//! consumer ──write()──▶ writer conn ─┐
//!                                    ├─▶ index.db (WAL)
//! queries ───read()───▶ reader pool ─┘
//! ```
//!
//! Chronological, by-type and by-actor "indices" are SQL indexes on the
//! `records` table, so they can never hold an entry for a deleted record.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result, StorageError};
use crate::records::{IndexedRecord, RecordType};

/// Current schema version, kept in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

pub(crate) const RECORD_COLUMNS: &str =
    "uri, actor_id, record_type, record_key, payload, content_hash, indexed_at, created_at";

/// Store tuning knobs.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Idle reader connections kept for reuse.
    pub reader_pool_size: usize,
    /// How long a connection waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            reader_pool_size: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Backfill progress for a known actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    NotStarted,
    Done,
}

impl BackfillState {
    const fn as_db_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Done => "done",
        }
    }

    fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Self::NotStarted),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// An actor the index has seen at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownActor {
    pub actor_id: String,
    pub backfill_state: BackfillState,
    pub first_seen_at: i64,
    pub backfilled_at: Option<i64>,
}

/// Keyset position `(created_at, uri)`; scans return rows strictly before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChronoKey {
    pub created_at: i64,
    pub uri: String,
}

impl ChronoKey {
    #[must_use]
    pub fn of(record: &IndexedRecord) -> Self {
        Self {
            created_at: record.created_at,
            uri: record.uri.clone(),
        }
    }
}

/// Reverse-chronological scan parameters.
#[derive(Debug, Clone, Default)]
pub struct RecordScan {
    pub record_type: Option<RecordType>,
    pub actor_id: Option<String>,
    pub before: Option<ChronoKey>,
    pub limit: usize,
}

/// Diagnostic counts over the whole index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_records: u64,
    pub records_by_type: BTreeMap<String, u64>,
    pub known_actors: u64,
    pub backfilled_actors: u64,
    pub like_edges: u64,
    pub comments: u64,
    pub notifications: u64,
    pub cursor: Option<i64>,
}

/// Handle to the on-disk index.
pub struct IndexStore {
    path: PathBuf,
    options: StoreOptions,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl IndexStore {
    /// Open or create the index at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open or create the index at `path`, applying migrations.
    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = open_conn(&path, options.busy_timeout)?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        migrate(&writer)?;
        info!(path = %path.display(), "index store opened");

        Ok(Self {
            path,
            options,
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside one immediate write transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls back
    /// every change made inside it.
    pub fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` on a pooled reader connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let pooled = self
            .readers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => open_conn(&self.path, self.options.busy_timeout)?,
        };

        let result = f(&conn);

        let mut readers = self
            .readers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if readers.len() < self.options.reader_pool_size {
            readers.push(conn);
        }
        result
    }

    /// Raw record write without aggregation; writes outside tests go through
    /// [`IndexStore::apply`].
    #[cfg(test)]
    pub(crate) fn upsert_record(&self, record: &IndexedRecord) -> Result<bool> {
        self.write(|conn| upsert_record(conn, record))
    }

    #[cfg(test)]
    pub(crate) fn delete_record(&self, uri: &str) -> Result<Option<IndexedRecord>> {
        self.write(|conn| delete_record(conn, uri))
    }

    pub fn get_record(&self, uri: &str) -> Result<Option<IndexedRecord>> {
        self.read(|conn| get_record(conn, uri))
    }

    pub fn scan(&self, scan: &RecordScan) -> Result<Vec<IndexedRecord>> {
        self.read(|conn| scan_records(conn, scan))
    }

    /// Last durably processed stream position.
    pub fn load_cursor(&self) -> Result<Option<i64>> {
        self.read(load_cursor)
    }

    /// Persist the stream position; never moves it backwards.
    pub fn save_cursor(&self, time_us: i64) -> Result<()> {
        self.write(|conn| save_cursor(conn, time_us))
    }

    pub fn known_actor(&self, actor_id: &str) -> Result<Option<KnownActor>> {
        self.read(|conn| known_actor(conn, actor_id))
    }

    pub fn is_backfilled(&self, actor_id: &str) -> Result<bool> {
        self.read(|conn| is_backfilled(conn, actor_id))
    }

    pub fn mark_backfilled(&self, actor_id: &str, now_us: i64) -> Result<()> {
        self.write(|conn| mark_backfilled(conn, actor_id, now_us))
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.read(stats)
    }
}

fn open_conn(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", 1)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        }
        .into());
    }
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;
    if current < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        debug!(from = current, to = SCHEMA_VERSION, "index schema migrated");
    }
    Ok(())
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
    uri TEXT PRIMARY KEY,
    actor_id TEXT NOT NULL,
    record_type TEXT NOT NULL,
    record_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    indexed_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_chrono
    ON records(created_at DESC, uri DESC);
CREATE INDEX IF NOT EXISTS idx_records_type_chrono
    ON records(record_type, created_at DESC, uri DESC);
CREATE INDEX IF NOT EXISTS idx_records_actor_chrono
    ON records(actor_id, created_at DESC, uri DESC);

CREATE TABLE IF NOT EXISTS known_actors (
    actor_id TEXT PRIMARY KEY,
    backfill_state TEXT NOT NULL CHECK(backfill_state IN ('not_started', 'done')),
    first_seen_at INTEGER NOT NULL,
    backfilled_at INTEGER
);

CREATE TABLE IF NOT EXISTS stream_cursor (
    id INTEGER PRIMARY KEY CHECK(id = 1),
    time_us INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS likes (
    subject_uri TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    record_key TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY(subject_uri, actor_id)
);

CREATE INDEX IF NOT EXISTS idx_likes_actor_key ON likes(actor_id, record_key);

CREATE TABLE IF NOT EXISTS like_counts (
    subject_uri TEXT PRIMARY KEY,
    count INTEGER NOT NULL CHECK(count > 0)
);

CREATE TABLE IF NOT EXISTS comments (
    actor_id TEXT NOT NULL,
    record_key TEXT NOT NULL,
    subject_uri TEXT NOT NULL,
    parent_uri TEXT,
    text TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    PRIMARY KEY(actor_id, record_key)
);

CREATE INDEX IF NOT EXISTS idx_comments_subject ON comments(subject_uri, created_at);

CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY,
    target_actor TEXT NOT NULL,
    kind TEXT NOT NULL CHECK(kind IN ('like', 'comment', 'reply')),
    actor_id TEXT NOT NULL,
    subject_uri TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(target_actor, kind, actor_id, subject_uri)
);

CREATE INDEX IF NOT EXISTS idx_notifications_target
    ON notifications(target_actor, created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS notification_reads (
    target_actor TEXT PRIMARY KEY,
    last_read_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
    actor_id TEXT PRIMARY KEY,
    profile_json TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
";

/// Insert or replace a record and register its actor.
///
/// Returns `true` when an existing row was replaced.
pub(crate) fn upsert_record(conn: &Connection, record: &IndexedRecord) -> Result<bool> {
    let existed: bool = conn
        .query_row(
            "SELECT 1 FROM records WHERE uri = ?1",
            [&record.uri],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    let payload = serde_json::to_string(&record.payload)?;
    conn.execute(
        "INSERT INTO records (uri, actor_id, record_type, record_key, payload, content_hash, indexed_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(uri) DO UPDATE SET
            payload = excluded.payload,
            content_hash = excluded.content_hash,
            indexed_at = excluded.indexed_at,
            created_at = excluded.created_at",
        params![
            record.uri,
            record.actor_id,
            record.record_type.nsid(),
            record.record_key,
            payload,
            record.content_hash,
            record.indexed_at,
            record.created_at,
        ],
    )?;
    register_actor(conn, &record.actor_id, record.indexed_at)?;
    Ok(existed)
}

/// Delete a record, returning what was stored so callers can clean up
/// anything derived from its payload.
pub(crate) fn delete_record(conn: &Connection, uri: &str) -> Result<Option<IndexedRecord>> {
    let Some(existing) = get_record(conn, uri)? else {
        return Ok(None);
    };
    conn.execute("DELETE FROM records WHERE uri = ?1", [uri])?;
    Ok(Some(existing))
}

pub(crate) fn get_record(conn: &Connection, uri: &str) -> Result<Option<IndexedRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE uri = ?1");
    conn.query_row(&sql, [uri], decode_record_row)
        .optional()
        .map_err(Error::from)
}

/// Batch point lookup; missing URIs are simply absent from the map.
pub(crate) fn get_records(
    conn: &Connection,
    uris: &[String],
) -> Result<HashMap<String, IndexedRecord>> {
    let mut found = HashMap::with_capacity(uris.len());
    // Stay well below SQLite's bound-parameter limit
    for chunk in uris.chunks(500) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE uri IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), decode_record_row)?;
        for row in rows {
            let record = row?;
            found.insert(record.uri.clone(), record);
        }
    }
    Ok(found)
}

pub(crate) fn scan_records(conn: &Connection, scan: &RecordScan) -> Result<Vec<IndexedRecord>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(record_type) = scan.record_type {
        clauses.push("record_type = ?");
        args.push(SqlValue::Text(record_type.nsid().to_string()));
    }
    if let Some(actor) = &scan.actor_id {
        clauses.push("actor_id = ?");
        args.push(SqlValue::Text(actor.clone()));
    }
    if let Some(before) = &scan.before {
        clauses.push("(created_at, uri) < (?, ?)");
        args.push(SqlValue::Integer(before.created_at));
        args.push(SqlValue::Text(before.uri.clone()));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    args.push(SqlValue::Integer(i64::try_from(scan.limit).unwrap_or(i64::MAX)));

    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM records {where_sql}
         ORDER BY created_at DESC, uri DESC
         LIMIT ?"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args), decode_record_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(Error::from)
}

/// Decode the first eight columns of a row laid out as [`RECORD_COLUMNS`].
pub(crate) fn decode_record_row(row: &Row<'_>) -> rusqlite::Result<IndexedRecord> {
    let type_raw: String = row.get(2)?;
    let record_type = RecordType::from_nsid(&type_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(StorageError::InvalidValue {
                column: "record_type",
                value: type_raw.clone(),
            }),
        )
    })?;
    let payload_raw: String = row.get(4)?;
    let payload = serde_json::from_str(&payload_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(IndexedRecord {
        uri: row.get(0)?,
        actor_id: row.get(1)?,
        record_type,
        record_key: row.get(3)?,
        payload,
        content_hash: row.get(5)?,
        indexed_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

/// Add an actor to the known set. Returns `true` the first time it is seen.
pub(crate) fn register_actor(conn: &Connection, actor_id: &str, now_us: i64) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO known_actors (actor_id, backfill_state, first_seen_at)
         VALUES (?1, 'not_started', ?2)",
        params![actor_id, now_us],
    )?;
    Ok(inserted == 1)
}

pub(crate) fn known_actor(conn: &Connection, actor_id: &str) -> Result<Option<KnownActor>> {
    conn.query_row(
        "SELECT actor_id, backfill_state, first_seen_at, backfilled_at
         FROM known_actors WHERE actor_id = ?1",
        [actor_id],
        |row| {
            let state_raw: String = row.get(1)?;
            let backfill_state = BackfillState::from_db_str(&state_raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(StorageError::InvalidValue {
                        column: "backfill_state",
                        value: state_raw.clone(),
                    }),
                )
            })?;
            Ok(KnownActor {
                actor_id: row.get(0)?,
                backfill_state,
                first_seen_at: row.get(2)?,
                backfilled_at: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Error::from)
}

pub(crate) fn is_backfilled(conn: &Connection, actor_id: &str) -> Result<bool> {
    Ok(known_actor(conn, actor_id)?
        .is_some_and(|actor| actor.backfill_state == BackfillState::Done))
}

/// Set the backfill flag. Once `done` it stays `done`.
pub(crate) fn mark_backfilled(conn: &Connection, actor_id: &str, now_us: i64) -> Result<()> {
    register_actor(conn, actor_id, now_us)?;
    conn.execute(
        "UPDATE known_actors SET backfill_state = ?2, backfilled_at = ?3
         WHERE actor_id = ?1 AND backfill_state != ?2",
        params![actor_id, BackfillState::Done.as_db_str(), now_us],
    )?;
    Ok(())
}

pub(crate) fn load_cursor(conn: &Connection) -> Result<Option<i64>> {
    conn.query_row("SELECT time_us FROM stream_cursor WHERE id = 1", [], |row| {
        row.get(0)
    })
    .optional()
    .map_err(Error::from)
}

pub(crate) fn save_cursor(conn: &Connection, time_us: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO stream_cursor (id, time_us, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
            time_us = MAX(time_us, excluded.time_us),
            updated_at = excluded.updated_at",
        params![time_us, crate::records::now_micros()],
    )?;
    Ok(())
}

pub(crate) fn stats(conn: &Connection) -> Result<IndexStats> {
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or_default())
    };

    let mut records_by_type = BTreeMap::new();
    let mut stmt =
        conn.prepare("SELECT record_type, COUNT(*) FROM records GROUP BY record_type")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (record_type, n) = row?;
        records_by_type.insert(record_type, u64::try_from(n).unwrap_or_default());
    }

    Ok(IndexStats {
        total_records: records_by_type.values().sum(),
        records_by_type,
        known_actors: count("SELECT COUNT(*) FROM known_actors")?,
        backfilled_actors: count("SELECT COUNT(*) FROM known_actors WHERE backfill_state = 'done'")?,
        like_edges: count("SELECT COUNT(*) FROM likes")?,
        comments: count("SELECT COUNT(*) FROM comments")?,
        notifications: count("SELECT COUNT(*) FROM notifications")?,
        cursor: load_cursor(conn)?,
    })
}
