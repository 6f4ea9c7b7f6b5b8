/// Canonical persistence for calls, segments, conversations, alerts,
/// rules, and the geocode cache.
///
/// A single rusqlite connection behind a sync mutex; writers are short
/// and serialized. Per-call async locks serialize multi-step
/// read-modify-write sequences (the linker) after a call's first
/// terminal write.
pub mod alerts;
pub mod calls;
pub mod geocache;
pub mod hospital;
pub mod segments;
pub mod units;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct CallStore {
    conn: Mutex<Connection>,
    call_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl CallStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            call_locks: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }

    /// Per-call lock handed to components that do read-modify-write
    /// sequences on an already-written call.
    pub fn call_lock(&self, call_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.call_locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(call_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

pub(crate) fn to_epoch_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audio_segments (
    id            TEXT PRIMARY KEY,
    blob_path     TEXT NOT NULL DEFAULT '',
    content_type  TEXT NOT NULL DEFAULT 'audio/wav',
    duration_ms   INTEGER,
    sample_rate   INTEGER,
    channels      INTEGER,
    talkgroup     TEXT NOT NULL,
    system        TEXT NOT NULL,
    captured_at   INTEGER NOT NULL,
    processed     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS calls (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    audio_segment_id TEXT NOT NULL,
    timestamp        INTEGER NOT NULL,
    talkgroup        TEXT NOT NULL,
    system           TEXT NOT NULL,
    frequency_hz     REAL,
    duration_ms      INTEGER,
    transcript       TEXT NOT NULL DEFAULT '',
    confidence       REAL NOT NULL DEFAULT 0,
    call_type        TEXT NOT NULL,
    location         TEXT,
    latitude         REAL,
    longitude        REAL,
    keywords         TEXT NOT NULL DEFAULT '[]',
    acuity           TEXT NOT NULL DEFAULT 'unknown',
    urgency_score    REAL NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'active',
    metadata         TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_calls_timestamp ON calls (timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_calls_talkgroup_ts ON calls (talkgroup, timestamp);
CREATE INDEX IF NOT EXISTS idx_calls_type_ts ON calls (call_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_calls_coords ON calls (latitude, longitude);

CREATE TABLE IF NOT EXISTS unit_tags (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    unit_type    TEXT NOT NULL,
    unit_number  INTEGER NOT NULL,
    display_name TEXT NOT NULL,
    color        TEXT NOT NULL,
    active       INTEGER NOT NULL DEFAULT 1,
    UNIQUE (unit_type, unit_number)
);

CREATE TABLE IF NOT EXISTS call_units (
    call_id     INTEGER NOT NULL,
    unit_tag_id INTEGER NOT NULL,
    PRIMARY KEY (call_id, unit_tag_id)
);

CREATE TABLE IF NOT EXISTS hospital_conversations (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id  TEXT NOT NULL UNIQUE,
    talkgroup        TEXT NOT NULL,
    hospital_name    TEXT NOT NULL DEFAULT '',
    status           TEXT NOT NULL DEFAULT 'active',
    first_segment_at INTEGER NOT NULL,
    last_segment_at  INTEGER NOT NULL,
    sor_detected     INTEGER NOT NULL DEFAULT 0,
    sor_physician    TEXT
);

CREATE TABLE IF NOT EXISTS hospital_segments (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id  TEXT NOT NULL,
    sequence_number  INTEGER NOT NULL,
    audio_segment_id TEXT NOT NULL,
    transcript       TEXT NOT NULL DEFAULT '',
    confidence       REAL NOT NULL DEFAULT 0,
    timestamp        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_hospital_segments_conv
    ON hospital_segments (conversation_id, sequence_number);

CREATE TABLE IF NOT EXISTS alerts (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_type       TEXT NOT NULL,
    severity         TEXT NOT NULL,
    category         TEXT NOT NULL DEFAULT '',
    title            TEXT NOT NULL,
    message          TEXT NOT NULL,
    related_call_id  INTEGER,
    related_data     TEXT NOT NULL DEFAULT 'null',
    created_at       INTEGER NOT NULL,
    expires_at       INTEGER,
    acknowledged     INTEGER NOT NULL DEFAULT 0,
    read             INTEGER NOT NULL DEFAULT 0,
    sound_enabled    INTEGER NOT NULL DEFAULT 0,
    visual_highlight INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts (created_at DESC);

CREATE TABLE IF NOT EXISTS alert_rules (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    spec          TEXT NOT NULL,
    actions       TEXT NOT NULL,
    priority      INTEGER NOT NULL DEFAULT 0,
    active        INTEGER NOT NULL DEFAULT 1,
    trigger_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS geocode_cache (
    address_key TEXT PRIMARY KEY,
    latitude    REAL,
    longitude   REAL,
    formatted   TEXT,
    found       INTEGER NOT NULL,
    cached_at   INTEGER NOT NULL,
    ttl_seconds INTEGER NOT NULL
);
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_initializes_schema() {
        let store = CallStore::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let n: i64 = conn
                    .query_row("SELECT COUNT(*) FROM calls", [], |row| row.get(0))
                    .map_err(StoreError::from)?;
                assert_eq!(n, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CallStore::open(&dir.path().join("calls.db")).unwrap();
        drop(store);
        // Reopening an existing database is fine.
        CallStore::open(&dir.path().join("calls.db")).unwrap();
    }

    #[test]
    fn test_call_lock_is_stable_per_id() {
        let store = CallStore::open_in_memory().unwrap();
        let a = store.call_lock(7);
        let b = store.call_lock(7);
        assert!(Arc::ptr_eq(&a, &b));
        let c = store.call_lock(8);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
