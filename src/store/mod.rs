//! SQLite persistence for patterns, suggestions, the decision log and the
//! slice of business data the handlers touch.

pub mod decision_log;
pub mod entities;
pub mod messages;
pub mod patterns;
pub mod suggestions;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};

use crate::error::StoreError;

pub use decision_log::DecisionLog;
pub use entities::EntityStore;
pub use patterns::{PatternStore, RetryPolicy};
pub use suggestions::SuggestionStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS patterns (
    pattern_id TEXT PRIMARY KEY,
    pattern_type TEXT NOT NULL,
    pattern_key TEXT NOT NULL,
    target_entity_type TEXT NOT NULL,
    target_entity_id TEXT,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    times_used INTEGER NOT NULL DEFAULT 0,
    times_correct INTEGER NOT NULL DEFAULT 0,
    times_rejected INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    version INTEGER NOT NULL DEFAULT 0,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_used_at TEXT,
    CHECK (times_correct + times_rejected <= times_used)
);
CREATE INDEX IF NOT EXISTS idx_patterns_lookup
    ON patterns (pattern_type, pattern_key, is_active);

CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    sender TEXT NOT NULL,
    sender_domain TEXT NOT NULL,
    sender_name TEXT,
    subject TEXT NOT NULL,
    body_excerpt TEXT NOT NULL,
    thread_id TEXT,
    direction TEXT NOT NULL,
    received_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS suggestions (
    suggestion_id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    suggestion_type TEXT NOT NULL,
    target_entity_type TEXT,
    target_entity_id TEXT,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    tier TEXT NOT NULL,
    details TEXT NOT NULL,
    rationale TEXT,
    apply_snapshot TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    decided_at TEXT,
    decided_by TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_suggestions_one_pending
    ON suggestions (message_id, suggestion_type) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_suggestions_status ON suggestions (status, tier);

CREATE TABLE IF NOT EXISTS decision_log (
    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
    suggestion_id TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    actor TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    rationale TEXT
);
CREATE INDEX IF NOT EXISTS idx_decision_log_suggestion ON decision_log (suggestion_id);
CREATE TRIGGER IF NOT EXISTS decision_log_no_update BEFORE UPDATE ON decision_log
BEGIN
    SELECT RAISE(ABORT, 'decision log is append-only');
END;
CREATE TRIGGER IF NOT EXISTS decision_log_no_delete BEFORE DELETE ON decision_log
BEGIN
    SELECT RAISE(ABORT, 'decision log is append-only');
END;

CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    code TEXT,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_code ON entities (code) WHERE code IS NOT NULL;

CREATE TABLE IF NOT EXISTS message_links (
    message_id TEXT PRIMARY KEY,
    thread_id TEXT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    received_at TEXT NOT NULL,
    linked_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_message_links_thread ON message_links (thread_id);

CREATE TABLE IF NOT EXISTS contacts (
    contact_id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    name TEXT,
    entity_type TEXT,
    entity_id TEXT,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_email ON contacts (email);

CREATE TABLE IF NOT EXISTS deadlines (
    deadline_id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    due_date TEXT NOT NULL,
    description TEXT NOT NULL,
    source_message_id TEXT,
    created_at TEXT NOT NULL
);
"#;

/// Shared handle to the engine database. Cloning shares the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    /// Must not be re-entered from inside `f`.
    pub fn with_conn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    /// Run `f` inside a transaction; it commits only if `f` returns `Ok`.
    pub fn with_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}

pub(crate) fn to_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow(format!("bad timestamp '{value}': {e}")))
}

pub(crate) fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}

/// Clamp into [0, 1]; NaN collapses to 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
