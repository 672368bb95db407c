//! Append-only audit trail of suggestion status changes.
//! The table rejects UPDATE and DELETE at the SQLite level.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use super::{parse_ts, to_ts, Database};
use crate::error::StoreError;
use crate::types::{DecisionLogEntry, SuggestionStatus};

const COLUMNS: &str = "entry_id, suggestion_id, from_status, to_status, actor, timestamp, rationale";

#[derive(Clone)]
pub struct DecisionLog {
    db: Database,
}

impl DecisionLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Full history of one suggestion, oldest first.
    pub fn history(&self, suggestion_id: &str) -> Result<Vec<DecisionLogEntry>, StoreError> {
        self.db.with_conn(|conn| entries_for(conn, suggestion_id))
    }

    /// The most recent `limit` entries across all suggestions, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<DecisionLogEntry>, StoreError> {
        self.db.with_conn(|conn| recent(conn, limit))
    }
}

pub(crate) fn append(
    conn: &Connection,
    suggestion_id: &str,
    from: Option<SuggestionStatus>,
    to: SuggestionStatus,
    actor: &str,
    rationale: Option<&str>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO decision_log (suggestion_id, from_status, to_status, actor, timestamp, rationale)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            suggestion_id,
            from.map(|s| s.as_str()),
            to.as_str(),
            actor,
            to_ts(&Utc::now()),
            rationale,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn entries_for(
    conn: &Connection,
    suggestion_id: &str,
) -> Result<Vec<DecisionLogEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM decision_log WHERE suggestion_id = ?1 ORDER BY entry_id"
    ))?;
    let rows = stmt
        .query_map(params![suggestion_id], raw_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_entry).collect()
}

pub(crate) fn recent(conn: &Connection, limit: usize) -> Result<Vec<DecisionLogEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM decision_log ORDER BY entry_id DESC LIMIT ?1"
    ))?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(params![limit], raw_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(into_entry).collect()
}

type RawEntry = (i64, String, Option<String>, String, String, String, Option<String>);

fn raw_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_entry(raw: RawEntry) -> Result<DecisionLogEntry, StoreError> {
    let (entry_id, suggestion_id, from_status, to_status, actor, timestamp, rationale) = raw;
    Ok(DecisionLogEntry {
        entry_id,
        suggestion_id,
        from_status: from_status.map(|s| s.parse()).transpose()?,
        to_status: to_status.parse()?,
        actor,
        timestamp: parse_ts(&timestamp)?,
        rationale,
    })
}
