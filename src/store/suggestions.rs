//! Suggestion rows. Status changes are conditional updates on the expected
//! current status, so of two racing decisions exactly one lands.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_opt_ts, parse_ts, to_ts, Database};
use crate::error::StoreError;
use crate::types::{
    EntityRef, MatchCandidate, Suggestion, SuggestionStatus, SuggestionType, Tier,
};

const COLUMNS: &str = "suggestion_id, message_id, suggestion_type, target_entity_type, target_entity_id, \
     confidence, source, status, tier, details, rationale, apply_snapshot, \
     created_at, updated_at, decided_at, decided_by";

/// Read access to suggestions for operator tooling.
#[derive(Clone)]
pub struct SuggestionStore {
    db: Database,
}

impl SuggestionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, suggestion_id: &str) -> Result<Option<Suggestion>, StoreError> {
        self.db.with_conn(|conn| get(conn, suggestion_id))
    }

    pub fn list_by_status(&self, status: SuggestionStatus) -> Result<Vec<Suggestion>, StoreError> {
        self.db.with_conn(|conn| list_by_status(conn, status))
    }

    pub fn for_message(&self, message_id: &str) -> Result<Vec<Suggestion>, StoreError> {
        self.db.with_conn(|conn| for_message(conn, message_id))
    }
}

/// Decision stamp applied alongside a status change.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Stamp<'a> {
    Keep,
    Decided(&'a str),
    Clear,
}

pub(crate) fn get(conn: &Connection, suggestion_id: &str) -> Result<Option<Suggestion>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM suggestions WHERE suggestion_id = ?1"),
            params![suggestion_id],
            RawSuggestion::from_row,
        )
        .optional()?;
    raw.map(RawSuggestion::into_suggestion).transpose()
}

pub(crate) fn find_pending(
    conn: &Connection,
    message_id: &str,
    suggestion_type: SuggestionType,
) -> Result<Option<Suggestion>, StoreError> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM suggestions
                 WHERE message_id = ?1 AND suggestion_type = ?2 AND status = 'pending'"
            ),
            params![message_id, suggestion_type.as_str()],
            RawSuggestion::from_row,
        )
        .optional()?;
    raw.map(RawSuggestion::into_suggestion).transpose()
}

pub(crate) fn find_with_status(
    conn: &Connection,
    message_id: &str,
    suggestion_type: SuggestionType,
    status: SuggestionStatus,
) -> Result<Vec<Suggestion>, StoreError> {
    collect(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM suggestions
             WHERE message_id = ?1 AND suggestion_type = ?2 AND status = ?3
             ORDER BY created_at"
        ),
        params![message_id, suggestion_type.as_str(), status.as_str()],
    )
}

pub(crate) fn for_message(conn: &Connection, message_id: &str) -> Result<Vec<Suggestion>, StoreError> {
    collect(
        conn,
        &format!("SELECT {COLUMNS} FROM suggestions WHERE message_id = ?1 ORDER BY created_at"),
        params![message_id],
    )
}

pub(crate) fn list_by_status(
    conn: &Connection,
    status: SuggestionStatus,
) -> Result<Vec<Suggestion>, StoreError> {
    collect(
        conn,
        &format!("SELECT {COLUMNS} FROM suggestions WHERE status = ?1 ORDER BY created_at, suggestion_id"),
        params![status.as_str()],
    )
}

/// Pending suggestions routed to a review tier, oldest first.
pub(crate) fn list_reviewable(conn: &Connection) -> Result<Vec<Suggestion>, StoreError> {
    collect(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM suggestions
             WHERE status = 'pending' AND tier IN ('batch_review', 'individual_review')
             ORDER BY created_at, suggestion_id"
        ),
        [],
    )
}

pub(crate) fn insert(conn: &Connection, suggestion: &Suggestion) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO suggestions ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            suggestion.suggestion_id,
            suggestion.message_id,
            suggestion.suggestion_type.as_str(),
            suggestion.target.as_ref().map(|t| t.entity_type.as_str()),
            suggestion.target.as_ref().map(|t| t.entity_id.as_str()),
            suggestion.confidence,
            suggestion.source.to_string(),
            suggestion.status.as_str(),
            suggestion.tier.as_str(),
            serde_json::to_string(&suggestion.details)?,
            suggestion.rationale,
            suggestion
                .apply_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            to_ts(&suggestion.created_at),
            to_ts(&suggestion.updated_at),
            suggestion.decided_at.as_ref().map(to_ts),
            suggestion.decided_by,
        ],
    )?;
    Ok(())
}

/// Replace the candidate fields of a still-pending suggestion in place.
pub(crate) fn replace_candidate(
    conn: &Connection,
    suggestion_id: &str,
    candidate: &MatchCandidate,
    tier: Tier,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE suggestions SET
            target_entity_type = ?1, target_entity_id = ?2, confidence = ?3, source = ?4,
            tier = ?5, details = ?6, rationale = ?7, updated_at = ?8
         WHERE suggestion_id = ?9 AND status = 'pending'",
        params![
            candidate.target.as_ref().map(|t| t.entity_type.as_str()),
            candidate.target.as_ref().map(|t| t.entity_id.as_str()),
            candidate.confidence,
            candidate.source.to_string(),
            tier.as_str(),
            serde_json::to_string(&candidate.details)?,
            candidate.rationale,
            to_ts(&Utc::now()),
            suggestion_id,
        ],
    )?;
    Ok(changed == 1)
}

/// Move `suggestion_id` from `from` to `to`. Returns false when the row is no
/// longer in `from` (someone else decided first).
pub(crate) fn transition(
    conn: &Connection,
    suggestion_id: &str,
    from: SuggestionStatus,
    to: SuggestionStatus,
    stamp: Stamp<'_>,
) -> Result<bool, StoreError> {
    let now = to_ts(&Utc::now());
    let changed = match stamp {
        Stamp::Keep => conn.execute(
            "UPDATE suggestions SET status = ?1, updated_at = ?2
             WHERE suggestion_id = ?3 AND status = ?4",
            params![to.as_str(), now, suggestion_id, from.as_str()],
        )?,
        Stamp::Decided(actor) => conn.execute(
            "UPDATE suggestions SET status = ?1, updated_at = ?2, decided_at = ?2, decided_by = ?3
             WHERE suggestion_id = ?4 AND status = ?5",
            params![to.as_str(), now, actor, suggestion_id, from.as_str()],
        )?,
        Stamp::Clear => conn.execute(
            "UPDATE suggestions SET status = ?1, updated_at = ?2, decided_at = NULL, decided_by = NULL
             WHERE suggestion_id = ?3 AND status = ?4",
            params![to.as_str(), now, suggestion_id, from.as_str()],
        )?,
    };
    Ok(changed == 1)
}

pub(crate) fn current_status(
    conn: &Connection,
    suggestion_id: &str,
) -> Result<Option<SuggestionStatus>, StoreError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM suggestions WHERE suggestion_id = ?1",
            params![suggestion_id],
            |row| row.get(0),
        )
        .optional()?;
    status.map(|s| s.parse()).transpose()
}

pub(crate) fn set_snapshot(
    conn: &Connection,
    suggestion_id: &str,
    snapshot: Option<&serde_json::Value>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE suggestions SET apply_snapshot = ?1, updated_at = ?2 WHERE suggestion_id = ?3",
        params![
            snapshot.map(serde_json::to_string).transpose()?,
            to_ts(&Utc::now()),
            suggestion_id
        ],
    )?;
    Ok(())
}

pub(crate) fn set_target(
    conn: &Connection,
    suggestion_id: &str,
    target: &EntityRef,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE suggestions SET target_entity_type = ?1, target_entity_id = ?2, updated_at = ?3
         WHERE suggestion_id = ?4",
        params![
            target.entity_type.as_str(),
            target.entity_id,
            to_ts(&Utc::now()),
            suggestion_id
        ],
    )?;
    Ok(())
}

pub(crate) fn set_tier(conn: &Connection, suggestion_id: &str, tier: Tier) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE suggestions SET tier = ?1, updated_at = ?2 WHERE suggestion_id = ?3",
        params![tier.as_str(), to_ts(&Utc::now()), suggestion_id],
    )?;
    Ok(())
}

fn collect<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Suggestion>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params, RawSuggestion::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawSuggestion::into_suggestion).collect()
}

struct RawSuggestion {
    suggestion_id: String,
    message_id: String,
    suggestion_type: String,
    target_entity_type: Option<String>,
    target_entity_id: Option<String>,
    confidence: f64,
    source: String,
    status: String,
    tier: String,
    details: String,
    rationale: Option<String>,
    apply_snapshot: Option<String>,
    created_at: String,
    updated_at: String,
    decided_at: Option<String>,
    decided_by: Option<String>,
}

impl RawSuggestion {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            suggestion_id: row.get(0)?,
            message_id: row.get(1)?,
            suggestion_type: row.get(2)?,
            target_entity_type: row.get(3)?,
            target_entity_id: row.get(4)?,
            confidence: row.get(5)?,
            source: row.get(6)?,
            status: row.get(7)?,
            tier: row.get(8)?,
            details: row.get(9)?,
            rationale: row.get(10)?,
            apply_snapshot: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            decided_at: row.get(14)?,
            decided_by: row.get(15)?,
        })
    }

    fn into_suggestion(self) -> Result<Suggestion, StoreError> {
        let target = match (self.target_entity_type, self.target_entity_id) {
            (Some(kind), Some(id)) => Some(EntityRef::new(kind.parse()?, id)),
            _ => None,
        };
        let created_at: DateTime<Utc> = parse_ts(&self.created_at)?;
        Ok(Suggestion {
            suggestion_id: self.suggestion_id,
            message_id: self.message_id,
            suggestion_type: self.suggestion_type.parse()?,
            target,
            confidence: self.confidence,
            source: self.source.parse()?,
            status: self.status.parse()?,
            tier: self.tier.parse()?,
            details: serde_json::from_str(&self.details)?,
            rationale: self.rationale,
            apply_snapshot: self
                .apply_snapshot
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at,
            updated_at: parse_ts(&self.updated_at)?,
            decided_at: parse_opt_ts(self.decided_at)?,
            decided_by: self.decided_by,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SuggestionSource;

    fn pending(id: &str, message_id: &str) -> Suggestion {
        let now = Utc::now();
        Suggestion {
            suggestion_id: id.to_string(),
            message_id: message_id.to_string(),
            suggestion_type: SuggestionType::LinkMessage,
            target: Some(EntityRef::project("p1")),
            confidence: 0.6,
            source: SuggestionSource::Pattern("pat-1".to_string()),
            status: SuggestionStatus::Pending,
            tier: Tier::IndividualReview,
            details: serde_json::Value::Null,
            rationale: None,
            apply_snapshot: None,
            created_at: now,
            updated_at: now,
            decided_at: None,
            decided_by: None,
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &pending("s1", "m1"))?;
            let loaded = get(conn, "s1")?.unwrap();
            assert_eq!(loaded.target, Some(EntityRef::project("p1")));
            assert_eq!(loaded.source, SuggestionSource::Pattern("pat-1".to_string()));
            assert_eq!(loaded.tier, Tier::IndividualReview);
            assert!(find_pending(conn, "m1", SuggestionType::LinkMessage)?.is_some());
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_second_pending_row_violates_index() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &pending("s1", "m1"))?;
            assert!(insert(conn, &pending("s2", "m1")).is_err());
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_transition_is_conditional() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &pending("s1", "m1"))?;
            assert!(transition(
                conn,
                "s1",
                SuggestionStatus::Pending,
                SuggestionStatus::Rejected,
                Stamp::Decided("alice"),
            )?);
            assert!(!transition(
                conn,
                "s1",
                SuggestionStatus::Pending,
                SuggestionStatus::Approved,
                Stamp::Decided("bob"),
            )?);
            let loaded = get(conn, "s1")?.unwrap();
            assert_eq!(loaded.status, SuggestionStatus::Rejected);
            assert_eq!(loaded.decided_by.as_deref(), Some("alice"));
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn test_reviewable_excludes_log_only() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert(conn, &pending("s1", "m1"))?;
            let mut quiet = pending("s2", "m2");
            quiet.tier = Tier::LogOnly;
            insert(conn, &quiet)?;
            let reviewable = list_reviewable(conn)?;
            assert_eq!(reviewable.len(), 1);
            assert_eq!(reviewable[0].suggestion_id, "s1");
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }
}
