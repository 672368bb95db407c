//! Pattern Store: the single owner of learned matching rules.
//!
//! Readers go straight to the table. Every write is a compare-and-swap on the
//! row's `version` column, retried with exponential backoff when another
//! writer got there first.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{clamp_confidence, parse_opt_ts, parse_ts, to_ts, Database};
use crate::config::LearningConfig;
use crate::error::StoreError;
use crate::types::{EntityRef, EntityType, NewPattern, Pattern, PatternType};

const COLUMNS: &str = "pattern_id, pattern_type, pattern_key, target_entity_type, target_entity_id, \
     confidence, times_used, times_correct, times_rejected, is_active, version, notes, \
     created_at, updated_at, last_used_at";

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LearningConfig) -> Self {
        Self {
            max_attempts: config.write_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.write_retry_base_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at 64x the base.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.min(6))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LearningConfig::default())
    }
}

#[derive(Clone)]
pub struct PatternStore {
    db: Database,
    retry: RetryPolicy,
}

impl PatternStore {
    pub fn new(db: Database, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub fn create(&self, new: NewPattern) -> Result<Pattern, StoreError> {
        self.db.with_conn(|conn| insert(conn, new))
    }

    pub fn get(&self, pattern_id: &str) -> Result<Option<Pattern>, StoreError> {
        self.db.with_conn(|conn| get(conn, pattern_id))
    }

    pub fn list(&self, include_inactive: bool) -> Result<Vec<Pattern>, StoreError> {
        self.db.with_conn(|conn| list(conn, include_inactive))
    }

    pub fn find_active(
        &self,
        pattern_type: PatternType,
        key: &str,
    ) -> Result<Vec<Pattern>, StoreError> {
        self.db.with_conn(|conn| find_active(conn, pattern_type, key))
    }

    /// Active pattern of `pattern_type`/`key` that already points at `target`.
    pub fn find_active_for_target(
        &self,
        pattern_type: PatternType,
        key: &str,
        target: &EntityRef,
    ) -> Result<Option<Pattern>, StoreError> {
        let candidates = self.find_active(pattern_type, key)?;
        Ok(candidates
            .into_iter()
            .find(|p| p.target().as_ref() == Some(target)))
    }

    /// Read-modify-write `pattern_id` through `mutate`, retrying on version
    /// conflicts. Confidence is clamped into [0, 1] before every write.
    ///
    /// Backoff sleeps the calling thread, so async paths use
    /// [`PatternStore::touch`] instead.
    pub fn update_with<F>(&self, pattern_id: &str, mut mutate: F) -> Result<Pattern, StoreError>
    where
        F: FnMut(&mut Pattern),
    {
        for attempt in 0..self.retry.max_attempts {
            if let Some(updated) = self.try_update(pattern_id, &mut mutate)? {
                return Ok(updated);
            }

            log::debug!(
                "Pattern {} changed underneath us (attempt {}), retrying",
                pattern_id,
                attempt + 1
            );
            if attempt + 1 < self.retry.max_attempts {
                std::thread::sleep(self.retry.backoff(attempt));
            }
        }

        log::warn!(
            "Giving up on pattern {} after {} conflicting writes",
            pattern_id,
            self.retry.max_attempts
        );
        Err(StoreError::PatternWriteConflict {
            pattern_id: pattern_id.to_string(),
            attempts: self.retry.max_attempts,
        })
    }

    /// One compare-and-swap attempt. `None` when another writer won.
    fn try_update<F>(&self, pattern_id: &str, mutate: &mut F) -> Result<Option<Pattern>, StoreError>
    where
        F: FnMut(&mut Pattern),
    {
        let current = self
            .get(pattern_id)?
            .ok_or_else(|| StoreError::PatternNotFound(pattern_id.to_string()))?;

        let mut next = current.clone();
        mutate(&mut next);
        next.pattern_id = current.pattern_id.clone();
        next.confidence = clamp_confidence(next.confidence);
        next.updated_at = Utc::now();

        let swapped = self
            .db
            .with_conn(|conn| compare_and_swap(conn, &next, current.version))?;
        if swapped {
            next.version = current.version + 1;
            Ok(Some(next))
        } else {
            Ok(None)
        }
    }

    /// Retire a pattern. It stays in the table for audit.
    pub fn deactivate(&self, pattern_id: &str) -> Result<Pattern, StoreError> {
        self.update_with(pattern_id, |p| p.is_active = false)
    }

    pub fn set_confidence(&self, pattern_id: &str, confidence: f64) -> Result<Pattern, StoreError> {
        self.update_with(pattern_id, |p| p.confidence = confidence)
    }

    pub fn annotate(&self, pattern_id: &str, notes: &str) -> Result<Pattern, StoreError> {
        let notes = notes.trim().to_string();
        self.update_with(pattern_id, |p| {
            p.notes = if notes.is_empty() {
                None
            } else {
                Some(notes.clone())
            }
        })
    }

    /// Record that a pattern drove an applied change without a human verdict.
    /// Single attempt, no backoff: `None` means a concurrent writer won and
    /// this use went unrecorded.
    pub fn touch(&self, pattern_id: &str) -> Result<Option<Pattern>, StoreError> {
        let now = Utc::now();
        self.try_update(pattern_id, &mut |p: &mut Pattern| p.last_used_at = Some(now))
    }
}

/// Normalize a pattern key the way the pipeline normalizes message fields.
pub fn normalize_key(pattern_type: PatternType, key: &str) -> String {
    let key = key.trim();
    match pattern_type {
        PatternType::DomainEntity | PatternType::DomainSkip => {
            crate::domain_utils::DomainUtils::canonicalize_domain(key)
        }
        PatternType::KeywordEntity => key
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
        PatternType::ThreadEntity | PatternType::EntityRedirect => key.to_string(),
        PatternType::SenderEntity | PatternType::SenderSkip => key.to_lowercase(),
    }
}

pub(crate) fn insert(conn: &Connection, new: NewPattern) -> Result<Pattern, StoreError> {
    let key = normalize_key(new.pattern_type, &new.pattern_key);
    if key.is_empty() {
        return Err(StoreError::InvalidRow("pattern key must not be empty".to_string()));
    }

    let (target_entity_type, target_entity_id) = match (new.pattern_type.is_skip(), new.target) {
        (true, _) => (EntityType::Skip, None),
        (false, Some(target)) if target.entity_type != EntityType::Skip => {
            (target.entity_type, Some(target.entity_id))
        }
        (false, _) => {
            return Err(StoreError::InvalidRow(format!(
                "{} pattern requires a project or proposal target",
                new.pattern_type
            )))
        }
    };

    if new.times_correct > new.times_used {
        return Err(StoreError::InvalidRow(
            "times_correct cannot exceed times_used".to_string(),
        ));
    }

    let now = Utc::now();
    let pattern = Pattern {
        pattern_id: Uuid::new_v4().to_string(),
        pattern_type: new.pattern_type,
        pattern_key: key,
        target_entity_type,
        target_entity_id,
        confidence: clamp_confidence(new.confidence),
        times_used: new.times_used,
        times_correct: new.times_correct,
        times_rejected: 0,
        is_active: true,
        version: 0,
        notes: new.notes,
        created_at: now,
        updated_at: now,
        last_used_at: if new.times_used > 0 { Some(now) } else { None },
    };

    conn.execute(
        &format!("INSERT INTO patterns ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
        params![
            pattern.pattern_id,
            pattern.pattern_type.as_str(),
            pattern.pattern_key,
            pattern.target_entity_type.as_str(),
            pattern.target_entity_id,
            pattern.confidence,
            pattern.times_used,
            pattern.times_correct,
            pattern.times_rejected,
            pattern.is_active,
            pattern.version,
            pattern.notes,
            to_ts(&pattern.created_at),
            to_ts(&pattern.updated_at),
            pattern.last_used_at.as_ref().map(to_ts),
        ],
    )?;

    Ok(pattern)
}

pub(crate) fn get(conn: &Connection, pattern_id: &str) -> Result<Option<Pattern>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM patterns WHERE pattern_id = ?1"),
            params![pattern_id],
            RawPattern::from_row,
        )
        .optional()?;
    raw.map(RawPattern::into_pattern).transpose()
}

pub(crate) fn list(conn: &Connection, include_inactive: bool) -> Result<Vec<Pattern>, StoreError> {
    let sql = if include_inactive {
        format!("SELECT {COLUMNS} FROM patterns ORDER BY pattern_type, pattern_key, created_at")
    } else {
        format!("SELECT {COLUMNS} FROM patterns WHERE is_active = 1 ORDER BY pattern_type, pattern_key, created_at")
    };
    collect(conn, &sql, [])
}

/// Active rows of one type and key. Read-only; safe for concurrent matching.
pub(crate) fn find_active(
    conn: &Connection,
    pattern_type: PatternType,
    key: &str,
) -> Result<Vec<Pattern>, StoreError> {
    collect(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM patterns WHERE pattern_type = ?1 AND pattern_key = ?2 AND is_active = 1"
        ),
        params![pattern_type.as_str(), key],
    )
}

pub(crate) fn all_active_of_type(
    conn: &Connection,
    pattern_type: PatternType,
) -> Result<Vec<Pattern>, StoreError> {
    collect(
        conn,
        &format!("SELECT {COLUMNS} FROM patterns WHERE pattern_type = ?1 AND is_active = 1"),
        params![pattern_type.as_str()],
    )
}

/// Write `next` only if the row is still at `expected_version`.
fn compare_and_swap(
    conn: &Connection,
    next: &Pattern,
    expected_version: i64,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE patterns SET
            confidence = ?1, times_used = ?2, times_correct = ?3, times_rejected = ?4,
            is_active = ?5, notes = ?6, updated_at = ?7, last_used_at = ?8,
            version = version + 1
         WHERE pattern_id = ?9 AND version = ?10",
        params![
            next.confidence,
            next.times_used,
            next.times_correct,
            next.times_rejected,
            next.is_active,
            next.notes,
            to_ts(&next.updated_at),
            next.last_used_at.as_ref().map(to_ts),
            next.pattern_id,
            expected_version,
        ],
    )?;
    Ok(changed == 1)
}

fn collect<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Pattern>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params, RawPattern::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawPattern::into_pattern).collect()
}

/// Column values as stored, before enum and timestamp parsing.
struct RawPattern {
    pattern_id: String,
    pattern_type: String,
    pattern_key: String,
    target_entity_type: String,
    target_entity_id: Option<String>,
    confidence: f64,
    times_used: u32,
    times_correct: u32,
    times_rejected: u32,
    is_active: bool,
    version: i64,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
    last_used_at: Option<String>,
}

impl RawPattern {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pattern_id: row.get(0)?,
            pattern_type: row.get(1)?,
            pattern_key: row.get(2)?,
            target_entity_type: row.get(3)?,
            target_entity_id: row.get(4)?,
            confidence: row.get(5)?,
            times_used: row.get(6)?,
            times_correct: row.get(7)?,
            times_rejected: row.get(8)?,
            is_active: row.get(9)?,
            version: row.get(10)?,
            notes: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            last_used_at: row.get(14)?,
        })
    }

    fn into_pattern(self) -> Result<Pattern, StoreError> {
        Ok(Pattern {
            pattern_id: self.pattern_id,
            pattern_type: self.pattern_type.parse()?,
            pattern_key: self.pattern_key,
            target_entity_type: self.target_entity_type.parse()?,
            target_entity_id: self.target_entity_id,
            confidence: self.confidence,
            times_used: self.times_used,
            times_correct: self.times_correct,
            times_rejected: self.times_rejected,
            is_active: self.is_active,
            version: self.version,
            notes: self.notes,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_used_at: parse_opt_ts(self.last_used_at)?,
        })
    }
}
