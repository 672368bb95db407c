//! Matching stages evaluated by the [`MatchingPipeline`] in priority order.
//!
//! Each stage looks at one normalized message and either claims it (match or
//! skip) or lets the next stage try. Stages only read the store.

pub mod code_extraction;
pub mod keyword_match;
pub mod learned_patterns;
pub mod matching_pipeline;
pub mod skip_filter;
pub mod thread_inheritance;

use std::cmp::Ordering;

use rusqlite::Connection;

use crate::error::StoreError;
use crate::message::NormalizedMessage;
use crate::types::{MatchCandidate, Pattern, SuggestionSource};

pub use matching_pipeline::{MatchingPipeline, PipelineOutcome};

/// What a stage decided about a message.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Not claimed; try the next stage.
    Continue,
    /// Claimed as noise: no suggestion, log only.
    Skip {
        reason: String,
        pattern_id: Option<String>,
    },
    Match(MatchCandidate),
}

/// Trait for all matching stages
pub trait MatchStage: Send + Sync {
    fn evaluate(
        &self,
        message: &NormalizedMessage,
        conn: &Connection,
    ) -> Result<StageOutcome, StoreError>;
    fn name(&self) -> &str;
    fn priority(&self) -> u8; // Lower number = evaluated first
}

/// Ordering used to pick one pattern among several hits in a stage:
/// highest confidence, then most recently used (never used sorts last),
/// then lowest pattern id.
pub fn tie_break(a: &Pattern, b: &Pattern) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.last_used_at.cmp(&a.last_used_at))
        .then_with(|| a.pattern_id.cmp(&b.pattern_id))
}

pub fn select_best(patterns: Vec<Pattern>) -> Option<Pattern> {
    patterns
        .into_iter()
        .filter(|p| p.is_active)
        .min_by(tie_break)
}

/// Link candidate backed by a learned pattern.
pub(crate) fn pattern_candidate(
    pattern: &Pattern,
    stage: &str,
    rationale: String,
) -> Option<MatchCandidate> {
    let target = pattern.target()?;
    Some(
        MatchCandidate::link(
            target,
            pattern.confidence,
            SuggestionSource::Pattern(pattern.pattern_id.clone()),
            stage,
        )
        .with_rationale(rationale),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};

    use crate::store::{patterns, Database};
    use crate::types::{EntityRef, NewPattern, Pattern, PatternType};

    pub fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    pub fn add_pattern(
        db: &Database,
        pattern_type: PatternType,
        key: &str,
        target: Option<EntityRef>,
        confidence: f64,
    ) -> Pattern {
        db.with_conn(|conn| {
            patterns::insert(conn, NewPattern::new(pattern_type, key, target, confidence))
        })
        .unwrap()
    }

    pub fn set_last_used(db: &Database, pattern_id: &str, at: DateTime<Utc>) {
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE patterns SET last_used_at = ?1 WHERE pattern_id = ?2",
                rusqlite::params![at.to_rfc3339(), pattern_id],
            )
            .map_err(crate::error::StoreError::from)
        })
        .unwrap();
    }
}
