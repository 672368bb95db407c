//! Suggestion Engine: turns a candidate into a suggestion while keeping at
//! most one pending suggestion per (message, kind).

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{clamp_confidence, decision_log, suggestions, Database};
use crate::types::{MatchCandidate, Suggestion, SuggestionStatus, SuggestionType, Tier};

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// A pending suggestion with equal or higher confidence already exists.
    NotBetter,
    /// The message already has this change applied.
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Created(Suggestion),
    /// The existing pending suggestion was replaced in place.
    Upgraded(Suggestion),
    Discarded {
        existing_id: String,
        reason: DiscardReason,
    },
}

impl SubmitOutcome {
    /// The suggestion that now represents the candidate, if any.
    pub fn suggestion(&self) -> Option<&Suggestion> {
        match self {
            SubmitOutcome::Created(s) | SubmitOutcome::Upgraded(s) => Some(s),
            SubmitOutcome::Discarded { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct SuggestionEngine {
    db: Database,
}

impl SuggestionEngine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Lookup and write happen in one transaction under the store lock.
    pub fn submit(
        &self,
        message_id: &str,
        candidate: &MatchCandidate,
        tier: Tier,
    ) -> Result<SubmitOutcome, StoreError> {
        self.db
            .with_tx(|tx| submit_in(tx, message_id, candidate, tier))
    }
}

pub(crate) fn submit_in(
    conn: &Connection,
    message_id: &str,
    candidate: &MatchCandidate,
    tier: Tier,
) -> Result<SubmitOutcome, StoreError> {
    let mut candidate = candidate.clone();
    candidate.confidence = clamp_confidence(candidate.confidence);

    let applied = suggestions::find_with_status(
        conn,
        message_id,
        candidate.suggestion_type,
        SuggestionStatus::Applied,
    )?;
    // A message links to one entity; only a rollback reopens an applied link.
    let one_per_message = candidate.suggestion_type == SuggestionType::LinkMessage;
    if let Some(done) = applied
        .iter()
        .find(|s| one_per_message || s.target == candidate.target)
    {
        log::debug!(
            "Message {} already has {} applied as {}, dropping candidate",
            message_id,
            candidate.suggestion_type,
            done.suggestion_id
        );
        return Ok(SubmitOutcome::Discarded {
            existing_id: done.suggestion_id.clone(),
            reason: DiscardReason::AlreadyApplied,
        });
    }

    if let Some(existing) = suggestions::find_pending(conn, message_id, candidate.suggestion_type)? {
        if candidate.confidence > existing.confidence {
            suggestions::replace_candidate(conn, &existing.suggestion_id, &candidate, tier)?;
            log::info!(
                "Upgraded suggestion {} from {:.2} to {:.2} ({})",
                existing.suggestion_id,
                existing.confidence,
                candidate.confidence,
                candidate.source
            );
            let upgraded = suggestions::get(conn, &existing.suggestion_id)?
                .ok_or_else(|| StoreError::InvalidRow(format!("suggestion {} vanished", existing.suggestion_id)))?;
            return Ok(SubmitOutcome::Upgraded(upgraded));
        }
        log::debug!(
            "Keeping suggestion {} ({:.2}) over incoming {:.2}",
            existing.suggestion_id,
            existing.confidence,
            candidate.confidence
        );
        return Ok(SubmitOutcome::Discarded {
            existing_id: existing.suggestion_id,
            reason: DiscardReason::NotBetter,
        });
    }

    let now = Utc::now();
    let suggestion = Suggestion {
        suggestion_id: Uuid::new_v4().to_string(),
        message_id: message_id.to_string(),
        suggestion_type: candidate.suggestion_type,
        target: candidate.target,
        confidence: candidate.confidence,
        source: candidate.source,
        status: SuggestionStatus::Pending,
        tier,
        details: candidate.details,
        rationale: candidate.rationale,
        apply_snapshot: None,
        created_at: now,
        updated_at: now,
        decided_at: None,
        decided_by: None,
    };
    suggestions::insert(conn, &suggestion)?;
    decision_log::append(
        conn,
        &suggestion.suggestion_id,
        None,
        SuggestionStatus::Pending,
        SYSTEM_ACTOR,
        suggestion.rationale.as_deref(),
    )?;
    log::info!(
        "Created suggestion {} for message {} -> {:?} ({:.2}, {})",
        suggestion.suggestion_id,
        message_id,
        suggestion.target.as_ref().map(|t| t.to_string()),
        suggestion.confidence,
        tier
    );
    Ok(SubmitOutcome::Created(suggestion))
}
