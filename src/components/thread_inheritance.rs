//! Thread Inheritance Component
//!
//! A reply in a thread that is already linked goes where the thread went.

use rusqlite::Connection;

use crate::components::{pattern_candidate, select_best, MatchStage, StageOutcome};
use crate::error::StoreError;
use crate::message::NormalizedMessage;
use crate::store::{entities, patterns};
use crate::types::{MatchCandidate, PatternType, SuggestionSource};

pub struct ThreadInheritance {
    confidence: f64,
}

impl ThreadInheritance {
    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl MatchStage for ThreadInheritance {
    fn evaluate(
        &self,
        message: &NormalizedMessage,
        conn: &Connection,
    ) -> Result<StageOutcome, StoreError> {
        let Some(thread_id) = message.thread_id.as_deref() else {
            return Ok(StageOutcome::Continue);
        };

        if let Some(link) = entities::get_link(conn, &message.message_id)? {
            // Re-run on a resolved message: keep its resolution.
            let candidate = MatchCandidate::link(
                link.target,
                self.confidence,
                SuggestionSource::ThreadInheritance,
                self.name(),
            )
            .with_rationale(format!("message already linked in thread {thread_id}"));
            return Ok(StageOutcome::Match(candidate));
        }

        if let Some(link) = entities::latest_thread_link(conn, thread_id, &message.message_id)? {
            let candidate = MatchCandidate::link(
                link.target,
                self.confidence,
                SuggestionSource::ThreadInheritance,
                self.name(),
            )
            .with_rationale(format!(
                "thread {thread_id} already resolved by message {}",
                link.message_id
            ));
            return Ok(StageOutcome::Match(candidate));
        }

        let hits = patterns::find_active(conn, PatternType::ThreadEntity, thread_id)?;
        if let Some(pattern) = select_best(hits) {
            let rationale = format!("thread {thread_id} matched pattern {}", pattern.pattern_id);
            if let Some(candidate) = pattern_candidate(&pattern, self.name(), rationale) {
                return Ok(StageOutcome::Match(candidate));
            }
        }

        Ok(StageOutcome::Continue)
    }

    fn name(&self) -> &str {
        "thread_inheritance"
    }

    fn priority(&self) -> u8 {
        20
    }
}
