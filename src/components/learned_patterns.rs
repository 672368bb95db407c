//! Learned sender and domain pattern stages.

use rusqlite::Connection;

use crate::components::{pattern_candidate, select_best, MatchStage, StageOutcome};
use crate::domain_utils::DomainUtils;
use crate::error::StoreError;
use crate::message::NormalizedMessage;
use crate::store::patterns;
use crate::types::PatternType;

/// Exact sender-address match against sender→entity rows.
pub struct LearnedSenderPattern;

impl MatchStage for LearnedSenderPattern {
    fn evaluate(
        &self,
        message: &NormalizedMessage,
        conn: &Connection,
    ) -> Result<StageOutcome, StoreError> {
        let hits = patterns::find_active(conn, PatternType::SenderEntity, &message.sender)?;
        Ok(select_best(hits)
            .and_then(|pattern| {
                let rationale = format!("sender {} matched pattern {}", message.sender, pattern.pattern_id);
                pattern_candidate(&pattern, self.name(), rationale)
            })
            .map_or(StageOutcome::Continue, StageOutcome::Match))
    }

    fn name(&self) -> &str {
        "learned_sender"
    }

    fn priority(&self) -> u8 {
        40
    }
}

/// Sender-domain match against domain→entity rows. The most specific level of
/// the domain hierarchy with any active row wins.
pub struct LearnedDomainPattern;

impl MatchStage for LearnedDomainPattern {
    fn evaluate(
        &self,
        message: &NormalizedMessage,
        conn: &Connection,
    ) -> Result<StageOutcome, StoreError> {
        for domain in DomainUtils::domain_hierarchy(&message.sender_domain) {
            let hits = patterns::find_active(conn, PatternType::DomainEntity, &domain)?;
            if let Some(pattern) = select_best(hits) {
                let rationale = format!("domain {domain} matched pattern {}", pattern.pattern_id);
                if let Some(candidate) = pattern_candidate(&pattern, self.name(), rationale) {
                    return Ok(StageOutcome::Match(candidate));
                }
            }
        }
        Ok(StageOutcome::Continue)
    }

    fn name(&self) -> &str {
        "learned_domain"
    }

    fn priority(&self) -> u8 {
        50
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::test_support::{add_pattern, db, set_last_used};
    use crate::message::Message;
    use crate::types::{EntityRef, SuggestionSource};
    use chrono::Utc;

    fn candidate_source(outcome: StageOutcome) -> SuggestionSource {
        match outcome {
            StageOutcome::Match(candidate) => candidate.source,
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_sender_match_is_exact() {
        let db = db();
        let pattern = add_pattern(
            &db,
            PatternType::SenderEntity,
            "pm@client.com",
            Some(EntityRef::project("p1")),
            0.6,
        );
        let hit = Message::new("m1", "PM@client.com").normalize().unwrap();
        let miss = Message::new("m2", "pm2@client.com").normalize().unwrap();

        let outcome = db.with_conn(|conn| LearnedSenderPattern.evaluate(&hit, conn)).unwrap();
        assert_eq!(candidate_source(outcome), SuggestionSource::Pattern(pattern.pattern_id));
        assert_eq!(
            db.with_conn(|conn| LearnedSenderPattern.evaluate(&miss, conn)).unwrap(),
            StageOutcome::Continue
        );
    }

    #[test]
    fn test_most_specific_domain_level_wins() {
        let db = db();
        add_pattern(&db, PatternType::DomainEntity, "client.com", Some(EntityRef::project("parent")), 0.99);
        let specific = add_pattern(
            &db,
            PatternType::DomainEntity,
            "eu.client.com",
            Some(EntityRef::project("eu")),
            0.7,
        );
        let message = Message::new("m1", "a@eu.client.com").normalize().unwrap();
        let outcome = db.with_conn(|conn| LearnedDomainPattern.evaluate(&message, conn)).unwrap();
        assert_eq!(candidate_source(outcome), SuggestionSource::Pattern(specific.pattern_id));
    }

    #[test]
    fn test_domain_tie_break_prefers_recent_use() {
        let db = db();
        let stale = add_pattern(&db, PatternType::DomainEntity, "client.com", Some(EntityRef::project("p1")), 0.8);
        let fresh = add_pattern(&db, PatternType::DomainEntity, "client.com", Some(EntityRef::project("p2")), 0.8);
        set_last_used(&db, &stale.pattern_id, Utc::now() - chrono::Duration::days(30));
        set_last_used(&db, &fresh.pattern_id, Utc::now());

        let message = Message::new("m1", "a@client.com").normalize().unwrap();
        for _ in 0..3 {
            let outcome = db.with_conn(|conn| LearnedDomainPattern.evaluate(&message, conn)).unwrap();
            assert_eq!(
                candidate_source(outcome),
                SuggestionSource::Pattern(fresh.pattern_id.clone())
            );
        }
    }
}
