//! Matching Pipeline
//!
//! Runs the stages in priority order and stops at the first one that claims
//! the message. A selected target is then passed through any entity
//! redirects before it is returned.

use std::collections::HashSet;

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::components::{
    code_extraction::CodeExtraction,
    keyword_match::KeywordMatch,
    learned_patterns::{LearnedDomainPattern, LearnedSenderPattern},
    select_best,
    skip_filter::SkipFilter,
    thread_inheritance::ThreadInheritance,
    MatchStage, StageOutcome,
};
use crate::config::MatchingConfig;
use crate::error::{ConfigError, StoreError};
use crate::message::NormalizedMessage;
use crate::store::patterns;
use crate::types::{EntityRef, MatchCandidate, PatternType};

const MAX_REDIRECT_HOPS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// A skip stage claimed the message: log only, no suggestion.
    Skipped {
        stage: String,
        reason: String,
        pattern_id: Option<String>,
    },
    Matched(MatchCandidate),
    /// No stage matched; deep analysis may try.
    Unresolved,
}

pub struct MatchingPipeline {
    // Processing order (by priority)
    stages: Vec<Box<dyn MatchStage>>,
}

impl MatchingPipeline {
    pub fn new(config: &MatchingConfig) -> Result<Self, ConfigError> {
        let stages: Vec<Box<dyn MatchStage>> = vec![
            Box::new(SkipFilter::from_config(config)?),                          // Priority 10
            Box::new(ThreadInheritance::new(config.thread_inheritance_confidence)), // Priority 20
            Box::new(CodeExtraction::new(&config.entity_code_pattern)?),          // Priority 30
            Box::new(LearnedSenderPattern),                                      // Priority 40
            Box::new(LearnedDomainPattern),                                      // Priority 50
            Box::new(KeywordMatch::new(config.min_keyword_length)),              // Priority 60
        ];
        Ok(Self::with_stages(stages))
    }

    pub fn with_stages(mut stages: Vec<Box<dyn MatchStage>>) -> Self {
        // Sort by priority (lower number = evaluated first)
        stages.sort_by_key(|s| s.priority());
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn evaluate(
        &self,
        message: &NormalizedMessage,
        conn: &Connection,
    ) -> Result<PipelineOutcome, StoreError> {
        for stage in &self.stages {
            match stage.evaluate(message, conn)? {
                StageOutcome::Continue => continue,
                StageOutcome::Skip { reason, pattern_id } => {
                    log::debug!(
                        "Message {} skipped by {}: {}",
                        message.message_id,
                        stage.name(),
                        reason
                    );
                    return Ok(PipelineOutcome::Skipped {
                        stage: stage.name().to_string(),
                        reason,
                        pattern_id,
                    });
                }
                StageOutcome::Match(candidate) => {
                    log::debug!(
                        "Message {} matched by {} -> {:?} ({:.2})",
                        message.message_id,
                        stage.name(),
                        candidate.target,
                        candidate.confidence
                    );
                    let candidate = follow_redirects(conn, candidate)?;
                    return Ok(PipelineOutcome::Matched(candidate));
                }
            }
        }
        Ok(PipelineOutcome::Unresolved)
    }
}

/// Follow active entity-redirect rows from the candidate's target, stopping
/// after a fixed number of hops or on a cycle. Provenance is kept.
pub(crate) fn follow_redirects(
    conn: &Connection,
    mut candidate: MatchCandidate,
) -> Result<MatchCandidate, StoreError> {
    let Some(original) = candidate.target.clone() else {
        return Ok(candidate);
    };

    let mut current: EntityRef = original.clone();
    let mut visited = HashSet::from([current.to_string()]);
    for _ in 0..MAX_REDIRECT_HOPS {
        let hits = patterns::find_active(conn, PatternType::EntityRedirect, &current.to_string())?;
        let Some(next) = select_best(hits).and_then(|p| p.target()) else {
            break;
        };
        if !visited.insert(next.to_string()) {
            log::warn!("Entity redirect cycle at {}, stopping", next);
            break;
        }
        current = next;
    }

    if current != original {
        log::debug!("Redirected {} -> {}", original, current);
        let mut details = match candidate.details.take() {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        details.insert("redirected_from".to_string(), json!(original.to_string()));
        candidate.details = Value::Object(details);
        candidate.target = Some(current);
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::test_support::{add_pattern, db};
    use crate::message::Message;
    use crate::store::entities::{self, MessageLink};
    use crate::types::{Entity, SuggestionSource};
    use chrono::Utc;

    fn pipeline() -> MatchingPipeline {
        MatchingPipeline::new(&MatchingConfig::default()).unwrap()
    }

    fn run(db: &crate::store::Database, message: &NormalizedMessage) -> PipelineOutcome {
        let pipeline = pipeline();
        db.with_conn(|conn| pipeline.evaluate(message, conn)).unwrap()
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(
            pipeline().stage_names(),
            vec![
                "skip_filter",
                "thread_inheritance",
                "code_extraction",
                "learned_sender",
                "learned_domain",
                "learned_keyword"
            ]
        );
    }

    #[test]
    fn test_sender_beats_domain() {
        let db = db();
        add_pattern(&db, PatternType::DomainEntity, "client.com", Some(EntityRef::project("d")), 0.95);
        let sender = add_pattern(
            &db,
            PatternType::SenderEntity,
            "pm@client.com",
            Some(EntityRef::project("s")),
            0.6,
        );
        let message = Message::new("m1", "pm@client.com").normalize().unwrap();
        match run(&db, &message) {
            PipelineOutcome::Matched(candidate) => {
                assert_eq!(candidate.source, SuggestionSource::Pattern(sender.pattern_id));
                assert_eq!(candidate.stage, "learned_sender");
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_skip_short_circuits_everything() {
        let db = db();
        add_pattern(&db, PatternType::DomainSkip, "client.com", None, 1.0);
        add_pattern(&db, PatternType::SenderEntity, "pm@client.com", Some(EntityRef::project("s")), 0.99);
        let message = Message::new("m1", "pm@client.com").normalize().unwrap();
        assert!(matches!(run(&db, &message), PipelineOutcome::Skipped { .. }));
    }

    #[test]
    fn test_unresolved_when_nothing_matches() {
        let db = db();
        let message = Message::new("m1", "stranger@nowhere.org")
            .with_subject("Hello")
            .normalize()
            .unwrap();
        assert_eq!(run(&db, &message), PipelineOutcome::Unresolved);
    }

    #[test]
    fn test_retired_patterns_are_invisible() {
        let db = db();
        let pattern = add_pattern(&db, PatternType::SenderEntity, "pm@client.com", Some(EntityRef::project("s")), 0.9);
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE patterns SET is_active = 0 WHERE pattern_id = ?1",
                rusqlite::params![pattern.pattern_id],
            )
            .map_err(StoreError::from)
        })
        .unwrap();
        let message = Message::new("m1", "pm@client.com").normalize().unwrap();
        assert_eq!(run(&db, &message), PipelineOutcome::Unresolved);
    }

    #[test]
    fn test_redirects_followed_and_cycles_stop() {
        let db = db();
        let origin = add_pattern(&db, PatternType::SenderEntity, "pm@client.com", Some(EntityRef::proposal("q1")), 0.8);
        add_pattern(&db, PatternType::EntityRedirect, "proposal:q1", Some(EntityRef::project("p1")), 1.0);
        add_pattern(&db, PatternType::EntityRedirect, "project:p1", Some(EntityRef::proposal("q1")), 1.0);

        let message = Message::new("m1", "pm@client.com").normalize().unwrap();
        match run(&db, &message) {
            PipelineOutcome::Matched(candidate) => {
                assert_eq!(candidate.target, Some(EntityRef::project("p1")));
                assert_eq!(candidate.source, SuggestionSource::Pattern(origin.pattern_id));
                assert_eq!(candidate.details["redirected_from"], "proposal:q1");
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_thread_inheritance_precedes_learned_patterns() {
        let db = db();
        add_pattern(&db, PatternType::SenderEntity, "pm@client.com", Some(EntityRef::project("other")), 0.99);
        db.with_conn(|conn| {
            entities::upsert_entity(
                conn,
                &Entity {
                    entity: EntityRef::project("p1"),
                    code: None,
                    name: "P1".to_string(),
                    status: "active".to_string(),
                },
            )?;
            entities::put_link(
                conn,
                &MessageLink {
                    message_id: "m1".to_string(),
                    thread_id: Some("t1".to_string()),
                    target: EntityRef::project("p1"),
                    received_at: Utc::now(),
                    linked_at: Utc::now(),
                },
            )
        })
        .unwrap();

        let reply = Message::new("m2", "pm@client.com").with_thread("t1").normalize().unwrap();
        match run(&db, &reply) {
            PipelineOutcome::Matched(candidate) => {
                assert_eq!(candidate.target, Some(EntityRef::project("p1")));
                assert_eq!(candidate.source, SuggestionSource::ThreadInheritance);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }
}
