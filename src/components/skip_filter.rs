//! Skip Filter Component
//!
//! Claims newsletters, automated senders and anything an operator has marked
//! as noise before any entity matching runs.

use regex::Regex;
use rusqlite::Connection;

use crate::components::{select_best, MatchStage, StageOutcome};
use crate::config::MatchingConfig;
use crate::domain_utils::DomainUtils;
use crate::error::{ConfigError, StoreError};
use crate::message::NormalizedMessage;
use crate::store::patterns;
use crate::types::PatternType;

pub struct SkipFilter {
    automated_senders: Vec<Regex>,
}

impl SkipFilter {
    pub fn new() -> Self {
        Self {
            automated_senders: Vec::new(),
        }
    }

    pub fn from_config(config: &MatchingConfig) -> Result<Self, ConfigError> {
        let mut filter = Self::new();
        for pattern in &config.automated_sender_patterns {
            filter.add_automated_sender_pattern(pattern)?;
        }
        Ok(filter)
    }

    /// Add automated sender pattern (matched against the lowercase address)
    pub fn add_automated_sender_pattern(&mut self, pattern: &str) -> Result<(), ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::Regex {
            pattern: pattern.to_string(),
            source,
        })?;
        self.automated_senders.push(regex);
        Ok(())
    }
}

impl Default for SkipFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchStage for SkipFilter {
    fn evaluate(
        &self,
        message: &NormalizedMessage,
        conn: &Connection,
    ) -> Result<StageOutcome, StoreError> {
        if let Some(regex) = self
            .automated_senders
            .iter()
            .find(|r| r.is_match(&message.sender))
        {
            return Ok(StageOutcome::Skip {
                reason: format!("automated sender matches {}", regex.as_str()),
                pattern_id: None,
            });
        }

        let sender_hits = patterns::find_active(conn, PatternType::SenderSkip, &message.sender)?;
        if let Some(pattern) = select_best(sender_hits) {
            return Ok(StageOutcome::Skip {
                reason: format!("sender {} is skipped", message.sender),
                pattern_id: Some(pattern.pattern_id),
            });
        }

        for domain in DomainUtils::domain_hierarchy(&message.sender_domain) {
            let domain_hits = patterns::find_active(conn, PatternType::DomainSkip, &domain)?;
            if let Some(pattern) = select_best(domain_hits) {
                return Ok(StageOutcome::Skip {
                    reason: format!("domain {domain} is skipped"),
                    pattern_id: Some(pattern.pattern_id),
                });
            }
        }

        Ok(StageOutcome::Continue)
    }

    fn name(&self) -> &str {
        "skip_filter"
    }

    fn priority(&self) -> u8 {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::test_support::{add_pattern, db};
    use crate::message::Message;

    fn evaluate(filter: &SkipFilter, db: &crate::store::Database, sender: &str) -> StageOutcome {
        let message = Message::new("m1", sender).normalize().unwrap();
        db.with_conn(|conn| filter.evaluate(&message, conn)).unwrap()
    }

    #[test]
    fn test_automated_senders_skipped() {
        let db = db();
        let filter = SkipFilter::from_config(&MatchingConfig::default()).unwrap();
        assert!(matches!(
            evaluate(&filter, &db, "no-reply@vendor.com"),
            StageOutcome::Skip { pattern_id: None, .. }
        ));
        assert_eq!(evaluate(&filter, &db, "person@vendor.com"), StageOutcome::Continue);
    }

    #[test]
    fn test_parent_domain_skip_applies_to_subdomains() {
        let db = db();
        let pattern = add_pattern(&db, PatternType::DomainSkip, "mailchimp.com", None, 1.0);
        let filter = SkipFilter::new();
        match evaluate(&filter, &db, "news@us5.mailchimp.com") {
            StageOutcome::Skip { pattern_id, .. } => {
                assert_eq!(pattern_id, Some(pattern.pattern_id))
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn test_sender_skip() {
        let db = db();
        add_pattern(&db, PatternType::SenderSkip, "Digest@Client.com", None, 1.0);
        let filter = SkipFilter::new();
        assert!(matches!(
            evaluate(&filter, &db, "digest@client.com"),
            StageOutcome::Skip { .. }
        ));
        assert_eq!(evaluate(&filter, &db, "pm@client.com"), StageOutcome::Continue);
    }
}
