//! Learning feedback loop: human decisions adjust pattern confidence.
//!
//! Approve: `c + α(1 − c)`. Reject: `c − βc`, retiring the pattern once it
//! falls below the deactivation floor. An edit rejects the original pattern
//! and reinforces (or creates) a pattern for the corrected target.

use chrono::Utc;

use crate::config::{LearningConfig, MatchingConfig};
use crate::domain_utils::DomainUtils;
use crate::error::StoreError;
use crate::message::NormalizedMessage;
use crate::store::{clamp_confidence, PatternStore};
use crate::types::{EntityRef, NewPattern, Pattern, PatternType};

pub fn approved_confidence(confidence: f64, approve_rate: f64) -> f64 {
    let c = clamp_confidence(confidence);
    clamp_confidence(c + approve_rate * (1.0 - c))
}

pub fn rejected_confidence(confidence: f64, reject_rate: f64) -> f64 {
    let c = clamp_confidence(confidence);
    clamp_confidence(c - reject_rate * c)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionOutcome {
    /// An active pattern already pointed at the corrected target.
    Reinforced(Pattern),
    /// A new pattern was promoted from the correction.
    Created(Pattern),
}

impl CorrectionOutcome {
    pub fn pattern(&self) -> &Pattern {
        match self {
            CorrectionOutcome::Reinforced(p) | CorrectionOutcome::Created(p) => p,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionResult {
    /// The original pattern after its rejection, if the suggestion had one.
    pub rejected: Option<Pattern>,
    pub outcome: CorrectionOutcome,
}

#[derive(Clone)]
pub struct LearningLoop {
    patterns: PatternStore,
    config: LearningConfig,
    free_email_providers: Vec<String>,
}

impl LearningLoop {
    pub fn new(patterns: PatternStore, config: LearningConfig, matching: &MatchingConfig) -> Self {
        Self {
            patterns,
            config,
            free_email_providers: matching.free_email_providers.clone(),
        }
    }

    pub fn record_approval(&self, pattern_id: &str) -> Result<Pattern, StoreError> {
        let rate = self.config.approve_rate;
        let now = Utc::now();
        let pattern = self.patterns.update_with(pattern_id, |p| {
            p.confidence = approved_confidence(p.confidence, rate);
            p.times_used += 1;
            p.times_correct += 1;
            p.last_used_at = Some(now);
        })?;
        log::debug!(
            "Pattern {} approved, confidence now {:.3}",
            pattern.pattern_id,
            pattern.confidence
        );
        Ok(pattern)
    }

    pub fn record_rejection(&self, pattern_id: &str) -> Result<Pattern, StoreError> {
        let rate = self.config.reject_rate;
        let floor = self.config.deactivation_floor;
        let now = Utc::now();
        let pattern = self.patterns.update_with(pattern_id, |p| {
            p.confidence = rejected_confidence(p.confidence, rate);
            p.times_used += 1;
            p.times_rejected += 1;
            p.last_used_at = Some(now);
            if p.confidence < floor {
                p.is_active = false;
            }
        })?;
        if pattern.is_active {
            log::debug!(
                "Pattern {} rejected, confidence now {:.3}",
                pattern.pattern_id,
                pattern.confidence
            );
        } else {
            log::info!(
                "Pattern {} retired at confidence {:.3} ({} rejections)",
                pattern.pattern_id,
                pattern.confidence,
                pattern.times_rejected
            );
        }
        Ok(pattern)
    }

    /// Key a correction is learned under: the full sender address for
    /// free-mail providers, the sender domain otherwise.
    pub fn correction_key(&self, message: &NormalizedMessage) -> (PatternType, String) {
        if DomainUtils::matches_domain_list(&message.sender_domain, &self.free_email_providers) {
            (PatternType::SenderEntity, message.sender.clone())
        } else {
            (PatternType::DomainEntity, message.sender_domain.clone())
        }
    }

    pub fn record_correction(
        &self,
        original_pattern: Option<&str>,
        message: &NormalizedMessage,
        corrected: &EntityRef,
    ) -> Result<CorrectionResult, StoreError> {
        let rejected = original_pattern
            .map(|id| self.record_rejection(id))
            .transpose()?;

        let (pattern_type, key) = self.correction_key(message);
        let existing = self
            .patterns
            .find_active_for_target(PatternType::SenderEntity, &message.sender, corrected)?
            .or(self.patterns.find_active_for_target(pattern_type, &key, corrected)?);

        let outcome = match existing {
            Some(pattern) => CorrectionOutcome::Reinforced(self.record_approval(&pattern.pattern_id)?),
            None => {
                let mut new = NewPattern::new(
                    pattern_type,
                    key,
                    Some(corrected.clone()),
                    self.config.seed_confidence,
                );
                new.times_used = 1;
                new.times_correct = 1;
                new.notes = Some(format!("learned from correction of message {}", message.message_id));
                let pattern = self.patterns.create(new)?;
                log::info!(
                    "Promoted {} pattern {} '{}' -> {}",
                    pattern.pattern_type,
                    pattern.pattern_id,
                    pattern.pattern_key,
                    corrected
                );
                CorrectionOutcome::Created(pattern)
            }
        };

        Ok(CorrectionResult { rejected, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::store::{Database, RetryPolicy};
    use proptest::prelude::*;

    fn learning() -> (LearningLoop, PatternStore) {
        let store = PatternStore::new(Database::open_in_memory().unwrap(), RetryPolicy::default());
        let learning = LearningLoop::new(store.clone(), LearningConfig::default(), &MatchingConfig::default());
        (learning, store)
    }

    #[test]
    fn test_formulas() {
        assert!((approved_confidence(0.6, 0.1) - 0.64).abs() < 1e-12);
        assert!((rejected_confidence(0.6, 0.2) - 0.48).abs() < 1e-12);
        assert_eq!(approved_confidence(1.0, 0.1), 1.0);
        assert_eq!(rejected_confidence(0.0, 0.2), 0.0);
    }

    #[test]
    fn test_rejection_updates_counters_and_retires() {
        let (learning, store) = learning();
        let pattern = store
            .create(NewPattern::new(
                PatternType::SenderEntity,
                "pm@client.com",
                Some(EntityRef::project("p1")),
                0.35,
            ))
            .unwrap();

        let after = learning.record_rejection(&pattern.pattern_id).unwrap();
        assert!((after.confidence - 0.28).abs() < 1e-12);
        assert_eq!(after.times_used, 1);
        assert_eq!(after.times_rejected, 1);
        assert!(!after.is_active);
        assert!(store.get(&pattern.pattern_id).unwrap().is_some());
    }

    #[test]
    fn test_correction_promotes_domain_pattern() {
        let (learning, _) = learning();
        let message = Message::new("m1", "pm@client.com").normalize().unwrap();
        let result = learning
            .record_correction(None, &message, &EntityRef::project("p9"))
            .unwrap();
        assert!(result.rejected.is_none());
        match result.outcome {
            CorrectionOutcome::Created(pattern) => {
                assert_eq!(pattern.pattern_type, PatternType::DomainEntity);
                assert_eq!(pattern.pattern_key, "client.com");
                assert_eq!(pattern.confidence, 0.60);
                assert_eq!(pattern.times_used, 1);
                assert_eq!(pattern.times_correct, 1);
            }
            other => panic!("expected a new pattern, got {other:?}"),
        }
    }

    #[test]
    fn test_correction_for_free_mail_keys_on_sender() {
        let (learning, _) = learning();
        let message = Message::new("m1", "someone@gmail.com").normalize().unwrap();
        let result = learning
            .record_correction(None, &message, &EntityRef::proposal("q1"))
            .unwrap();
        let pattern = result.outcome.pattern();
        assert_eq!(pattern.pattern_type, PatternType::SenderEntity);
        assert_eq!(pattern.pattern_key, "someone@gmail.com");
    }

    #[test]
    fn test_correction_reinforces_existing_and_rejects_original() {
        let (learning, store) = learning();
        let wrong = store
            .create(NewPattern::new(
                PatternType::DomainEntity,
                "client.com",
                Some(EntityRef::project("p1")),
                0.8,
            ))
            .unwrap();
        let right = store
            .create(NewPattern::new(
                PatternType::DomainEntity,
                "client.com",
                Some(EntityRef::project("p2")),
                0.5,
            ))
            .unwrap();

        let message = Message::new("m1", "pm@client.com").normalize().unwrap();
        let result = learning
            .record_correction(Some(&wrong.pattern_id), &message, &EntityRef::project("p2"))
            .unwrap();

        let rejected = result.rejected.unwrap();
        assert_eq!(rejected.pattern_id, wrong.pattern_id);
        assert!((rejected.confidence - 0.64).abs() < 1e-12);
        match result.outcome {
            CorrectionOutcome::Reinforced(pattern) => {
                assert_eq!(pattern.pattern_id, right.pattern_id);
                assert!((pattern.confidence - 0.55).abs() < 1e-12);
                assert_eq!(pattern.times_correct, 1);
            }
            other => panic!("expected reinforcement, got {other:?}"),
        }
        assert_eq!(store.list(true).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn prop_confidence_stays_in_unit_interval(
            start in 0.0f64..=1.0,
            approve_rate in 0.001f64..=1.0,
            reject_rate in 0.001f64..=1.0,
            decisions in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let mut c = start;
            for approve in decisions {
                c = if approve {
                    approved_confidence(c, approve_rate)
                } else {
                    rejected_confidence(c, reject_rate)
                };
                prop_assert!((0.0..=1.0).contains(&c));
            }
        }

        #[test]
        fn prop_approve_never_decreases_and_reject_never_increases(
            c in 0.0f64..=1.0,
            rate in 0.001f64..=1.0,
        ) {
            prop_assert!(approved_confidence(c, rate) >= c);
            prop_assert!(rejected_confidence(c, rate) <= c);
        }
    }
}
