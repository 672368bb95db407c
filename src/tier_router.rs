//! Tier Router: maps a suggestion's confidence and kind to a review tier.

use std::collections::BTreeMap;

use crate::config::TierConfig;
use crate::types::{SuggestionType, Tier};

#[derive(Debug, Clone)]
pub struct TierRouter {
    config: TierConfig,
}

impl TierRouter {
    pub fn new(config: TierConfig) -> Self {
        Self { config }
    }

    /// Kinds listed in `never_auto_apply` go to individual review even when
    /// their confidence clears the auto-apply threshold.
    pub fn route(&self, confidence: f64, suggestion_type: SuggestionType) -> Tier {
        let tier = self.tier_for(confidence);
        if tier == Tier::AutoApply && self.config.never_auto_apply.contains(&suggestion_type) {
            log::debug!(
                "{} never auto-applies, routing {:.2} to individual review",
                suggestion_type,
                confidence
            );
            return Tier::IndividualReview;
        }
        tier
    }

    fn tier_for(&self, confidence: f64) -> Tier {
        if confidence >= self.config.auto_apply_threshold {
            Tier::AutoApply
        } else if confidence >= self.config.batch_review_threshold {
            Tier::BatchReview
        } else if confidence >= self.config.individual_review_threshold {
            Tier::IndividualReview
        } else {
            Tier::LogOnly
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }
}

/// Group batch-review items by the sender of their message, senders sorted.
pub fn group_by_sender<T, I>(items: I) -> BTreeMap<String, Vec<T>>
where
    I: IntoIterator<Item = (String, T)>,
{
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for (sender, item) in items {
        groups.entry(sender).or_default().push(item);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> TierRouter {
        TierRouter::new(TierConfig::default())
    }

    #[test]
    fn test_default_thresholds() {
        let router = router();
        let link = SuggestionType::LinkMessage;
        assert_eq!(router.route(0.95, link), Tier::AutoApply);
        assert_eq!(router.route(0.90, link), Tier::AutoApply);
        assert_eq!(router.route(0.899, link), Tier::BatchReview);
        assert_eq!(router.route(0.70, link), Tier::BatchReview);
        assert_eq!(router.route(0.60, link), Tier::IndividualReview);
        assert_eq!(router.route(0.50, link), Tier::IndividualReview);
        assert_eq!(router.route(0.49, link), Tier::LogOnly);
        assert_eq!(router.route(0.0, link), Tier::LogOnly);
    }

    #[test]
    fn test_override_wins_over_threshold() {
        let router = router();
        assert_eq!(
            router.route(1.0, SuggestionType::UpdateEntityStatus),
            Tier::IndividualReview
        );
        // Below auto-apply the override has nothing to do.
        assert_eq!(
            router.route(0.75, SuggestionType::UpdateEntityStatus),
            Tier::BatchReview
        );
    }

    #[test]
    fn test_custom_override_list() {
        let config = TierConfig {
            never_auto_apply: vec![SuggestionType::LinkMessage],
            ..TierConfig::default()
        };
        let router = TierRouter::new(config);
        assert_eq!(router.route(0.99, SuggestionType::LinkMessage), Tier::IndividualReview);
        assert_eq!(router.route(0.99, SuggestionType::UpdateEntityStatus), Tier::AutoApply);
    }

    #[test]
    fn test_group_by_sender_keeps_arrival_order() {
        let groups = group_by_sender(vec![
            ("b@x.com".to_string(), 1),
            ("a@y.com".to_string(), 2),
            ("b@x.com".to_string(), 3),
        ]);
        let senders: Vec<_> = groups.keys().cloned().collect();
        assert_eq!(senders, vec!["a@y.com".to_string(), "b@x.com".to_string()]);
        assert_eq!(groups["b@x.com"], vec![1, 3]);
    }
}
