use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::SuggestionType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database_path: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub logging: Option<LoggingConfig>,
    pub statistics: Option<StatisticsConfig>,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub tiers: TierConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub deep_analysis: DeepAnalysisConfig,
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub database_path: String,
    pub flush_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Confidence given to a match inherited from an already resolved thread.
    pub thread_inheritance_confidence: f64,
    /// Regex recognising structured entity codes in subject and body.
    pub entity_code_pattern: String,
    /// Sender regexes treated as automated mail and skipped outright.
    pub automated_sender_patterns: Vec<String>,
    /// Public mailbox providers; learning keys on the full address for these.
    pub free_email_providers: Vec<String>,
    /// Keyword patterns shorter than this are ignored by the keyword stage.
    pub min_keyword_length: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            thread_inheritance_confidence: 0.95,
            entity_code_pattern: r"\b(?:PRJ|PROP)-\d{4}-\d{3,}\b".to_string(),
            automated_sender_patterns: vec![
                r"^no-?reply@".to_string(),
                r"^do-?not-?reply@".to_string(),
                r"^mailer-daemon@".to_string(),
                r"^postmaster@".to_string(),
                r"^bounces?[+@]".to_string(),
            ],
            free_email_providers: vec![
                "gmail.com".to_string(),
                "googlemail.com".to_string(),
                "outlook.com".to_string(),
                "hotmail.com".to_string(),
                "yahoo.com".to_string(),
                "icloud.com".to_string(),
                "aol.com".to_string(),
                "proton.me".to_string(),
            ],
            min_keyword_length: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub auto_apply_threshold: f64,
    pub batch_review_threshold: f64,
    pub individual_review_threshold: f64,
    /// Suggestion kinds that are never auto-applied regardless of confidence.
    #[serde(default)]
    pub never_auto_apply: Vec<SuggestionType>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            auto_apply_threshold: 0.90,
            batch_review_threshold: 0.70,
            individual_review_threshold: 0.50,
            never_auto_apply: vec![SuggestionType::UpdateEntityStatus],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Approval learning rate (alpha).
    pub approve_rate: f64,
    /// Rejection learning rate (beta).
    pub reject_rate: f64,
    /// Patterns whose confidence falls below this are retired.
    pub deactivation_floor: f64,
    /// Starting confidence of a pattern promoted from an edit.
    pub seed_confidence: f64,
    pub write_retry_attempts: u32,
    pub write_retry_base_delay_ms: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            approve_rate: 0.10,
            reject_rate: 0.20,
            deactivation_floor: 0.30,
            seed_confidence: 0.60,
            write_retry_attempts: 8,
            write_retry_base_delay_ms: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepAnalysisConfig {
    pub enabled: bool,
    /// HTTP endpoint of the analysis service; no adapter is built without one.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    /// Send the list of tracked entities along with each request.
    pub include_entities: bool,
    /// Consecutive failures after which the adapter is reported unhealthy.
    pub failure_escalation_threshold: u32,
}

impl Default for DeepAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            timeout_ms: 5_000,
            include_entities: true,
            failure_escalation_threshold: 5,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: "/var/lib/mail-intel/engine.db".to_string(),
            workers: default_workers(),
            logging: Some(LoggingConfig {
                level: "info".to_string(),
            }),
            statistics: Some(StatisticsConfig {
                enabled: true,
                database_path: "/var/lib/mail-intel/stats.db".to_string(),
                flush_interval_seconds: 60,
            }),
            matching: MatchingConfig::default(),
            tiers: TierConfig::default(),
            learning: LearningConfig::default(),
            deep_analysis: DeepAnalysisConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Check thresholds, rates and regexes before the engine is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }

        let tiers = &self.tiers;
        let ordered = 0.0 <= tiers.individual_review_threshold
            && tiers.individual_review_threshold < tiers.batch_review_threshold
            && tiers.batch_review_threshold < tiers.auto_apply_threshold
            && tiers.auto_apply_threshold <= 1.0;
        if !ordered {
            return Err(ConfigError::Invalid(format!(
                "tier thresholds must satisfy 0 <= individual ({}) < batch ({}) < auto ({}) <= 1",
                tiers.individual_review_threshold,
                tiers.batch_review_threshold,
                tiers.auto_apply_threshold
            )));
        }

        let learning = &self.learning;
        for (name, value) in [
            ("approve_rate", learning.approve_rate),
            ("reject_rate", learning.reject_rate),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "learning.{name} must be in (0, 1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("deactivation_floor", learning.deactivation_floor),
            ("seed_confidence", learning.seed_confidence),
            (
                "thread_inheritance_confidence",
                self.matching.thread_inheritance_confidence,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        if learning.seed_confidence < learning.deactivation_floor {
            return Err(ConfigError::Invalid(
                "seed_confidence must not be below deactivation_floor".to_string(),
            ));
        }
        if learning.write_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "learning.write_retry_attempts must be at least 1".to_string(),
            ));
        }

        for pattern in std::iter::once(&self.matching.entity_code_pattern)
            .chain(self.matching.automated_sender_patterns.iter())
        {
            regex::Regex::new(pattern).map_err(|source| ConfigError::Regex {
                pattern: pattern.clone(),
                source,
            })?;
        }

        let deep = &self.deep_analysis;
        if deep.enabled {
            match &deep.endpoint {
                Some(endpoint) => {
                    url::Url::parse(endpoint).map_err(|e| {
                        ConfigError::Invalid(format!("deep_analysis.endpoint '{endpoint}': {e}"))
                    })?;
                }
                None => {
                    return Err(ConfigError::Invalid(
                        "deep_analysis.enabled requires an endpoint".to_string(),
                    ))
                }
            }
            if deep.timeout_ms == 0 {
                return Err(ConfigError::Invalid(
                    "deep_analysis.timeout_ms must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tiers.auto_apply_threshold, 0.90);
        assert!(config
            .tiers
            .never_auto_apply
            .contains(&SuggestionType::UpdateEntityStatus));
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut config = EngineConfig::default();
        config.tiers.batch_review_threshold = 0.95;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_regex_rejected() {
        let mut config = EngineConfig::default();
        config.matching.automated_sender_patterns.push("([".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Regex { .. })));
    }

    #[test]
    fn test_deep_analysis_requires_endpoint() {
        let mut config = EngineConfig::default();
        config.deep_analysis.enabled = true;
        assert!(config.validate().is_err());

        config.deep_analysis.endpoint = Some("http://localhost:8088/analyze".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_round_trip_with_partial_sections() {
        let yaml = r#"
database_path: /tmp/engine.db
logging:
  level: debug
statistics: null
tiers:
  auto_apply_threshold: 0.95
  batch_review_threshold: 0.8
  individual_review_threshold: 0.6
  never_auto_apply: [create_contact]
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.tiers.auto_apply_threshold, 0.95);
        assert_eq!(
            config.tiers.never_auto_apply,
            vec![SuggestionType::CreateContact]
        );
        assert_eq!(config.learning.approve_rate, 0.10);
        assert!(config.validate().is_ok());
    }
}
