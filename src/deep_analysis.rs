//! Deep analysis adapter.
//!
//! The engine consults an external semantic analyzer only for messages the
//! matching pipeline could not resolve. Every call is bounded by a timeout;
//! a timeout or failure leaves the message unresolved (log only). Sustained
//! failures are escalated through [`AdapterHealth`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::DeepAnalysisConfig;
use crate::error::DeepAnalysisError;
use crate::message::NormalizedMessage;
use crate::types::{Entity, EntityRef, EntityType, MatchCandidate, SuggestionSource, SuggestionType};

/// Request sent to the analyzer: the message plus, optionally, the tracked
/// entities it may choose from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub message_id: String,
    pub sender: String,
    pub sender_domain: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub body_excerpt: String,
    pub thread_id: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<Entity>>,
}

impl AnalysisRequest {
    pub fn from_message(message: &NormalizedMessage, entities: Option<Vec<Entity>>) -> Self {
        Self {
            message_id: message.message_id.clone(),
            sender: message.sender.clone(),
            sender_domain: message.sender_domain.clone(),
            sender_name: message.sender_name.clone(),
            subject: message.subject.clone(),
            body_excerpt: message.body_excerpt.clone(),
            thread_id: message.thread_id.clone(),
            received_at: message.received_at,
            entities,
        }
    }
}

/// A positive answer from the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub target: EntityRef,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub suggestion_type: SuggestionType,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Black-box semantic analyzer. `Ok(None)` means "no match".
#[async_trait]
pub trait DeepAnalyzer: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> Result<Option<AnalysisResponse>, DeepAnalysisError>;
}

/// Analyzer used when deep analysis is disabled; never matches.
pub struct NoopAnalyzer;

#[async_trait]
impl DeepAnalyzer for NoopAnalyzer {
    fn name(&self) -> &str {
        "noop"
    }

    async fn analyze(
        &self,
        _request: &AnalysisRequest,
    ) -> Result<Option<AnalysisResponse>, DeepAnalysisError> {
        Ok(None)
    }
}

/// Posts the request as JSON and expects an [`AnalysisResponse`] or `null`.
pub struct HttpAnalyzer {
    client: Client,
    endpoint: Url,
}

impl HttpAnalyzer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, DeepAnalysisError> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            DeepAnalysisError::Unavailable(format!("invalid endpoint '{endpoint}': {e}"))
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mail-intel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl DeepAnalyzer for HttpAnalyzer {
    fn name(&self) -> &str {
        "http"
    }

    async fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> Result<Option<AnalysisResponse>, DeepAnalysisError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DeepAnalysisError::Unavailable(format!(
                "{} answered {}",
                self.endpoint, status
            )));
        }

        let body = response.text().await?;
        serde_json::from_str::<Option<AnalysisResponse>>(&body)
            .map_err(|e| DeepAnalysisError::InvalidResponse(e.to_string()))
    }
}

/// Consecutive-failure counter for the adapter.
pub struct AdapterHealth {
    consecutive_failures: AtomicU32,
    escalation_threshold: u32,
}

impl AdapterHealth {
    pub fn new(escalation_threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            escalation_threshold: escalation_threshold.max(1),
        }
    }

    /// Returns true exactly when this failure crosses the escalation threshold.
    pub fn record_failure(&self, error: &DeepAnalysisError) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.escalation_threshold {
            log::error!(
                "Deep analysis degraded: {} consecutive failures (last: {})",
                failures,
                error
            );
            true
        } else {
            log::warn!("Deep analysis failed ({} in a row): {}", failures, error);
            false
        }
    }

    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous >= self.escalation_threshold {
            log::info!("Deep analysis recovered after {} failures", previous);
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures() >= self.escalation_threshold
    }
}

/// Timeout, validation and health tracking around a [`DeepAnalyzer`].
pub struct DeepAnalysisGateway {
    analyzer: Arc<dyn DeepAnalyzer>,
    timeout: Duration,
    include_entities: bool,
    health: AdapterHealth,
}

impl DeepAnalysisGateway {
    pub fn new(analyzer: Arc<dyn DeepAnalyzer>, config: &DeepAnalysisConfig) -> Self {
        Self {
            analyzer,
            timeout: Duration::from_millis(config.timeout_ms),
            include_entities: config.include_entities,
            health: AdapterHealth::new(config.failure_escalation_threshold),
        }
    }

    /// Gateway for the configured adapter: HTTP when enabled with an
    /// endpoint, otherwise the no-op analyzer.
    pub fn from_config(config: &DeepAnalysisConfig) -> Result<Self, DeepAnalysisError> {
        let analyzer: Arc<dyn DeepAnalyzer> = match (config.enabled, config.endpoint.as_deref()) {
            (true, Some(endpoint)) => Arc::new(HttpAnalyzer::new(
                endpoint,
                Duration::from_millis(config.timeout_ms),
            )?),
            _ => Arc::new(NoopAnalyzer),
        };
        Ok(Self::new(analyzer, config))
    }

    pub fn include_entities(&self) -> bool {
        self.include_entities
    }

    pub fn health(&self) -> &AdapterHealth {
        &self.health
    }

    pub fn analyzer_name(&self) -> &str {
        self.analyzer.name()
    }

    /// Ask the analyzer about one unresolved message.
    pub async fn analyze(
        &self,
        message: &NormalizedMessage,
        entities: Option<Vec<Entity>>,
    ) -> Result<Option<MatchCandidate>, DeepAnalysisError> {
        let request = AnalysisRequest::from_message(message, entities);
        let result = match tokio::time::timeout(self.timeout, self.analyzer.analyze(&request)).await {
            Ok(result) => result.and_then(|response| response.map(validate).transpose()),
            Err(_) => Err(DeepAnalysisError::Timeout(self.timeout)),
        };

        match result {
            Ok(candidate) => {
                self.health.record_success();
                Ok(candidate)
            }
            Err(e) => {
                self.health.record_failure(&e);
                Err(e)
            }
        }
    }
}

fn validate(response: AnalysisResponse) -> Result<MatchCandidate, DeepAnalysisError> {
    if !response.confidence.is_finite() || !(0.0..=1.0).contains(&response.confidence) {
        return Err(DeepAnalysisError::InvalidResponse(format!(
            "confidence {} outside [0, 1]",
            response.confidence
        )));
    }
    if response.target.entity_type == EntityType::Skip || response.target.entity_id.trim().is_empty() {
        return Err(DeepAnalysisError::InvalidResponse(format!(
            "'{}' is not a linkable entity",
            response.target
        )));
    }
    Ok(MatchCandidate {
        suggestion_type: response.suggestion_type,
        target: Some(response.target),
        confidence: response.confidence,
        source: SuggestionSource::DeepAnalysis,
        stage: "deep_analysis".to_string(),
        rationale: response.rationale,
        details: response.details,
    })
}
