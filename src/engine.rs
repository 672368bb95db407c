//! The engine wires the matching pipeline, deep analysis, the suggestion
//! engine, tier routing, handlers and the learning loop over one database.
//!
//! Message processing is async (deep analysis is the only suspending call).
//! Decisions, rollback and administration are synchronous store operations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::components::matching_pipeline::follow_redirects;
use crate::components::{MatchingPipeline, PipelineOutcome};
use crate::config::EngineConfig;
use crate::deep_analysis::{AdapterHealth, DeepAnalysisGateway, DeepAnalyzer};
use crate::error::{EngineError, HandlerError, Result};
use crate::handlers::{HandlerRegistry, RollbackDisposition};
use crate::learning::LearningLoop;
use crate::message::{Message, NormalizedMessage};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::store::suggestions::Stamp;
use crate::store::{
    clamp_confidence, decision_log, entities, messages, suggestions, Database, DecisionLog,
    EntityStore, PatternStore, RetryPolicy,
};
use crate::suggestion_engine::{DiscardReason, SubmitOutcome, SuggestionEngine, SYSTEM_ACTOR};
use crate::tier_router::{group_by_sender, TierRouter};
use crate::types::{
    DecisionLogEntry, Entity, EntityRef, MatchCandidate, NewPattern, Pattern, Suggestion,
    SuggestionStatus, SuggestionType, Tier,
};

/// What happened to one message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    /// A skip rule claimed the message; nothing is suggested.
    Skipped {
        stage: String,
        reason: String,
        pattern_id: Option<String>,
    },
    /// Neither the pipeline nor deep analysis produced a candidate.
    Unresolved { deep_analysis_error: Option<String> },
    /// The candidate lost to an existing suggestion.
    Discarded {
        existing_id: String,
        reason: DiscardReason,
    },
    /// Pending in a review tier (or recorded as log-only).
    Queued(Suggestion),
    /// Auto-applied by the system actor.
    Applied(Suggestion),
    /// Auto-apply failed during execution; the suggestion is in `error`.
    ApplyFailed { suggestion: Suggestion, error: String },
}

impl ProcessingOutcome {
    pub fn suggestion(&self) -> Option<&Suggestion> {
        match self {
            ProcessingOutcome::Queued(s)
            | ProcessingOutcome::Applied(s)
            | ProcessingOutcome::ApplyFailed { suggestion: s, .. } => Some(s),
            _ => None,
        }
    }
}

/// Result for one message of a batch, in input order.
#[derive(Debug)]
pub struct BatchItem {
    pub message_id: String,
    pub result: Result<ProcessingOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    /// Approve with a corrected target.
    Edit,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::Edit => "edit",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "approve" => Ok(Decision::Approve),
            "reject" => Ok(Decision::Reject),
            "edit" => Ok(Decision::Edit),
            other => Err(EngineError::InvalidDecision(format!(
                "unknown decision '{other}' (expected approve, reject or edit)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub suggestion_id: String,
    pub decision: Decision,
    pub actor: String,
    #[serde(default)]
    pub corrected_target: Option<EntityRef>,
    #[serde(default)]
    pub note: Option<String>,
}

impl DecisionRequest {
    pub fn approve(suggestion_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self::new(suggestion_id, Decision::Approve, actor, None)
    }

    pub fn reject(suggestion_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self::new(suggestion_id, Decision::Reject, actor, None)
    }

    pub fn edit(
        suggestion_id: impl Into<String>,
        actor: impl Into<String>,
        corrected_target: EntityRef,
    ) -> Self {
        Self::new(suggestion_id, Decision::Edit, actor, Some(corrected_target))
    }

    fn new(
        suggestion_id: impl Into<String>,
        decision: Decision,
        actor: impl Into<String>,
        corrected_target: Option<EntityRef>,
    ) -> Self {
        Self {
            suggestion_id: suggestion_id.into(),
            decision,
            actor: actor.into(),
            corrected_target,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    /// The suggestion after the decision (applied, rejected or error).
    pub suggestion: Suggestion,
    /// Patterns changed by the learning loop.
    pub pattern_updates: Vec<Pattern>,
    /// Problems after the decision committed: apply or learning failures.
    pub warnings: Vec<String>,
}

impl DecisionOutcome {
    pub fn status(&self) -> SuggestionStatus {
        self.suggestion.status
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDecisionRequest {
    pub suggestion_ids: Vec<String>,
    pub decision: Decision,
    pub actor: String,
    #[serde(default)]
    pub corrected_target: Option<EntityRef>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug)]
pub struct BatchDecisionItem {
    pub suggestion_id: String,
    pub result: Result<DecisionOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewItem {
    pub suggestion: Suggestion,
    pub sender: String,
    pub subject: String,
    pub preview: String,
}

/// Pending work for reviewers. Log-only suggestions never appear here.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewQueue {
    /// Batch-review items keyed by sender address.
    pub batches: BTreeMap<String, Vec<ReviewItem>>,
    pub individual: Vec<ReviewItem>,
    /// Suggestions marked stale by the sweep that preceded this listing.
    pub superseded: usize,
}

impl ReviewQueue {
    pub fn len(&self) -> usize {
        self.individual.len() + self.batches.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Engine {
    config: EngineConfig,
    db: Database,
    pipeline: MatchingPipeline,
    deep_analysis: Option<DeepAnalysisGateway>,
    suggestions: SuggestionEngine,
    router: TierRouter,
    handlers: HandlerRegistry,
    learning: LearningLoop,
    patterns: PatternStore,
    entities: EntityStore,
    decision_log: DecisionLog,
    statistics: Option<StatisticsCollector>,
}

impl Engine {
    pub fn new(config: EngineConfig, db: Database) -> Result<Self> {
        config.validate()?;

        let pipeline = MatchingPipeline::new(&config.matching)?;
        let deep_analysis = if config.deep_analysis.enabled {
            Some(DeepAnalysisGateway::from_config(&config.deep_analysis)?)
        } else {
            None
        };
        let patterns = PatternStore::new(db.clone(), RetryPolicy::from_config(&config.learning));
        let learning = LearningLoop::new(patterns.clone(), config.learning.clone(), &config.matching);

        log::info!(
            "Engine ready: {} stages, deep analysis {}",
            pipeline.stage_names().len(),
            deep_analysis
                .as_ref()
                .map_or("disabled", |g| g.analyzer_name())
        );

        Ok(Self {
            router: TierRouter::new(config.tiers.clone()),
            suggestions: SuggestionEngine::new(db.clone()),
            handlers: HandlerRegistry::with_defaults(),
            entities: EntityStore::new(db.clone()),
            decision_log: DecisionLog::new(db.clone()),
            statistics: None,
            config,
            db,
            pipeline,
            deep_analysis,
            learning,
            patterns,
        })
    }

    /// Open the database named in the configuration and build the engine.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let db = Database::open(&config.database_path)?;
        Self::new(config, db)
    }

    /// Use `analyzer` for unresolved messages, regardless of `deep_analysis.enabled`.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn DeepAnalyzer>) -> Self {
        self.deep_analysis = Some(DeepAnalysisGateway::new(analyzer, &self.config.deep_analysis));
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_statistics(mut self, collector: StatisticsCollector) -> Self {
        self.statistics = Some(collector);
        self
    }

    /// Flush statistics before exit.
    pub async fn shutdown(self) {
        if let Some(statistics) = self.statistics {
            statistics.shutdown().await;
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.pipeline.stage_names()
    }

    pub fn deep_analysis_health(&self) -> Option<&AdapterHealth> {
        self.deep_analysis.as_ref().map(DeepAnalysisGateway::health)
    }

    fn record(&self, event: StatEvent) {
        if let Some(statistics) = &self.statistics {
            statistics.record_event(event);
        }
    }

    // ----- message processing -----

    pub async fn process_message(&self, message: &Message) -> Result<ProcessingOutcome> {
        let normalized = match message.normalize() {
            Ok(normalized) => normalized,
            Err(e) => {
                log::warn!("Rejected message '{}': {}", message.message_id, e);
                self.record(StatEvent::MessageFailed);
                return Err(e.into());
            }
        };
        self.record(StatEvent::MessageProcessed);

        let outcome = self.db.with_conn(|conn| -> Result<PipelineOutcome> {
            messages::record(conn, &normalized)?;
            Ok(self.pipeline.evaluate(&normalized, conn)?)
        })?;

        let candidate = match outcome {
            PipelineOutcome::Skipped {
                stage,
                reason,
                pattern_id,
            } => {
                log::info!("Message {} skipped: {}", normalized.message_id, reason);
                self.record(StatEvent::Skipped {
                    stage: stage.clone(),
                });
                return Ok(ProcessingOutcome::Skipped {
                    stage,
                    reason,
                    pattern_id,
                });
            }
            PipelineOutcome::Matched(candidate) => candidate,
            PipelineOutcome::Unresolved => match self.analyze(&normalized).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => {
                    log::info!("Message {} unresolved", normalized.message_id);
                    self.record(StatEvent::Unresolved);
                    return Ok(ProcessingOutcome::Unresolved {
                        deep_analysis_error: None,
                    });
                }
                Err(EngineError::DeepAnalysis(e)) => {
                    log::warn!(
                        "Message {} unresolved, deep analysis failed: {}",
                        normalized.message_id,
                        e
                    );
                    self.record(StatEvent::DeepAnalysisFailure);
                    self.record(StatEvent::Unresolved);
                    return Ok(ProcessingOutcome::Unresolved {
                        deep_analysis_error: Some(e.to_string()),
                    });
                }
                Err(e) => return Err(e),
            },
        };

        self.record(StatEvent::StageMatched {
            stage: candidate.stage.clone(),
        });
        self.place(&normalized.message_id, candidate)
    }

    /// Process messages concurrently, at most `workers` at a time. One
    /// message's failure never affects the others.
    pub async fn process_batch(self: Arc<Self>, batch: Vec<Message>) -> Vec<BatchItem> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let ids: Vec<String> = batch.iter().map(|m| m.message_id.clone()).collect();
        let mut tasks = JoinSet::new();

        for (index, message) in batch.into_iter().enumerate() {
            let engine = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => engine.process_message(&message).await,
                    Err(e) => Err(EngineError::Worker(e.to_string())),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<ProcessingOutcome>>> = ids.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => log::error!("Message worker failed: {e}"),
            }
        }

        ids.into_iter()
            .zip(results)
            .map(|(message_id, result)| BatchItem {
                message_id,
                result: result
                    .unwrap_or_else(|| Err(EngineError::Worker("worker task did not finish".to_string()))),
            })
            .collect()
    }

    /// Submit a candidate for an already recorded message, e.g. a
    /// status change or contact proposed by an operator tool.
    pub fn submit_candidate(
        &self,
        message_id: &str,
        candidate: MatchCandidate,
    ) -> Result<ProcessingOutcome> {
        let known = self
            .db
            .with_conn(|conn| messages::get(conn, message_id))?
            .is_some();
        if !known {
            return Err(EngineError::MessageNotFound(message_id.to_string()));
        }
        self.place(message_id, candidate)
    }

    async fn analyze(&self, message: &NormalizedMessage) -> Result<Option<MatchCandidate>> {
        let Some(gateway) = &self.deep_analysis else {
            return Ok(None);
        };
        let entity_list = if gateway.include_entities() {
            Some(self.db.with_conn(entities::list_entities)?)
        } else {
            None
        };
        match gateway.analyze(message, entity_list).await? {
            Some(candidate) => Ok(Some(self.db.with_conn(|conn| follow_redirects(conn, candidate))?)),
            None => Ok(None),
        }
    }

    fn place(&self, message_id: &str, candidate: MatchCandidate) -> Result<ProcessingOutcome> {
        let tier = self
            .router
            .route(clamp_confidence(candidate.confidence), candidate.suggestion_type);

        match self.suggestions.submit(message_id, &candidate, tier)? {
            SubmitOutcome::Discarded {
                existing_id,
                reason,
            } => Ok(ProcessingOutcome::Discarded {
                existing_id,
                reason,
            }),
            SubmitOutcome::Created(suggestion) | SubmitOutcome::Upgraded(suggestion) => {
                self.record(StatEvent::TierRouted {
                    tier: suggestion.tier,
                });
                if suggestion.tier == Tier::AutoApply {
                    self.auto_apply(suggestion)
                } else {
                    Ok(ProcessingOutcome::Queued(suggestion))
                }
            }
        }
    }

    fn auto_apply(&self, suggestion: Suggestion) -> Result<ProcessingOutcome> {
        let id = suggestion.suggestion_id.as_str();
        match self
            .handlers
            .apply(&self.db, id, SuggestionStatus::Pending, SYSTEM_ACTOR)
        {
            Ok(applied) => {
                if let Some(pattern_id) = applied.source.pattern_id() {
                    match self.patterns.touch(pattern_id) {
                        Ok(Some(_)) => {}
                        Ok(None) => log::debug!("Pattern {pattern_id} busy, last use not recorded"),
                        Err(e) => log::warn!("Could not record use of pattern {pattern_id}: {e}"),
                    }
                }
                Ok(ProcessingOutcome::Applied(applied))
            }
            Err(e) if e.is_validation() => {
                log::warn!(
                    "Auto-apply of {} failed validation, routing to individual review: {}",
                    id,
                    e
                );
                let queued = self.db.with_conn(|conn| -> Result<Suggestion> {
                    suggestions::set_tier(conn, id, Tier::IndividualReview)?;
                    load(conn, id)
                })?;
                Ok(ProcessingOutcome::Queued(queued))
            }
            Err(HandlerError::StatusChanged { .. }) => {
                // Someone decided it between submit and apply.
                Ok(ProcessingOutcome::Queued(self.suggestion(id)?))
            }
            Err(e) => {
                let error = e.to_string();
                log::error!("Auto-apply of {id} failed: {error}");
                let failed = self.db.with_tx(|tx| -> Result<Suggestion> {
                    if suggestions::transition(
                        tx,
                        id,
                        SuggestionStatus::Pending,
                        SuggestionStatus::Error,
                        Stamp::Decided(SYSTEM_ACTOR),
                    )? {
                        decision_log::append(
                            tx,
                            id,
                            Some(SuggestionStatus::Pending),
                            SuggestionStatus::Error,
                            SYSTEM_ACTOR,
                            Some(&error),
                        )?;
                    }
                    load(tx, id)
                })?;
                Ok(ProcessingOutcome::ApplyFailed {
                    suggestion: failed,
                    error,
                })
            }
        }
    }

    // ----- decisions -----

    /// Approve, reject or edit one pending suggestion. Two concurrent
    /// decisions on the same suggestion: exactly one wins, the other gets
    /// [`EngineError::DecisionConflict`].
    pub fn decide(&self, request: &DecisionRequest) -> Result<DecisionOutcome> {
        let id = request.suggestion_id.as_str();
        let actor = request.actor.trim();
        if actor.is_empty() {
            return Err(EngineError::InvalidDecision("actor is required".to_string()));
        }
        match (request.decision, &request.corrected_target) {
            (Decision::Edit, None) => {
                return Err(EngineError::InvalidDecision(
                    "edit requires a corrected target".to_string(),
                ))
            }
            (Decision::Approve | Decision::Reject, Some(_)) => {
                return Err(EngineError::InvalidDecision(format!(
                    "{} does not take a corrected target",
                    request.decision
                )))
            }
            _ => {}
        }
        let note = request.note.as_deref().map(str::trim).filter(|n| !n.is_empty());

        let before = self.db.with_tx(|tx| -> Result<Suggestion> {
            let suggestion = load(tx, id)?;
            if supersede_in(tx, &suggestion)? {
                return load(tx, id);
            }
            Ok(suggestion)
        })?;
        if before.status != SuggestionStatus::Pending {
            return Err(EngineError::DecisionConflict {
                suggestion_id: id.to_string(),
                status: before.status,
            });
        }

        // An edit that names the current target is a plain approval.
        let decision = match (&request.decision, &request.corrected_target) {
            (Decision::Edit, Some(target)) if before.target.as_ref() == Some(target) => {
                Decision::Approve
            }
            (decision, _) => *decision,
        };

        // A correction must be appliable before it is claimed or learned from.
        if let (Decision::Edit, Some(corrected)) = (decision, &request.corrected_target) {
            let mut edited = before.clone();
            edited.target = Some(corrected.clone());
            let handler = self.handlers.get(edited.suggestion_type)?;
            match self.db.with_conn(|conn| handler.validate(&edited, conn)) {
                Ok(()) => {}
                Err(e) if e.is_validation() => {
                    return Err(EngineError::InvalidDecision(format!(
                        "corrected target {corrected} is not usable: {e}"
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut warnings = Vec::new();
        let suggestion = match decision {
            Decision::Reject => self.db.with_tx(|tx| -> Result<Suggestion> {
                claim(tx, id, SuggestionStatus::Pending, SuggestionStatus::Rejected, actor, note)?;
                load(tx, id)
            })?,
            Decision::Approve => {
                self.db.with_tx(|tx| {
                    claim(tx, id, SuggestionStatus::Pending, SuggestionStatus::Approved, actor, note)
                })?;
                let (applied, warning) = self.apply_approved(id, actor)?;
                warnings.extend(warning);
                applied
            }
            Decision::Edit => {
                let corrected = request
                    .corrected_target
                    .as_ref()
                    .ok_or_else(|| EngineError::InvalidDecision("edit requires a corrected target".to_string()))?;
                let rationale = edit_rationale(before.target.as_ref(), corrected, note);
                self.db.with_tx(|tx| -> Result<()> {
                    claim(
                        tx,
                        id,
                        SuggestionStatus::Pending,
                        SuggestionStatus::Approved,
                        actor,
                        Some(&rationale),
                    )?;
                    suggestions::set_target(tx, id, corrected)?;
                    Ok(())
                })?;
                let (applied, warning) = self.apply_approved(id, actor)?;
                warnings.extend(warning);
                applied
            }
        };

        log::info!(
            "Suggestion {} {} by {}, now {}",
            id,
            decision,
            actor,
            suggestion.status
        );
        self.record(StatEvent::Decision { decision });

        let pattern_updates = self.learn(decision, &before, request.corrected_target.as_ref(), &mut warnings);

        Ok(DecisionOutcome {
            suggestion,
            pattern_updates,
            warnings,
        })
    }

    /// Apply one decision to many suggestions independently.
    pub fn decide_batch(&self, request: &BatchDecisionRequest) -> Vec<BatchDecisionItem> {
        request
            .suggestion_ids
            .iter()
            .map(|id| {
                let single = DecisionRequest {
                    suggestion_id: id.clone(),
                    decision: request.decision,
                    actor: request.actor.clone(),
                    corrected_target: request.corrected_target.clone(),
                    note: request.note.clone(),
                };
                let result = self.decide(&single);
                if let Err(e) = &result {
                    log::warn!("Batch {} of {} failed: {}", request.decision, id, e);
                }
                BatchDecisionItem {
                    suggestion_id: id.clone(),
                    result,
                }
            })
            .collect()
    }

    /// Returns the suggestion afterwards and the apply error, if any.
    fn apply_approved(&self, id: &str, actor: &str) -> Result<(Suggestion, Option<String>)> {
        match self
            .handlers
            .apply(&self.db, id, SuggestionStatus::Approved, actor)
        {
            Ok(applied) => Ok((applied, None)),
            Err(e) => {
                let error = e.to_string();
                log::warn!("Approved suggestion {id} could not be applied: {error}");
                let failed = self.db.with_tx(|tx| -> Result<Suggestion> {
                    if suggestions::transition(
                        tx,
                        id,
                        SuggestionStatus::Approved,
                        SuggestionStatus::Error,
                        Stamp::Keep,
                    )? {
                        decision_log::append(
                            tx,
                            id,
                            Some(SuggestionStatus::Approved),
                            SuggestionStatus::Error,
                            actor,
                            Some(&error),
                        )?;
                    }
                    load(tx, id)
                })?;
                Ok((failed, Some(format!("apply failed: {error}"))))
            }
        }
    }

    /// Feed a committed decision to the learning loop. Only message links
    /// carry pattern provenance.
    fn learn(
        &self,
        decision: Decision,
        before: &Suggestion,
        corrected: Option<&EntityRef>,
        warnings: &mut Vec<String>,
    ) -> Vec<Pattern> {
        if before.suggestion_type != SuggestionType::LinkMessage {
            return Vec::new();
        }
        let pattern_id = before.source.pattern_id();

        let learned: Result<Vec<Pattern>> = match (decision, pattern_id, corrected) {
            (Decision::Approve, Some(pattern_id), _) => self
                .learning
                .record_approval(pattern_id)
                .map(|p| vec![p])
                .map_err(EngineError::from),
            (Decision::Reject, Some(pattern_id), _) => self
                .learning
                .record_rejection(pattern_id)
                .map(|p| vec![p])
                .map_err(EngineError::from),
            (Decision::Edit, original, Some(corrected)) => self
                .db
                .with_conn(|conn| messages::get(conn, &before.message_id))
                .map_err(EngineError::from)
                .and_then(|message| {
                    message.ok_or_else(|| EngineError::MessageNotFound(before.message_id.clone()))
                })
                .and_then(|message| {
                    let result = self.learning.record_correction(original, &message, corrected)?;
                    Ok(result
                        .rejected
                        .into_iter()
                        .chain(std::iter::once(result.outcome.pattern().clone()))
                        .collect())
                }),
            _ => Ok(Vec::new()),
        };

        match learned {
            Ok(patterns) => patterns,
            Err(e) => {
                log::warn!(
                    "Learning from {} on {} failed: {}",
                    decision,
                    before.suggestion_id,
                    e
                );
                warnings.push(format!("learning failed: {e}"));
                Vec::new()
            }
        }
    }

    // ----- recovery -----

    pub fn rollback(
        &self,
        suggestion_id: &str,
        actor: &str,
        disposition: RollbackDisposition,
        note: Option<&str>,
    ) -> Result<Suggestion> {
        let current = self.suggestion(suggestion_id)?;
        if current.status != SuggestionStatus::Applied {
            return Err(EngineError::InvalidTransition {
                suggestion_id: suggestion_id.to_string(),
                from: current.status,
                to: SuggestionStatus::RolledBack,
            });
        }

        match self
            .handlers
            .rollback(&self.db, suggestion_id, actor, disposition, note)
        {
            Ok(rolled_back) => {
                self.record(StatEvent::Rollback);
                Ok(rolled_back)
            }
            Err(HandlerError::StatusChanged { .. }) => Err(self.conflict(suggestion_id)),
            Err(e) => {
                let rationale = format!("rollback failed: {e}");
                log::warn!("Suggestion {suggestion_id}: {rationale}");
                self.db.with_tx(|tx| -> Result<()> {
                    if suggestions::current_status(tx, suggestion_id)? == Some(SuggestionStatus::Applied) {
                        decision_log::append(
                            tx,
                            suggestion_id,
                            Some(SuggestionStatus::Applied),
                            SuggestionStatus::Applied,
                            actor,
                            Some(&rationale),
                        )?;
                    }
                    Ok(())
                })?;
                Err(e.into())
            }
        }
    }

    /// Apply a suggestion left in `error` by a failed apply.
    pub fn retry_apply(&self, suggestion_id: &str, actor: &str) -> Result<Suggestion> {
        let current = self.suggestion(suggestion_id)?;
        if current.status != SuggestionStatus::Error {
            return Err(EngineError::InvalidTransition {
                suggestion_id: suggestion_id.to_string(),
                from: current.status,
                to: SuggestionStatus::Applied,
            });
        }

        match self
            .handlers
            .apply(&self.db, suggestion_id, SuggestionStatus::Error, actor)
        {
            Ok(applied) => Ok(applied),
            Err(HandlerError::StatusChanged { .. }) => Err(self.conflict(suggestion_id)),
            Err(e) => {
                let rationale = format!("retry failed: {e}");
                log::warn!("Suggestion {suggestion_id}: {rationale}");
                self.db.with_tx(|tx| -> Result<()> {
                    decision_log::append(
                        tx,
                        suggestion_id,
                        Some(SuggestionStatus::Error),
                        SuggestionStatus::Error,
                        actor,
                        Some(&rationale),
                    )?;
                    Ok(())
                })?;
                Err(e.into())
            }
        }
    }

    // ----- review -----

    /// Mark pending link suggestions whose thread a newer message has since
    /// resolved as stale. Returns how many changed.
    pub fn sweep_superseded(&self) -> Result<usize> {
        self.db.with_tx(|tx| -> Result<usize> {
            let mut superseded = 0;
            for suggestion in suggestions::list_by_status(tx, SuggestionStatus::Pending)? {
                if supersede_in(tx, &suggestion)? {
                    superseded += 1;
                }
            }
            Ok(superseded)
        })
    }

    pub fn review_queue(&self) -> Result<ReviewQueue> {
        let superseded = self.sweep_superseded()?;

        self.db.with_conn(|conn| -> Result<ReviewQueue> {
            let mut batch = Vec::new();
            let mut individual = Vec::new();

            for suggestion in suggestions::list_reviewable(conn)? {
                let (sender, subject) = messages::get(conn, &suggestion.message_id)?
                    .map(|m| (m.sender, m.subject))
                    .unwrap_or_default();
                let preview = self
                    .handlers
                    .preview_in(conn, &suggestion)
                    .unwrap_or_else(|e| format!("preview unavailable: {e}"));
                let tier = suggestion.tier;
                let item = ReviewItem {
                    suggestion,
                    sender,
                    subject,
                    preview,
                };
                if tier == Tier::BatchReview {
                    batch.push((item.sender.clone(), item));
                } else {
                    individual.push(item);
                }
            }

            Ok(ReviewQueue {
                batches: group_by_sender(batch),
                individual,
                superseded,
            })
        })
    }

    pub fn suggestion(&self, suggestion_id: &str) -> Result<Suggestion> {
        self.db
            .with_conn(|conn| load(conn, suggestion_id))
    }

    pub fn suggestions_for_message(&self, message_id: &str) -> Result<Vec<Suggestion>> {
        Ok(self
            .db
            .with_conn(|conn| suggestions::for_message(conn, message_id))?)
    }

    pub fn decision_history(&self, suggestion_id: &str) -> Result<Vec<DecisionLogEntry>> {
        Ok(self.decision_log.history(suggestion_id)?)
    }

    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<DecisionLogEntry>> {
        Ok(self.decision_log.recent(limit)?)
    }

    fn conflict(&self, suggestion_id: &str) -> EngineError {
        match self.suggestion(suggestion_id) {
            Ok(current) => EngineError::DecisionConflict {
                suggestion_id: suggestion_id.to_string(),
                status: current.status,
            },
            Err(e) => e,
        }
    }

    // ----- pattern and entity administration -----

    pub fn create_pattern(&self, new: NewPattern) -> Result<Pattern> {
        let pattern = self.patterns.create(new)?;
        log::info!(
            "Created {} pattern {} '{}'",
            pattern.pattern_type,
            pattern.pattern_id,
            pattern.pattern_key
        );
        Ok(pattern)
    }

    pub fn deactivate_pattern(&self, pattern_id: &str) -> Result<Pattern> {
        let pattern = self.patterns.deactivate(pattern_id)?;
        log::info!("Deactivated pattern {pattern_id}");
        Ok(pattern)
    }

    pub fn adjust_confidence(&self, pattern_id: &str, confidence: f64) -> Result<Pattern> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::InvalidDecision(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }
        Ok(self.patterns.set_confidence(pattern_id, confidence)?)
    }

    pub fn annotate_pattern(&self, pattern_id: &str, notes: &str) -> Result<Pattern> {
        Ok(self.patterns.annotate(pattern_id, notes)?)
    }

    pub fn pattern(&self, pattern_id: &str) -> Result<Option<Pattern>> {
        Ok(self.patterns.get(pattern_id)?)
    }

    pub fn list_patterns(&self, include_inactive: bool) -> Result<Vec<Pattern>> {
        Ok(self.patterns.list(include_inactive)?)
    }

    pub fn register_entity(&self, entity: &Entity) -> Result<()> {
        self.entities.register(entity)?;
        log::debug!("Registered {} ({})", entity.entity, entity.name);
        Ok(())
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }
}

fn load(conn: &Connection, suggestion_id: &str) -> Result<Suggestion> {
    suggestions::get(conn, suggestion_id)?
        .ok_or_else(|| EngineError::SuggestionNotFound(suggestion_id.to_string()))
}

/// Conditionally move `from -> to` and log it; the loser of a race gets a conflict.
fn claim(
    conn: &Connection,
    suggestion_id: &str,
    from: SuggestionStatus,
    to: SuggestionStatus,
    actor: &str,
    rationale: Option<&str>,
) -> Result<()> {
    if !suggestions::transition(conn, suggestion_id, from, to, Stamp::Decided(actor))? {
        let status = suggestions::current_status(conn, suggestion_id)?
            .ok_or_else(|| EngineError::SuggestionNotFound(suggestion_id.to_string()))?;
        return Err(EngineError::DecisionConflict {
            suggestion_id: suggestion_id.to_string(),
            status,
        });
    }
    decision_log::append(conn, suggestion_id, Some(from), to, actor, rationale)?;
    Ok(())
}

/// Stale a pending link suggestion when a newer message in the same thread
/// has been linked since.
fn supersede_in(conn: &Connection, suggestion: &Suggestion) -> Result<bool> {
    if suggestion.status != SuggestionStatus::Pending
        || suggestion.suggestion_type != SuggestionType::LinkMessage
    {
        return Ok(false);
    }
    let Some(message) = messages::get(conn, &suggestion.message_id)? else {
        return Ok(false);
    };
    let Some(thread_id) = message.thread_id.as_deref() else {
        return Ok(false);
    };
    let Some(newer) =
        entities::newer_thread_link(conn, thread_id, &message.received_at, &message.message_id)?
    else {
        return Ok(false);
    };

    let id = suggestion.suggestion_id.as_str();
    if !suggestions::transition(
        conn,
        id,
        SuggestionStatus::Pending,
        SuggestionStatus::Stale,
        Stamp::Decided(SYSTEM_ACTOR),
    )? {
        return Ok(false);
    }
    let rationale = format!(
        "thread {} resolved to {} by newer message {}",
        thread_id, newer.target, newer.message_id
    );
    decision_log::append(
        conn,
        id,
        Some(SuggestionStatus::Pending),
        SuggestionStatus::Stale,
        SYSTEM_ACTOR,
        Some(&rationale),
    )?;
    log::info!("Suggestion {id} superseded: {rationale}");
    Ok(true)
}

fn edit_rationale(original: Option<&EntityRef>, corrected: &EntityRef, note: Option<&str>) -> String {
    let original = original.map_or_else(|| "none".to_string(), |t| t.to_string());
    match note {
        Some(note) => format!("target corrected from {original} to {corrected}: {note}"),
        None => format!("target corrected from {original} to {corrected}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deep_analysis::AnalysisRequest;
    use crate::error::DeepAnalysisError;
    use crate::types::{PatternType, SuggestionSource};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn engine() -> Engine {
        let mut config = EngineConfig::default();
        config.statistics = None;
        let engine = Engine::new(config, Database::open_in_memory().unwrap()).unwrap();
        for (id, code) in [("p1", "PRJ-2024-001"), ("p2", "PRJ-2024-002")] {
            engine
                .register_entity(&Entity {
                    entity: EntityRef::project(id),
                    code: Some(code.to_string()),
                    name: format!("Project {id}"),
                    status: "active".to_string(),
                })
                .unwrap();
        }
        engine
    }

    fn pattern(engine: &Engine, kind: PatternType, key: &str, target: &str, confidence: f64) -> Pattern {
        engine
            .create_pattern(NewPattern::new(kind, key, Some(EntityRef::project(target)), confidence))
            .unwrap()
    }

    struct SlowAnalyzer;

    #[async_trait]
    impl DeepAnalyzer for SlowAnalyzer {
        fn name(&self) -> &str {
            "slow"
        }

        async fn analyze(
            &self,
            _request: &AnalysisRequest,
        ) -> std::result::Result<Option<crate::deep_analysis::AnalysisResponse>, DeepAnalysisError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_skip_rule_produces_no_suggestion() {
        let engine = engine();
        let outcome = engine
            .process_message(&Message::new("m1", "noreply@vendor.com"))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessingOutcome::Skipped { .. }));
        assert!(engine.suggestions_for_message("m1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_code_in_subject_auto_applies() {
        let engine = engine();
        let outcome = engine
            .process_message(&Message::new("m1", "someone@anywhere.org").with_subject("Re: PRJ-2024-002 drawings"))
            .await
            .unwrap();
        let applied = match outcome {
            ProcessingOutcome::Applied(s) => s,
            other => panic!("expected auto-apply, got {other:?}"),
        };
        assert_eq!(applied.source, SuggestionSource::CodeExtraction);
        assert_eq!(applied.decided_by.as_deref(), Some(SYSTEM_ACTOR));
        let link = engine.entities().link_for("m1").unwrap().unwrap();
        assert_eq!(link.target, EntityRef::project("p2"));
    }

    #[tokio::test]
    async fn test_invalid_auto_apply_target_goes_to_review() {
        let engine = engine();
        pattern(&engine, PatternType::DomainEntity, "client.com", "ghost", 0.95);
        let outcome = engine
            .process_message(&Message::new("m1", "pm@client.com"))
            .await
            .unwrap();
        let queued = match outcome {
            ProcessingOutcome::Queued(s) => s,
            other => panic!("expected queued, got {other:?}"),
        };
        assert_eq!(queued.status, SuggestionStatus::Pending);
        assert_eq!(queued.tier, Tier::IndividualReview);
        assert_eq!(engine.review_queue().unwrap().individual.len(), 1);
    }

    #[tokio::test]
    async fn test_deep_analysis_timeout_falls_through() {
        let mut config = EngineConfig::default();
        config.statistics = None;
        config.deep_analysis.timeout_ms = 20;
        let engine = Engine::new(config, Database::open_in_memory().unwrap())
            .unwrap()
            .with_analyzer(Arc::new(SlowAnalyzer));

        let outcome = engine
            .process_message(&Message::new("m1", "stranger@unknown.net"))
            .await
            .unwrap();
        match outcome {
            ProcessingOutcome::Unresolved { deep_analysis_error } => {
                assert!(deep_analysis_error.unwrap().contains("timed out"));
            }
            other => panic!("expected unresolved, got {other:?}"),
        }
        assert_eq!(engine.deep_analysis_health().unwrap().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_supersession_stales_older_pending_link() {
        let engine = engine();
        pattern(&engine, PatternType::SenderEntity, "pm@client.com", "p1", 0.6);
        pattern(&engine, PatternType::DomainEntity, "partner.com", "p1", 0.95);

        let earlier = Utc::now() - Duration::hours(2);
        let first = engine
            .process_message(&Message::new("m1", "pm@client.com").with_thread("t1").received(earlier))
            .await
            .unwrap();
        let stale_id = first.suggestion().unwrap().suggestion_id.clone();

        let second = engine
            .process_message(&Message::new("m2", "ops@partner.com").with_thread("t1"))
            .await
            .unwrap();
        assert!(matches!(second, ProcessingOutcome::Applied(_)));

        let queue = engine.review_queue().unwrap();
        assert_eq!(queue.superseded, 1);
        assert!(queue.is_empty());

        let err = engine
            .decide(&DecisionRequest::approve(&stale_id, "alice"))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DecisionConflict {
                status: SuggestionStatus::Stale,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rollback_requeues_for_review() {
        let engine = engine();
        pattern(&engine, PatternType::DomainEntity, "client.com", "p1", 0.95);
        let outcome = engine
            .process_message(&Message::new("m1", "pm@client.com"))
            .await
            .unwrap();
        let id = outcome.suggestion().unwrap().suggestion_id.clone();

        let rolled = engine
            .rollback(&id, "alice", RollbackDisposition::ReturnToPending, Some("wrong project"))
            .unwrap();
        assert_eq!(rolled.status, SuggestionStatus::Pending);
        assert_eq!(rolled.tier, Tier::IndividualReview);
        assert!(engine.entities().link_for("m1").unwrap().is_none());
        assert_eq!(engine.review_queue().unwrap().individual.len(), 1);

        // Rolling back something that is not applied is refused.
        assert!(matches!(
            engine.rollback(&id, "alice", RollbackDisposition::Discard, None),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_apply_then_retry() {
        let engine = engine();
        engine
            .process_message(&Message::new("m1", "stranger@unknown.net"))
            .await
            .unwrap();

        let candidate = MatchCandidate::link(
            EntityRef::project("p9"),
            0.6,
            SuggestionSource::Operator,
            "operator",
        );
        let id = engine
            .submit_candidate("m1", candidate)
            .unwrap()
            .suggestion()
            .unwrap()
            .suggestion_id
            .clone();

        let outcome = engine.decide(&DecisionRequest::approve(&id, "alice")).unwrap();
        assert_eq!(outcome.status(), SuggestionStatus::Error);
        assert_eq!(outcome.warnings.len(), 1);

        engine
            .register_entity(&Entity {
                entity: EntityRef::project("p9"),
                code: None,
                name: "Late arrival".to_string(),
                status: "active".to_string(),
            })
            .unwrap();
        let applied = engine.retry_apply(&id, "alice").unwrap();
        assert_eq!(applied.status, SuggestionStatus::Applied);

        let transitions: Vec<_> = engine
            .decision_history(&id)
            .unwrap()
            .into_iter()
            .map(|e| (e.from_status, e.to_status))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (None, SuggestionStatus::Pending),
                (Some(SuggestionStatus::Pending), SuggestionStatus::Approved),
                (Some(SuggestionStatus::Approved), SuggestionStatus::Error),
                (Some(SuggestionStatus::Error), SuggestionStatus::Applied),
            ]
        );
    }

    #[tokio::test]
    async fn test_status_suggestions_never_auto_apply() {
        let engine = engine();
        engine
            .process_message(&Message::new("m1", "stranger@unknown.net"))
            .await
            .unwrap();
        let candidate = MatchCandidate {
            suggestion_type: SuggestionType::UpdateEntityStatus,
            target: Some(EntityRef::project("p1")),
            confidence: 0.99,
            source: SuggestionSource::Operator,
            stage: "operator".to_string(),
            rationale: None,
            details: json!({ "status": "won" }),
        };
        let outcome = engine.submit_candidate("m1", candidate).unwrap();
        let queued = outcome.suggestion().unwrap();
        assert_eq!(queued.tier, Tier::IndividualReview);
        assert_eq!(queued.status, SuggestionStatus::Pending);

        let queue = engine.review_queue().unwrap();
        assert_eq!(
            queue.individual[0].preview,
            "Change project:p1 status from 'active' to 'won'"
        );
    }

    #[test]
    fn test_decision_request_validation() {
        let engine = engine();
        assert!(matches!(
            engine.decide(&DecisionRequest::approve("s1", "  ")),
            Err(EngineError::InvalidDecision(_))
        ));
        let mut edit = DecisionRequest::edit("s1", "alice", EntityRef::project("p1"));
        edit.corrected_target = None;
        assert!(matches!(engine.decide(&edit), Err(EngineError::InvalidDecision(_))));
        assert!(matches!(
            engine.decide(&DecisionRequest::reject("missing", "alice")),
            Err(EngineError::SuggestionNotFound(_))
        ));
        assert_eq!("Approve".parse::<Decision>().unwrap(), Decision::Approve);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn test_adjust_confidence_bounds() {
        let engine = engine();
        let p = pattern(&engine, PatternType::KeywordEntity, "harbor view", "p1", 0.5);
        assert!(engine.adjust_confidence(&p.pattern_id, 1.5).is_err());
        assert_eq!(engine.adjust_confidence(&p.pattern_id, 0.8).unwrap().confidence, 0.8);
        let annotated = engine.annotate_pattern(&p.pattern_id, "seeded by ops").unwrap();
        assert_eq!(annotated.notes.as_deref(), Some("seeded by ops"));
        let retired = engine.deactivate_pattern(&p.pattern_id).unwrap();
        assert!(!retired.is_active);
        assert!(engine.list_patterns(false).unwrap().is_empty());
        assert_eq!(engine.list_patterns(true).unwrap().len(), 1);
    }
}
