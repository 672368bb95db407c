//! Core records shared by the pipeline, the stores and the review flow.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Kind of rule a [`Pattern`] encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    SenderEntity,
    DomainEntity,
    KeywordEntity,
    ThreadEntity,
    SenderSkip,
    DomainSkip,
    EntityRedirect,
}

impl PatternType {
    pub const ALL: [PatternType; 7] = [
        PatternType::SenderEntity,
        PatternType::DomainEntity,
        PatternType::KeywordEntity,
        PatternType::ThreadEntity,
        PatternType::SenderSkip,
        PatternType::DomainSkip,
        PatternType::EntityRedirect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::SenderEntity => "sender_entity",
            PatternType::DomainEntity => "domain_entity",
            PatternType::KeywordEntity => "keyword_entity",
            PatternType::ThreadEntity => "thread_entity",
            PatternType::SenderSkip => "sender_skip",
            PatternType::DomainSkip => "domain_skip",
            PatternType::EntityRedirect => "entity_redirect",
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, PatternType::SenderSkip | PatternType::DomainSkip)
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PatternType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown pattern type '{s}'")))
    }
}

/// Business entity kinds a message can be linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    Proposal,
    Skip,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Project => "project",
            EntityType::Proposal => "proposal",
            EntityType::Skip => "skip",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(EntityType::Project),
            "proposal" => Ok(EntityType::Proposal),
            "skip" => Ok(EntityType::Skip),
            other => Err(StoreError::InvalidRow(format!("unknown entity type '{other}'"))),
        }
    }
}

/// A typed pointer to a project or proposal, rendered as `project:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn project(entity_id: impl Into<String>) -> Self {
        Self::new(EntityType::Project, entity_id)
    }

    pub fn proposal(entity_id: impl Into<String>) -> Self {
        Self::new(EntityType::Proposal, entity_id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for EntityRef {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidRow(format!("entity reference '{s}' is not <type>:<id>")))?;
        if id.is_empty() {
            return Err(StoreError::InvalidRow(format!("entity reference '{s}' has no id")));
        }
        Ok(EntityRef::new(kind.parse()?, id))
    }
}

/// A learned (or operator-authored) matching rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub pattern_type: PatternType,
    pub pattern_key: String,
    pub target_entity_type: EntityType,
    pub target_entity_id: Option<String>,
    pub confidence: f64,
    pub times_used: u32,
    pub times_correct: u32,
    pub times_rejected: u32,
    pub is_active: bool,
    pub version: i64,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Pattern {
    /// Target entity, absent for skip patterns.
    pub fn target(&self) -> Option<EntityRef> {
        match (&self.target_entity_type, &self.target_entity_id) {
            (EntityType::Skip, _) | (_, None) => None,
            (kind, Some(id)) => Some(EntityRef::new(*kind, id.clone())),
        }
    }
}

/// Input for creating a pattern through administration or promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPattern {
    pub pattern_type: PatternType,
    pub pattern_key: String,
    pub target: Option<EntityRef>,
    pub confidence: f64,
    #[serde(default)]
    pub times_used: u32,
    #[serde(default)]
    pub times_correct: u32,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewPattern {
    pub fn new(pattern_type: PatternType, pattern_key: impl Into<String>, target: Option<EntityRef>, confidence: f64) -> Self {
        Self {
            pattern_type,
            pattern_key: pattern_key.into(),
            target,
            confidence,
            times_used: 0,
            times_correct: 0,
            notes: None,
        }
    }
}

/// Actions a suggestion can propose; each kind has its own handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionType {
    #[default]
    LinkMessage,
    UpdateEntityStatus,
    CreateContact,
    FlagDeadline,
}

impl SuggestionType {
    pub const ALL: [SuggestionType; 4] = [
        SuggestionType::LinkMessage,
        SuggestionType::UpdateEntityStatus,
        SuggestionType::CreateContact,
        SuggestionType::FlagDeadline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionType::LinkMessage => "link_message",
            SuggestionType::UpdateEntityStatus => "update_entity_status",
            SuggestionType::CreateContact => "create_contact",
            SuggestionType::FlagDeadline => "flag_deadline",
        }
    }
}

impl fmt::Display for SuggestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SuggestionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown suggestion type '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    RolledBack,
    Error,
    Stale,
    Discarded,
}

impl SuggestionStatus {
    const ALL: [SuggestionStatus; 8] = [
        SuggestionStatus::Pending,
        SuggestionStatus::Approved,
        SuggestionStatus::Rejected,
        SuggestionStatus::Applied,
        SuggestionStatus::RolledBack,
        SuggestionStatus::Error,
        SuggestionStatus::Stale,
        SuggestionStatus::Discarded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Applied => "applied",
            SuggestionStatus::RolledBack => "rolled_back",
            SuggestionStatus::Error => "error",
            SuggestionStatus::Stale => "stale",
            SuggestionStatus::Discarded => "discarded",
        }
    }

    /// No further transitions are possible from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SuggestionStatus::Rejected | SuggestionStatus::Stale | SuggestionStatus::Discarded
        )
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SuggestionStatus::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown suggestion status '{s}'")))
    }
}

/// Where a candidate match came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "pattern_id")]
pub enum SuggestionSource {
    Pattern(String),
    DeepAnalysis,
    ThreadInheritance,
    CodeExtraction,
    Operator,
}

impl SuggestionSource {
    pub fn pattern_id(&self) -> Option<&str> {
        match self {
            SuggestionSource::Pattern(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for SuggestionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuggestionSource::Pattern(id) => write!(f, "pattern:{id}"),
            SuggestionSource::DeepAnalysis => f.write_str("deep_analysis"),
            SuggestionSource::ThreadInheritance => f.write_str("thread_inheritance"),
            SuggestionSource::CodeExtraction => f.write_str("code_extraction"),
            SuggestionSource::Operator => f.write_str("operator"),
        }
    }
}

impl FromStr for SuggestionSource {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix("pattern:") {
            return Ok(SuggestionSource::Pattern(id.to_string()));
        }
        match s {
            "deep_analysis" => Ok(SuggestionSource::DeepAnalysis),
            "thread_inheritance" => Ok(SuggestionSource::ThreadInheritance),
            "code_extraction" => Ok(SuggestionSource::CodeExtraction),
            "operator" => Ok(SuggestionSource::Operator),
            other => Err(StoreError::InvalidRow(format!("unknown suggestion source '{other}'"))),
        }
    }
}

/// Review-urgency bucket assigned by the tier router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    AutoApply,
    BatchReview,
    IndividualReview,
    LogOnly,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::AutoApply => "auto_apply",
            Tier::BatchReview => "batch_review",
            Tier::IndividualReview => "individual_review",
            Tier::LogOnly => "log_only",
        }
    }

    /// Whether suggestions in this tier appear in the review queue.
    pub fn is_reviewable(&self) -> bool {
        matches!(self, Tier::BatchReview | Tier::IndividualReview)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_apply" => Ok(Tier::AutoApply),
            "batch_review" => Ok(Tier::BatchReview),
            "individual_review" => Ok(Tier::IndividualReview),
            "log_only" => Ok(Tier::LogOnly),
            other => Err(StoreError::InvalidRow(format!("unknown tier '{other}'"))),
        }
    }
}

/// Output of the matching pipeline or the deep analysis adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub suggestion_type: SuggestionType,
    pub target: Option<EntityRef>,
    pub confidence: f64,
    pub source: SuggestionSource,
    /// Name of the stage that produced the candidate.
    pub stage: String,
    pub rationale: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl MatchCandidate {
    pub fn link(target: EntityRef, confidence: f64, source: SuggestionSource, stage: &str) -> Self {
        Self {
            suggestion_type: SuggestionType::LinkMessage,
            target: Some(target),
            confidence,
            source,
            stage: stage.to_string(),
            rationale: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }
}

/// A persisted proposal awaiting, or having received, a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub suggestion_id: String,
    pub message_id: String,
    pub suggestion_type: SuggestionType,
    pub target: Option<EntityRef>,
    pub confidence: f64,
    pub source: SuggestionSource,
    pub status: SuggestionStatus,
    pub tier: Tier,
    pub details: serde_json::Value,
    pub rationale: Option<String>,
    pub apply_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
}

/// One row of the append-only decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub entry_id: i64,
    pub suggestion_id: String,
    /// `None` when the entry records the suggestion's creation.
    pub from_status: Option<SuggestionStatus>,
    pub to_status: SuggestionStatus,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub rationale: Option<String>,
}

/// A tracked project or proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity: EntityRef,
    /// Structured code such as `PRJ-2024-001` quoted in correspondence.
    pub code: Option<String>,
    pub name: String,
    pub status: String,
}
