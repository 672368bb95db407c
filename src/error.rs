//! Error types for the mail intelligence engine.

use std::time::Duration;

use thiserror::Error;

use crate::types::{SuggestionStatus, SuggestionType};

/// Top-level error returned by the engine's public operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Deep analysis error: {0}")]
    DeepAnalysis(#[from] DeepAnalysisError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Suggestion {suggestion_id} was already decided (current status: {status})")]
    DecisionConflict {
        suggestion_id: String,
        status: SuggestionStatus,
    },

    #[error("Suggestion {suggestion_id} cannot move from {from} to {to}")]
    InvalidTransition {
        suggestion_id: String,
        from: SuggestionStatus,
        to: SuggestionStatus,
    },

    #[error("Suggestion not found: {0}")]
    SuggestionNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// A message that cannot be normalized. Skipped and logged, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestionError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid sender address: {0}")]
    InvalidSender(String),
}

/// Storage-level failures, including pattern compare-and-swap exhaustion.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Concurrent update on pattern {pattern_id} did not settle after {attempts} attempts")]
    PatternWriteConflict { pattern_id: String, attempts: u32 },

    #[error("Pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the external deep analysis adapter.
#[derive(Error, Debug)]
pub enum DeepAnalysisError {
    #[error("Deep analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("Deep analysis adapter unavailable: {0}")]
    Unavailable(String),

    #[error("Deep analysis returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised by suggestion handlers and the registry around them.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Validation failed: {}", .reasons.join("; "))]
    Validation { reasons: Vec<String> },

    #[error("Apply failed: {0}")]
    ApplyFailure(String),

    #[error("Rollback failed: {0}")]
    RollbackFailure(String),

    #[error("No handler registered for suggestion type {0}")]
    NoHandler(SuggestionType),

    #[error("Suggestion {0} has no apply snapshot to roll back")]
    MissingSnapshot(String),

    #[error("Suggestion {suggestion_id} changed status concurrently (expected {expected})")]
    StatusChanged {
        suggestion_id: String,
        expected: SuggestionStatus,
    },

    #[error("Invalid suggestion details: {0}")]
    InvalidDetails(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn validation(reasons: Vec<String>) -> Self {
        HandlerError::Validation { reasons }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, HandlerError::Validation { .. })
    }
}

/// Configuration load and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid regex '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Store(StoreError::Sqlite(e))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
