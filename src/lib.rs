pub mod components;
pub mod config;
pub mod deep_analysis;
pub mod domain_utils;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod learning;
pub mod message;
pub mod statistics;
pub mod store;
pub mod suggestion_engine;
pub mod tier_router;
pub mod types;

pub use config::EngineConfig;
pub use deep_analysis::{AnalysisRequest, AnalysisResponse, DeepAnalyzer, HttpAnalyzer, NoopAnalyzer};
pub use engine::{
    BatchDecisionRequest, Decision, DecisionOutcome, DecisionRequest, Engine, ProcessingOutcome,
    ReviewQueue,
};
pub use error::{EngineError, Result};
pub use handlers::{HandlerRegistry, RollbackDisposition, SuggestionHandler};
pub use message::{Direction, Message, NormalizedMessage};
pub use statistics::{StatEvent, StatisticsCollector};
pub use store::Database;
pub use types::{
    Entity, EntityRef, EntityType, MatchCandidate, NewPattern, Pattern, PatternType, Suggestion,
    SuggestionSource, SuggestionStatus, SuggestionType, Tier,
};
