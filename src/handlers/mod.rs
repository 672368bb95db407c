//! Suggestion handlers, one per suggestion kind, and the registry that owns
//! the transaction around apply and rollback.
//!
//! A handler's writes, the captured snapshot, the status change and the
//! decision log entry commit together or not at all.

pub mod create_contact;
pub mod flag_deadline;
pub mod link_message;
pub mod update_status;

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use serde_json::Value;

use crate::error::HandlerError;
use crate::message::NormalizedMessage;
use crate::store::{decision_log, entities, messages, suggestions, Database};
use crate::store::suggestions::Stamp;
use crate::types::{Entity, EntityRef, Suggestion, SuggestionStatus, SuggestionType, Tier};

pub use create_contact::CreateContactHandler;
pub use flag_deadline::FlagDeadlineHandler;
pub use link_message::LinkMessageHandler;
pub use update_status::UpdateStatusHandler;

/// Trait for all suggestion handlers
pub trait SuggestionHandler: Send + Sync {
    fn kind(&self) -> SuggestionType;

    /// Referential checks only; never writes.
    fn validate(&self, suggestion: &Suggestion, conn: &Connection) -> Result<(), HandlerError>;

    /// Human-readable description of what apply would do; never writes.
    fn preview(&self, suggestion: &Suggestion, conn: &Connection) -> Result<String, HandlerError>;

    /// Perform the change and return the prior state needed to undo it.
    fn apply(&self, suggestion: &Suggestion, conn: &Connection) -> Result<Value, HandlerError>;

    /// Restore the state captured by `apply`.
    fn rollback(
        &self,
        suggestion: &Suggestion,
        snapshot: &Value,
        conn: &Connection,
    ) -> Result<(), HandlerError>;
}

/// What happens to a suggestion after its change is rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackDisposition {
    /// Back to the review queue, unless another pending suggestion took its place.
    ReturnToPending,
    Discard,
}

pub struct HandlerRegistry {
    handlers: HashMap<SuggestionType, Arc<dyn SuggestionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the built-in handler for every suggestion kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LinkMessageHandler));
        registry.register(Arc::new(UpdateStatusHandler));
        registry.register(Arc::new(CreateContactHandler));
        registry.register(Arc::new(FlagDeadlineHandler));
        registry
    }

    /// Register a handler, replacing any previous handler of the same kind.
    pub fn register(&mut self, handler: Arc<dyn SuggestionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: SuggestionType) -> Result<Arc<dyn SuggestionHandler>, HandlerError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(HandlerError::NoHandler(kind))
    }

    pub fn kinds(&self) -> Vec<SuggestionType> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn validate(&self, db: &Database, suggestion: &Suggestion) -> Result<(), HandlerError> {
        let handler = self.get(suggestion.suggestion_type)?;
        db.with_conn(|conn| handler.validate(suggestion, conn))
    }

    pub fn preview(&self, db: &Database, suggestion: &Suggestion) -> Result<String, HandlerError> {
        let handler = self.get(suggestion.suggestion_type)?;
        db.with_conn(|conn| handler.preview(suggestion, conn))
    }

    pub(crate) fn preview_in(
        &self,
        conn: &Connection,
        suggestion: &Suggestion,
    ) -> Result<String, HandlerError> {
        self.get(suggestion.suggestion_type)?.preview(suggestion, conn)
    }

    /// Validate and apply `suggestion_id`, moving it from `from` to applied.
    /// Nothing is written unless every step succeeds.
    pub fn apply(
        &self,
        db: &Database,
        suggestion_id: &str,
        from: SuggestionStatus,
        actor: &str,
    ) -> Result<Suggestion, HandlerError> {
        db.with_tx(|tx| {
            let suggestion = load(tx, suggestion_id)?;
            if suggestion.status != from {
                return Err(HandlerError::StatusChanged {
                    suggestion_id: suggestion_id.to_string(),
                    expected: from,
                });
            }

            let handler = self.get(suggestion.suggestion_type)?;
            handler.validate(&suggestion, tx)?;
            let snapshot = handler.apply(&suggestion, tx)?;

            suggestions::set_snapshot(tx, suggestion_id, Some(&snapshot))?;
            if !suggestions::transition(tx, suggestion_id, from, SuggestionStatus::Applied, Stamp::Decided(actor))? {
                return Err(HandlerError::StatusChanged {
                    suggestion_id: suggestion_id.to_string(),
                    expected: from,
                });
            }
            decision_log::append(tx, suggestion_id, Some(from), SuggestionStatus::Applied, actor, None)?;

            log::info!(
                "Applied {} suggestion {} ({} -> applied, by {})",
                suggestion.suggestion_type,
                suggestion_id,
                from,
                actor
            );
            load(tx, suggestion_id)
        })
    }

    /// Undo an applied suggestion and move it to pending or discarded.
    pub fn rollback(
        &self,
        db: &Database,
        suggestion_id: &str,
        actor: &str,
        disposition: RollbackDisposition,
        note: Option<&str>,
    ) -> Result<Suggestion, HandlerError> {
        db.with_tx(|tx| {
            let suggestion = load(tx, suggestion_id)?;
            if suggestion.status != SuggestionStatus::Applied {
                return Err(HandlerError::StatusChanged {
                    suggestion_id: suggestion_id.to_string(),
                    expected: SuggestionStatus::Applied,
                });
            }
            let snapshot = suggestion
                .apply_snapshot
                .clone()
                .ok_or_else(|| HandlerError::MissingSnapshot(suggestion_id.to_string()))?;

            let handler = self.get(suggestion.suggestion_type)?;
            handler.rollback(&suggestion, &snapshot, tx)?;

            if !suggestions::transition(
                tx,
                suggestion_id,
                SuggestionStatus::Applied,
                SuggestionStatus::RolledBack,
                Stamp::Keep,
            )? {
                return Err(HandlerError::StatusChanged {
                    suggestion_id: suggestion_id.to_string(),
                    expected: SuggestionStatus::Applied,
                });
            }
            decision_log::append(
                tx,
                suggestion_id,
                Some(SuggestionStatus::Applied),
                SuggestionStatus::RolledBack,
                actor,
                note,
            )?;
            suggestions::set_snapshot(tx, suggestion_id, None)?;

            let requeue = disposition == RollbackDisposition::ReturnToPending;
            let replaced =
                requeue && suggestions::find_pending(tx, &suggestion.message_id, suggestion.suggestion_type)?.is_some();
            let (next, stamp, rationale) = if requeue && !replaced {
                (SuggestionStatus::Pending, Stamp::Clear, None)
            } else if replaced {
                (
                    SuggestionStatus::Discarded,
                    Stamp::Keep,
                    Some("another pending suggestion exists for this message"),
                )
            } else {
                (SuggestionStatus::Discarded, Stamp::Keep, None)
            };

            suggestions::transition(tx, suggestion_id, SuggestionStatus::RolledBack, next, stamp)?;
            if next == SuggestionStatus::Pending && !suggestion.tier.is_reviewable() {
                // Back in the queue means a human looks at it next time.
                suggestions::set_tier(tx, suggestion_id, Tier::IndividualReview)?;
            }
            decision_log::append(
                tx,
                suggestion_id,
                Some(SuggestionStatus::RolledBack),
                next,
                actor,
                rationale,
            )?;

            log::info!(
                "Rolled back suggestion {} by {}, now {}",
                suggestion_id,
                actor,
                next
            );
            load(tx, suggestion_id)
        })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn load(conn: &Connection, suggestion_id: &str) -> Result<Suggestion, HandlerError> {
    suggestions::get(conn, suggestion_id)?.ok_or_else(|| {
        HandlerError::InvalidDetails(format!("suggestion {suggestion_id} does not exist"))
    })
}

pub(crate) fn require_target(suggestion: &Suggestion) -> Result<&EntityRef, HandlerError> {
    suggestion
        .target
        .as_ref()
        .ok_or_else(|| HandlerError::validation(vec!["suggestion has no target entity".to_string()]))
}

pub(crate) fn require_entity(conn: &Connection, target: &EntityRef) -> Result<Entity, HandlerError> {
    entities::get_entity(conn, target)?
        .ok_or_else(|| HandlerError::validation(vec![format!("{target} is not a tracked entity")]))
}

pub(crate) fn require_message(
    conn: &Connection,
    message_id: &str,
) -> Result<NormalizedMessage, HandlerError> {
    messages::get(conn, message_id)?
        .ok_or_else(|| HandlerError::validation(vec![format!("message {message_id} is unknown")]))
}

/// String field of a details document, trimmed; `None` when absent or blank.
pub(crate) fn detail_str<'a>(details: &'a Value, field: &str) -> Option<&'a str> {
    details
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn snapshot_str<'a>(snapshot: &'a Value, field: &str) -> Result<&'a str, HandlerError> {
    snapshot
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::RollbackFailure(format!("snapshot lacks '{field}'")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use serde_json::Value;

    use crate::message::Message;
    use crate::store::{entities, messages, suggestions, Database};
    use crate::types::{
        Entity, EntityRef, Suggestion, SuggestionSource, SuggestionStatus, SuggestionType, Tier,
    };

    pub fn seeded_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            for (entity, code) in [
                (EntityRef::project("p1"), "PRJ-2024-001"),
                (EntityRef::project("p2"), "PRJ-2024-002"),
            ] {
                entities::upsert_entity(
                    conn,
                    &Entity {
                        entity,
                        code: Some(code.to_string()),
                        name: code.to_string(),
                        status: "active".to_string(),
                    },
                )?;
            }
            let mut message = Message::new("m1", "jane@client.com")
                .with_subject("Drawings for review")
                .with_thread("t1")
                .normalize()
                .unwrap();
            message.sender_name = Some("Jane Client".to_string());
            messages::record(conn, &message)
        })
        .unwrap();
        db
    }

    pub fn add_suggestion(
        db: &Database,
        id: &str,
        kind: SuggestionType,
        target: Option<EntityRef>,
        details: Value,
    ) -> Suggestion {
        let now = Utc::now();
        let suggestion = Suggestion {
            suggestion_id: id.to_string(),
            message_id: "m1".to_string(),
            suggestion_type: kind,
            target,
            confidence: 0.8,
            source: SuggestionSource::Operator,
            status: SuggestionStatus::Pending,
            tier: Tier::BatchReview,
            details,
            rationale: None,
            apply_snapshot: None,
            created_at: now,
            updated_at: now,
            decided_at: None,
            decided_by: None,
        };
        db.with_conn(|conn| suggestions::insert(conn, &suggestion)).unwrap();
        suggestion
    }
}
