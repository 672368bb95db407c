use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{detail_str, require_entity, require_target, snapshot_str, SuggestionHandler};
use crate::error::HandlerError;
use crate::store::entities::{self, Deadline};
use crate::types::{Suggestion, SuggestionType};

/// Records a deadline (`details.due_date`, `details.description`) on the
/// target entity.
pub struct FlagDeadlineHandler;

fn due_date(suggestion: &Suggestion) -> Result<NaiveDate, HandlerError> {
    let raw = detail_str(&suggestion.details, "due_date")
        .ok_or_else(|| HandlerError::validation(vec!["details.due_date is required".to_string()]))?;
    raw.parse::<NaiveDate>().map_err(|e| {
        HandlerError::validation(vec![format!("details.due_date '{raw}' is not YYYY-MM-DD: {e}")])
    })
}

fn description(suggestion: &Suggestion) -> String {
    detail_str(&suggestion.details, "description")
        .map(str::to_string)
        .unwrap_or_else(|| format!("Deadline from message {}", suggestion.message_id))
}

impl SuggestionHandler for FlagDeadlineHandler {
    fn kind(&self) -> SuggestionType {
        SuggestionType::FlagDeadline
    }

    fn validate(&self, suggestion: &Suggestion, conn: &Connection) -> Result<(), HandlerError> {
        let mut reasons = Vec::new();
        if let Err(HandlerError::Validation { reasons: more }) = due_date(suggestion) {
            reasons.extend(more);
        }
        match require_target(suggestion).and_then(|t| require_entity(conn, t)) {
            Ok(_) => {}
            Err(HandlerError::Validation { reasons: more }) => reasons.extend(more),
            Err(e) => return Err(e),
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::validation(reasons))
        }
    }

    fn preview(&self, suggestion: &Suggestion, _conn: &Connection) -> Result<String, HandlerError> {
        let target = require_target(suggestion)?;
        let due = due_date(suggestion)?;
        Ok(format!(
            "Flag deadline {} on {}: {}",
            due,
            target,
            description(suggestion)
        ))
    }

    fn apply(&self, suggestion: &Suggestion, conn: &Connection) -> Result<Value, HandlerError> {
        let target = require_target(suggestion)?;
        let deadline = Deadline {
            deadline_id: Uuid::new_v4().to_string(),
            entity: target.clone(),
            due_date: due_date(suggestion)?,
            description: description(suggestion),
            source_message_id: Some(suggestion.message_id.clone()),
            created_at: Utc::now(),
        };
        entities::insert_deadline(conn, &deadline)?;
        Ok(json!({ "deadline_id": deadline.deadline_id }))
    }

    fn rollback(
        &self,
        _suggestion: &Suggestion,
        snapshot: &Value,
        conn: &Connection,
    ) -> Result<(), HandlerError> {
        let deadline_id = snapshot_str(snapshot, "deadline_id")?;
        if !entities::delete_deadline(conn, deadline_id)? {
            return Err(HandlerError::RollbackFailure(format!(
                "deadline {deadline_id} no longer exists"
            )));
        }
        Ok(())
    }
}
