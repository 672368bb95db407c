use rusqlite::Connection;
use serde_json::{json, Value};

use super::{detail_str, require_entity, require_target, snapshot_str, SuggestionHandler};
use crate::error::HandlerError;
use crate::store::entities;
use crate::types::{Suggestion, SuggestionType};

/// Moves a project or proposal to the status named in `details.status`.
pub struct UpdateStatusHandler;

fn new_status(suggestion: &Suggestion) -> Result<&str, HandlerError> {
    detail_str(&suggestion.details, "status")
        .ok_or_else(|| HandlerError::validation(vec!["details.status is required".to_string()]))
}

impl SuggestionHandler for UpdateStatusHandler {
    fn kind(&self) -> SuggestionType {
        SuggestionType::UpdateEntityStatus
    }

    fn validate(&self, suggestion: &Suggestion, conn: &Connection) -> Result<(), HandlerError> {
        let mut reasons = Vec::new();
        let status = detail_str(&suggestion.details, "status");
        if status.is_none() {
            reasons.push("details.status is required".to_string());
        }
        match require_target(suggestion).and_then(|t| require_entity(conn, t)) {
            Ok(entity) => {
                if status == Some(entity.status.as_str()) {
                    reasons.push(format!("{} is already {}", entity.entity, entity.status));
                }
            }
            Err(HandlerError::Validation { reasons: more }) => reasons.extend(more),
            Err(e) => return Err(e),
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::validation(reasons))
        }
    }

    fn preview(&self, suggestion: &Suggestion, conn: &Connection) -> Result<String, HandlerError> {
        let target = require_target(suggestion)?;
        let status = new_status(suggestion)?;
        let current = entities::get_entity(conn, target)?
            .map(|e| e.status)
            .unwrap_or_else(|| "unknown".to_string());
        Ok(format!("Change {target} status from '{current}' to '{status}'"))
    }

    fn apply(&self, suggestion: &Suggestion, conn: &Connection) -> Result<Value, HandlerError> {
        let target = require_target(suggestion)?;
        let status = new_status(suggestion)?;
        let entity = require_entity(conn, target)?;
        if !entities::set_entity_status(conn, target, status)? {
            return Err(HandlerError::ApplyFailure(format!("{target} disappeared during apply")));
        }
        Ok(json!({
            "previous_status": entity.status,
            "applied_status": status,
        }))
    }

    fn rollback(
        &self,
        suggestion: &Suggestion,
        snapshot: &Value,
        conn: &Connection,
    ) -> Result<(), HandlerError> {
        let target = require_target(suggestion)?;
        let previous = snapshot_str(snapshot, "previous_status")?;
        let applied = snapshot_str(snapshot, "applied_status")?;

        let entity = entities::get_entity(conn, target)?
            .ok_or_else(|| HandlerError::RollbackFailure(format!("{target} no longer exists")))?;
        if entity.status != applied {
            return Err(HandlerError::RollbackFailure(format!(
                "{target} status changed to '{}' since apply",
                entity.status
            )));
        }
        entities::set_entity_status(conn, target, previous)?;
        Ok(())
    }
}
