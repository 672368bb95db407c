use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};

use super::{require_entity, require_message, require_target, SuggestionHandler};
use crate::error::HandlerError;
use crate::store::entities::{self, MessageLink};
use crate::types::{Suggestion, SuggestionType};

/// Links a message (and through it, its thread) to a project or proposal.
pub struct LinkMessageHandler;

impl SuggestionHandler for LinkMessageHandler {
    fn kind(&self) -> SuggestionType {
        SuggestionType::LinkMessage
    }

    fn validate(&self, suggestion: &Suggestion, conn: &Connection) -> Result<(), HandlerError> {
        let target = require_target(suggestion)?;
        require_entity(conn, target)?;
        require_message(conn, &suggestion.message_id)?;
        Ok(())
    }

    fn preview(&self, suggestion: &Suggestion, conn: &Connection) -> Result<String, HandlerError> {
        let target = require_target(suggestion)?;
        let name = entities::get_entity(conn, target)?
            .map(|e| e.name)
            .unwrap_or_else(|| "unknown entity".to_string());
        let current = entities::get_link(conn, &suggestion.message_id)?;
        Ok(match current {
            Some(link) if link.target != *target => format!(
                "Move message {} from {} to {} ({})",
                suggestion.message_id, link.target, target, name
            ),
            _ => format!("Link message {} to {} ({})", suggestion.message_id, target, name),
        })
    }

    fn apply(&self, suggestion: &Suggestion, conn: &Connection) -> Result<Value, HandlerError> {
        let target = require_target(suggestion)?;
        let message = require_message(conn, &suggestion.message_id)?;
        let previous = entities::get_link(conn, &suggestion.message_id)?;

        entities::put_link(
            conn,
            &MessageLink {
                message_id: message.message_id.clone(),
                thread_id: message.thread_id.clone(),
                target: target.clone(),
                received_at: message.received_at,
                linked_at: Utc::now(),
            },
        )?;

        Ok(json!({ "previous_link": previous }))
    }

    fn rollback(
        &self,
        suggestion: &Suggestion,
        snapshot: &Value,
        conn: &Connection,
    ) -> Result<(), HandlerError> {
        let target = require_target(suggestion)?;
        match entities::get_link(conn, &suggestion.message_id)? {
            Some(current) if current.target == *target => {}
            other => {
                return Err(HandlerError::RollbackFailure(format!(
                    "message {} is now linked to {}, not {}",
                    suggestion.message_id,
                    other.map_or_else(|| "nothing".to_string(), |l| l.target.to_string()),
                    target
                )))
            }
        }

        let previous: Option<MessageLink> = serde_json::from_value(
            snapshot.get("previous_link").cloned().unwrap_or(Value::Null),
        )?;
        match previous {
            Some(link) => entities::put_link(conn, &link)?,
            None => entities::delete_link(conn, &suggestion.message_id)?,
        }
        Ok(())
    }
}
