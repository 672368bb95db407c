use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{detail_str, require_entity, require_message, snapshot_str, SuggestionHandler};
use crate::domain_utils::DomainUtils;
use crate::error::HandlerError;
use crate::store::entities::{self, Contact};
use crate::types::{Suggestion, SuggestionType};

/// Creates a contact from `details.email`/`details.name`, falling back to
/// the message sender, optionally associated with the target entity.
pub struct CreateContactHandler;

struct ContactFields {
    email: String,
    name: Option<String>,
}

fn resolve_fields(suggestion: &Suggestion, conn: &Connection) -> Result<ContactFields, HandlerError> {
    let email = detail_str(&suggestion.details, "email").map(str::to_lowercase);
    let name = detail_str(&suggestion.details, "name").map(str::to_string);
    if let Some(email) = email {
        return Ok(ContactFields { email, name });
    }
    let message = require_message(conn, &suggestion.message_id)?;
    Ok(ContactFields {
        email: message.sender,
        name: name.or(message.sender_name),
    })
}

impl SuggestionHandler for CreateContactHandler {
    fn kind(&self) -> SuggestionType {
        SuggestionType::CreateContact
    }

    fn validate(&self, suggestion: &Suggestion, conn: &Connection) -> Result<(), HandlerError> {
        let fields = resolve_fields(suggestion, conn)?;
        let mut reasons = Vec::new();
        if !DomainUtils::is_valid_address(&fields.email) {
            reasons.push(format!("'{}' is not a valid address", fields.email));
        } else if entities::contact_by_email(conn, &fields.email)?.is_some() {
            reasons.push(format!("contact {} already exists", fields.email));
        }
        if let Some(target) = &suggestion.target {
            if let Err(HandlerError::Validation { reasons: more }) = require_entity(conn, target) {
                reasons.extend(more);
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::validation(reasons))
        }
    }

    fn preview(&self, suggestion: &Suggestion, conn: &Connection) -> Result<String, HandlerError> {
        let fields = resolve_fields(suggestion, conn)?;
        let who = match &fields.name {
            Some(name) => format!("{name} <{}>", fields.email),
            None => fields.email.clone(),
        };
        Ok(match &suggestion.target {
            Some(target) => format!("Create contact {who} for {target}"),
            None => format!("Create contact {who}"),
        })
    }

    fn apply(&self, suggestion: &Suggestion, conn: &Connection) -> Result<Value, HandlerError> {
        let fields = resolve_fields(suggestion, conn)?;
        let contact = Contact {
            contact_id: Uuid::new_v4().to_string(),
            email: fields.email,
            name: fields.name,
            entity: suggestion.target.clone(),
            created_at: Utc::now(),
        };
        entities::insert_contact(conn, &contact)
            .map_err(|e| HandlerError::ApplyFailure(format!("could not create contact {}: {e}", contact.email)))?;
        Ok(json!({ "contact_id": contact.contact_id }))
    }

    fn rollback(
        &self,
        _suggestion: &Suggestion,
        snapshot: &Value,
        conn: &Connection,
    ) -> Result<(), HandlerError> {
        let contact_id = snapshot_str(snapshot, "contact_id")?;
        if !entities::delete_contact(conn, contact_id)? {
            return Err(HandlerError::RollbackFailure(format!(
                "contact {contact_id} no longer exists"
            )));
        }
        Ok(())
    }
}
