//! Normalized inbound/outbound correspondence as handed over by ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain_utils::DomainUtils;
use crate::error::IngestionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Message record as received from the ingestion channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub sender: String,
    #[serde(default)]
    pub sender_domain: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_excerpt: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(message_id: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            sender: sender.into(),
            sender_domain: None,
            sender_name: None,
            subject: String::new(),
            body_excerpt: String::new(),
            thread_id: None,
            direction: Direction::Inbound,
            received_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body_excerpt = body.into();
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn received(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Validate and canonicalize the record for matching.
    pub fn normalize(&self) -> Result<NormalizedMessage, IngestionError> {
        let message_id = self.message_id.trim();
        if message_id.is_empty() {
            return Err(IngestionError::MissingField("message_id"));
        }

        let sender = self.sender.trim().to_lowercase();
        if sender.is_empty() {
            return Err(IngestionError::MissingField("sender"));
        }
        if !DomainUtils::is_valid_address(&sender) {
            return Err(IngestionError::InvalidSender(self.sender.clone()));
        }

        let sender_domain = match self.sender_domain.as_deref().map(str::trim) {
            Some(domain) if !domain.is_empty() => DomainUtils::canonicalize_domain(domain),
            _ => DomainUtils::extract_domain(&sender)
                .map(|d| DomainUtils::canonicalize_domain(&d))
                .ok_or_else(|| IngestionError::InvalidSender(self.sender.clone()))?,
        };

        let thread_id = self
            .thread_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let searchable_text = format!("{}\n{}", self.subject, self.body_excerpt).to_lowercase();

        Ok(NormalizedMessage {
            message_id: message_id.to_string(),
            sender,
            sender_domain,
            sender_name: self.sender_name.clone(),
            subject: self.subject.clone(),
            body_excerpt: self.body_excerpt.clone(),
            thread_id,
            direction: self.direction,
            received_at: self.received_at,
            searchable_text,
        })
    }
}

/// A message that passed ingestion checks; addresses and domains are lowercase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub sender: String,
    pub sender_domain: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub body_excerpt: String,
    pub thread_id: Option<String>,
    pub direction: Direction,
    pub received_at: DateTime<Utc>,
    /// Lowercased subject and body, used by keyword matching.
    #[serde(skip)]
    pub searchable_text: String,
}

impl NormalizedMessage {
    pub(crate) fn rebuild_searchable_text(&mut self) {
        self.searchable_text = format!("{}\n{}", self.subject, self.body_excerpt).to_lowercase();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_derives_domain() {
        let message = Message::new("m1", "  Known@Client.COM ")
            .with_subject("Kickoff")
            .with_body("See attached PLAN");
        let normalized = message.normalize().unwrap();
        assert_eq!(normalized.sender, "known@client.com");
        assert_eq!(normalized.sender_domain, "client.com");
        assert!(normalized.searchable_text.contains("see attached plan"));
    }

    #[test]
    fn test_explicit_domain_is_canonicalized() {
        let mut message = Message::new("m1", "a@mail.client.com");
        message.sender_domain = Some("WWW.Client.com".to_string());
        assert_eq!(message.normalize().unwrap().sender_domain, "client.com");
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert_eq!(
            Message::new("", "a@client.com").normalize().unwrap_err(),
            IngestionError::MissingField("message_id")
        );
        assert_eq!(
            Message::new("m1", "   ").normalize().unwrap_err(),
            IngestionError::MissingField("sender")
        );
        assert!(matches!(
            Message::new("m1", "not-an-address").normalize(),
            Err(IngestionError::InvalidSender(_))
        ));
    }

    #[test]
    fn test_blank_thread_is_dropped() {
        let message = Message::new("m1", "a@client.com").with_thread("  ");
        assert_eq!(message.normalize().unwrap().thread_id, None);
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let json = r#"{"message_id":"m9","sender":"a@client.com","received_at":"2026-01-05T10:00:00Z"}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert_eq!(message.direction, Direction::Inbound);
        assert!(message.subject.is_empty());
    }
}
