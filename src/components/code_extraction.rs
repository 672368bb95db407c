//! Explicit Code Extraction Component
//!
//! Structured entity codes quoted in the subject or body (`PRJ-2024-001`)
//! resolve directly against the entity table.

use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};
use rusqlite::Connection;
use serde_json::json;

use crate::components::{MatchStage, StageOutcome};
use crate::error::{ConfigError, StoreError};
use crate::message::NormalizedMessage;
use crate::store::entities;
use crate::types::{MatchCandidate, SuggestionSource};

pub struct CodeExtraction {
    code_pattern: Regex,
}

impl CodeExtraction {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let code_pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| ConfigError::Regex {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self { code_pattern })
    }

    /// Distinct codes in subject and body, uppercased, in first-seen order.
    pub fn extract_codes(&self, message: &NormalizedMessage) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut codes = Vec::new();
        for text in [&message.subject, &message.body_excerpt] {
            for found in self.code_pattern.find_iter(text) {
                let code = found.as_str().to_uppercase();
                if seen.insert(code.clone()) {
                    codes.push(code);
                }
            }
        }
        codes
    }
}

impl MatchStage for CodeExtraction {
    fn evaluate(
        &self,
        message: &NormalizedMessage,
        conn: &Connection,
    ) -> Result<StageOutcome, StoreError> {
        let codes = self.extract_codes(message);
        if codes.is_empty() {
            return Ok(StageOutcome::Continue);
        }

        let mut resolved = Vec::new();
        for code in &codes {
            match entities::find_by_code(conn, code)? {
                Some(entity) => {
                    if !resolved.iter().any(|(_, e)| *e == entity.entity) {
                        resolved.push((code.clone(), entity.entity));
                    }
                }
                None => log::debug!("Code {} in message {} is not a tracked entity", code, message.message_id),
            }
        }

        match resolved.as_slice() {
            [] => Ok(StageOutcome::Continue),
            [(code, target)] => {
                let mut candidate = MatchCandidate::link(
                    target.clone(),
                    1.0,
                    SuggestionSource::CodeExtraction,
                    self.name(),
                )
                .with_rationale(format!("message quotes entity code {code}"));
                candidate.details = json!({ "code": code });
                Ok(StageOutcome::Match(candidate))
            }
            many => {
                log::info!(
                    "Message {} quotes codes for {} different entities, not guessing",
                    message.message_id,
                    many.len()
                );
                Ok(StageOutcome::Continue)
            }
        }
    }

    fn name(&self) -> &str {
        "code_extraction"
    }

    fn priority(&self) -> u8 {
        30
    }
}
