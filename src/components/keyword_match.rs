//! Learned Keyword Component
//!
//! Whole-word, case-insensitive phrase matching of keyword→entity rows
//! against the subject and body excerpt.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use rusqlite::Connection;

use crate::components::{pattern_candidate, select_best, MatchStage, StageOutcome};
use crate::error::StoreError;
use crate::message::NormalizedMessage;
use crate::store::patterns;
use crate::types::PatternType;

/// Compiled phrases kept across messages; cleared when it grows past this.
const MAX_CACHED_PHRASES: usize = 4096;

pub struct KeywordMatch {
    min_keyword_length: usize,
    compiled: Mutex<HashMap<String, Option<Regex>>>,
}

impl KeywordMatch {
    pub fn new(min_keyword_length: usize) -> Self {
        Self {
            min_keyword_length,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    /// Whole-word phrase match; `text` is expected lowercase.
    pub fn contains_phrase(text: &str, phrase: &str) -> bool {
        phrase_regex(phrase).is_some_and(|regex| regex.is_match(text))
    }

    fn matches(&self, text: &str, phrase: &str) -> bool {
        let Ok(mut compiled) = self.compiled.lock() else {
            return Self::contains_phrase(text, phrase);
        };
        if compiled.len() >= MAX_CACHED_PHRASES && !compiled.contains_key(phrase) {
            compiled.clear();
        }
        compiled
            .entry(phrase.to_string())
            .or_insert_with(|| phrase_regex(phrase))
            .as_ref()
            .is_some_and(|regex| regex.is_match(text))
    }

    #[cfg(test)]
    fn cached_phrases(&self) -> usize {
        self.compiled.lock().map(|c| c.len()).unwrap_or(0)
    }
}

fn phrase_regex(phrase: &str) -> Option<Regex> {
    let phrase = phrase.trim().to_lowercase();
    if phrase.is_empty() {
        return None;
    }
    let words: Vec<String> = phrase.split_whitespace().map(regex::escape).collect();
    let pattern = format!(r"(?:^|\W){}(?:$|\W)", words.join(r"\s+"));
    match Regex::new(&pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            log::warn!("Skipping keyword '{}': {}", phrase, e);
            None
        }
    }
}

impl MatchStage for KeywordMatch {
    fn evaluate(
        &self,
        message: &NormalizedMessage,
        conn: &Connection,
    ) -> Result<StageOutcome, StoreError> {
        if message.searchable_text.trim().is_empty() {
            return Ok(StageOutcome::Continue);
        }

        let hits: Vec<_> = patterns::all_active_of_type(conn, PatternType::KeywordEntity)?
            .into_iter()
            .filter(|p| p.pattern_key.chars().count() >= self.min_keyword_length)
            .filter(|p| self.matches(&message.searchable_text, &p.pattern_key))
            .collect();

        Ok(select_best(hits)
            .and_then(|pattern| {
                let rationale = format!(
                    "keyword '{}' matched pattern {}",
                    pattern.pattern_key, pattern.pattern_id
                );
                pattern_candidate(&pattern, self.name(), rationale)
            })
            .map_or(StageOutcome::Continue, StageOutcome::Match))
    }

    fn name(&self) -> &str {
        "learned_keyword"
    }

    fn priority(&self) -> u8 {
        60
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::test_support::{add_pattern, db};
    use crate::message::Message;
    use crate::types::EntityRef;

    #[test]
    fn test_contains_phrase_respects_word_boundaries() {
        assert!(KeywordMatch::contains_phrase("the harbor bridge retrofit", "Harbor Bridge"));
        assert!(KeywordMatch::contains_phrase("harbor  bridge.", "harbor bridge"));
        assert!(!KeywordMatch::contains_phrase("harborbridge", "harbor bridge"));
        assert!(!KeywordMatch::contains_phrase("landscaping", "scap"));
        assert!(KeywordMatch::contains_phrase("re: c++ port", "c++"));
    }

    #[test]
    fn test_short_keywords_ignored() {
        let db = db();
        add_pattern(&db, PatternType::KeywordEntity, "ab", Some(EntityRef::project("p1")), 0.9);
        let message = Message::new("m1", "a@client.com")
            .with_subject("ab testing")
            .normalize()
            .unwrap();
        let outcome = db
            .with_conn(|conn| KeywordMatch::new(3).evaluate(&message, conn))
            .unwrap();
        assert_eq!(outcome, StageOutcome::Continue);
    }

    #[test]
    fn test_best_keyword_selected() {
        let db = db();
        add_pattern(&db, PatternType::KeywordEntity, "bridge", Some(EntityRef::project("p1")), 0.55);
        add_pattern(&db, PatternType::KeywordEntity, "harbor bridge", Some(EntityRef::project("p2")), 0.75);
        let message = Message::new("m1", "a@client.com")
            .with_body("Revised Harbor Bridge schedule attached")
            .normalize()
            .unwrap();
        match db.with_conn(|conn| KeywordMatch::new(3).evaluate(&message, conn)).unwrap() {
            StageOutcome::Match(candidate) => {
                assert_eq!(candidate.target, Some(EntityRef::project("p2")));
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_compiled_phrases_reused_across_messages() {
        let db = db();
        add_pattern(&db, PatternType::KeywordEntity, "harbor bridge", Some(EntityRef::project("p1")), 0.75);
        add_pattern(&db, PatternType::KeywordEntity, "tunnel", Some(EntityRef::project("p2")), 0.75);
        let stage = KeywordMatch::new(3);

        for (id, body) in [("m1", "harbor bridge update"), ("m2", "tunnel survey"), ("m3", "nothing here")] {
            let message = Message::new(id, "a@client.com").with_body(body).normalize().unwrap();
            db.with_conn(|conn| stage.evaluate(&message, conn)).unwrap();
        }
        assert_eq!(stage.cached_phrases(), 2);

        let message = Message::new("m4", "a@client.com")
            .with_body("Tunnel lighting")
            .normalize()
            .unwrap();
        match db.with_conn(|conn| stage.evaluate(&message, conn)).unwrap() {
            StageOutcome::Match(candidate) => {
                assert_eq!(candidate.target, Some(EntityRef::project("p2")));
            }
            other => panic!("expected match, got {other:?}"),
        }
        assert_eq!(stage.cached_phrases(), 2);
    }
}
