use async_trait::async_trait;
use mail_intel::deep_analysis::AnalysisRequest;
use mail_intel::error::DeepAnalysisError;
use mail_intel::suggestion_engine::DiscardReason;
use mail_intel::{
    AnalysisResponse, Database, DecisionRequest, DeepAnalyzer, Engine, EngineConfig, EngineError,
    Entity, EntityRef, Message, NewPattern, PatternType, ProcessingOutcome, SuggestionSource,
    SuggestionStatus, SuggestionType, Tier,
};
use std::sync::Arc;

fn engine_with(config: EngineConfig) -> Engine {
    let engine = Engine::new(config, Database::open_in_memory().unwrap()).unwrap();
    for (id, code) in [("p1", "PRJ-2024-001"), ("p2", "PRJ-2024-002")] {
        engine
            .register_entity(&Entity {
                entity: EntityRef::project(id),
                code: Some(code.to_string()),
                name: format!("Project {id}"),
                status: "active".to_string(),
            })
            .unwrap();
    }
    engine
}

fn engine() -> Engine {
    let mut config = EngineConfig::default();
    config.statistics = None;
    engine_with(config)
}

struct FixedAnalyzer {
    target: EntityRef,
    confidence: f64,
}

#[async_trait]
impl DeepAnalyzer for FixedAnalyzer {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn analyze(
        &self,
        _request: &AnalysisRequest,
    ) -> Result<Option<AnalysisResponse>, DeepAnalysisError> {
        Ok(Some(AnalysisResponse {
            target: self.target.clone(),
            confidence: self.confidence,
            rationale: Some("mentions the harbour bridge survey".to_string()),
            suggestion_type: SuggestionType::LinkMessage,
            details: serde_json::Value::Null,
        }))
    }
}

#[tokio::test]
async fn test_known_domain_auto_applies_with_audit_trail() {
    let engine = engine();
    engine
        .create_pattern(NewPattern::new(
            PatternType::DomainEntity,
            "client.com",
            Some(EntityRef::project("p1")),
            0.95,
        ))
        .unwrap();

    let outcome = engine
        .process_message(&Message::new("m1", "known@client.com").with_subject("Weekly update"))
        .await
        .unwrap();
    let applied = match outcome {
        ProcessingOutcome::Applied(s) => s,
        other => panic!("expected auto-apply, got {other:?}"),
    };
    assert_eq!(applied.status, SuggestionStatus::Applied);
    assert_eq!(applied.tier, Tier::AutoApply);

    let history = engine.decision_history(&applied.suggestion_id).unwrap();
    let transitions: Vec<_> = history.iter().map(|e| (e.from_status, e.to_status)).collect();
    assert_eq!(
        transitions,
        vec![
            (None, SuggestionStatus::Pending),
            (Some(SuggestionStatus::Pending), SuggestionStatus::Applied),
        ]
    );

    let link = engine.entities().link_for("m1").unwrap().unwrap();
    assert_eq!(link.target, EntityRef::project("p1"));
}

#[tokio::test]
async fn test_rejection_lowers_sender_pattern() {
    let engine = engine();
    let pattern = engine
        .create_pattern(NewPattern::new(
            PatternType::SenderEntity,
            "alice@client.com",
            Some(EntityRef::project("p1")),
            0.60,
        ))
        .unwrap();

    let outcome = engine
        .process_message(&Message::new("m1", "alice@client.com"))
        .await
        .unwrap();
    let queued = match outcome {
        ProcessingOutcome::Queued(s) => s,
        other => panic!("expected review, got {other:?}"),
    };
    assert_eq!(queued.tier, Tier::IndividualReview);
    assert_eq!(engine.review_queue().unwrap().individual.len(), 1);

    let decided = engine
        .decide(&DecisionRequest::reject(&queued.suggestion_id, "reviewer"))
        .unwrap();
    assert_eq!(decided.status(), SuggestionStatus::Rejected);

    let after = engine.pattern(&pattern.pattern_id).unwrap().unwrap();
    assert!((after.confidence - 0.48).abs() < 1e-9);
    assert_eq!(after.times_rejected, 1);
    assert!(after.is_active);
    assert!(engine.entities().link_for("m1").unwrap().is_none());
}

#[tokio::test]
async fn test_edit_of_deep_analysis_promotes_domain_pattern() {
    let mut config = EngineConfig::default();
    config.statistics = None;
    let engine = engine_with(config).with_analyzer(Arc::new(FixedAnalyzer {
        target: EntityRef::project("p1"),
        confidence: 0.75,
    }));

    let outcome = engine
        .process_message(&Message::new("m1", "surveyor@newpartner.com").with_subject("Bridge survey"))
        .await
        .unwrap();
    let queued = match outcome {
        ProcessingOutcome::Queued(s) => s,
        other => panic!("expected review, got {other:?}"),
    };
    assert_eq!(queued.source, SuggestionSource::DeepAnalysis);
    assert_eq!(queued.tier, Tier::BatchReview);

    let decided = engine
        .decide(&DecisionRequest::edit(
            &queued.suggestion_id,
            "reviewer",
            EntityRef::project("p2"),
        ))
        .unwrap();
    assert_eq!(decided.status(), SuggestionStatus::Applied);
    assert_eq!(decided.suggestion.target, Some(EntityRef::project("p2")));

    let learned = engine
        .list_patterns(false)
        .unwrap()
        .into_iter()
        .find(|p| p.pattern_type == PatternType::DomainEntity && p.pattern_key == "newpartner.com")
        .expect("a domain pattern is learned from the correction");
    assert_eq!(learned.target(), Some(EntityRef::project("p2")));
    assert!((learned.confidence - 0.60).abs() < 1e-9);
    assert_eq!(learned.times_used, 1);
    assert_eq!(learned.times_correct, 1);

    // The next message from the same domain now matches the learned pattern.
    let next = engine
        .process_message(&Message::new("m2", "office@newpartner.com"))
        .await
        .unwrap();
    let suggestion = next.suggestion().unwrap();
    assert_eq!(suggestion.target, Some(EntityRef::project("p2")));
    assert_eq!(suggestion.source.pattern_id(), Some(learned.pattern_id.as_str()));
}

#[tokio::test]
async fn test_simultaneous_decisions_have_one_winner() {
    let engine = Arc::new(engine());
    engine
        .create_pattern(NewPattern::new(
            PatternType::SenderEntity,
            "alice@client.com",
            Some(EntityRef::project("p1")),
            0.60,
        ))
        .unwrap();
    let outcome = engine
        .process_message(&Message::new("m1", "alice@client.com"))
        .await
        .unwrap();
    let id = outcome.suggestion().unwrap().suggestion_id.clone();

    let handles: Vec<_> = ["alice-reviewer", "bob-reviewer"]
        .into_iter()
        .enumerate()
        .map(|(i, actor)| {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            std::thread::spawn(move || {
                let request = if i == 0 {
                    DecisionRequest::approve(&id, actor)
                } else {
                    DecisionRequest::reject(&id, actor)
                };
                engine.decide(&request)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(EngineError::DecisionConflict { .. }))));

    let final_status = engine.suggestion(&id).unwrap().status;
    assert!(matches!(
        final_status,
        SuggestionStatus::Applied | SuggestionStatus::Rejected
    ));
    // Exactly one decision reached the log after the creation entry.
    let decisions = engine
        .decision_history(&id)
        .unwrap()
        .into_iter()
        .filter(|e| e.from_status == Some(SuggestionStatus::Pending))
        .count();
    assert_eq!(decisions, 1);
}

#[tokio::test]
async fn test_thread_inheritance_and_idempotent_reprocessing() {
    let engine = engine();
    engine
        .create_pattern(NewPattern::new(
            PatternType::DomainEntity,
            "client.com",
            Some(EntityRef::project("p1")),
            0.95,
        ))
        .unwrap();

    let first = Message::new("m1", "pm@client.com").with_thread("t-42");
    assert!(matches!(
        engine.process_message(&first).await.unwrap(),
        ProcessingOutcome::Applied(_)
    ));

    let reply = engine
        .process_message(&Message::new("m2", "someone@elsewhere.org").with_thread("t-42"))
        .await
        .unwrap();
    let inherited = match reply {
        ProcessingOutcome::Applied(s) => s,
        other => panic!("expected inherited auto-apply, got {other:?}"),
    };
    assert_eq!(inherited.source, SuggestionSource::ThreadInheritance);
    assert_eq!(inherited.target, Some(EntityRef::project("p1")));

    match engine.process_message(&first).await.unwrap() {
        ProcessingOutcome::Discarded { reason, .. } => assert_eq!(reason, DiscardReason::AlreadyApplied),
        other => panic!("expected discard on reprocessing, got {other:?}"),
    }
    assert_eq!(engine.suggestions_for_message("m1").unwrap().len(), 1);
}

#[tokio::test]
async fn test_batch_isolates_invalid_message() {
    let engine = Arc::new(engine());
    let batch = vec![
        Message::new("m1", "someone@anywhere.org").with_subject("PRJ-2024-001 invoice"),
        Message::new("m2", "not-an-address"),
        Message::new("m3", "noreply@vendor.com"),
    ];

    let results = Arc::clone(&engine).process_batch(batch).await;
    let ids: Vec<_> = results.iter().map(|r| r.message_id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);

    assert!(matches!(results[0].result, Ok(ProcessingOutcome::Applied(_))));
    assert!(matches!(results[1].result, Err(EngineError::Ingestion(_))));
    assert!(matches!(results[2].result, Ok(ProcessingOutcome::Skipped { .. })));
}

#[tokio::test]
async fn test_rollback_restores_previous_link() {
    let engine = engine();
    engine
        .create_pattern(NewPattern::new(
            PatternType::DomainEntity,
            "client.com",
            Some(EntityRef::project("p1")),
            0.95,
        ))
        .unwrap();

    let outcome = engine
        .process_message(&Message::new("m1", "pm@client.com"))
        .await
        .unwrap();
    let id = outcome.suggestion().unwrap().suggestion_id.clone();
    assert!(engine.entities().link_for("m1").unwrap().is_some());

    let rolled = engine
        .rollback(&id, "reviewer", mail_intel::RollbackDisposition::Discard, Some("wrong project"))
        .unwrap();
    assert_eq!(rolled.status, SuggestionStatus::Discarded);
    assert!(engine.entities().link_for("m1").unwrap().is_none());

    let last = engine.decision_history(&id).unwrap().pop().unwrap();
    assert_eq!(last.to_status, SuggestionStatus::Discarded);
    assert_eq!(last.actor, "reviewer");
}

#[tokio::test]
async fn test_reprocessing_after_correction_keeps_the_correction() {
    let engine = engine();
    let original = engine
        .create_pattern(NewPattern::new(
            PatternType::SenderEntity,
            "pm@client.com",
            Some(EntityRef::project("p1")),
            0.80,
        ))
        .unwrap();

    let threaded = Message::new("m1", "pm@client.com").with_thread("t1");
    let unthreaded = Message::new("m2", "pm@client.com");
    for message in [&threaded, &unthreaded] {
        let queued = engine.process_message(message).await.unwrap();
        let id = queued.suggestion().unwrap().suggestion_id.clone();
        let decided = engine
            .decide(&DecisionRequest::edit(&id, "reviewer", EntityRef::project("p2")))
            .unwrap();
        assert_eq!(decided.status(), SuggestionStatus::Applied);
    }
    let corrected = engine.pattern(&original.pattern_id).unwrap().unwrap();
    assert!(corrected.is_active);

    for message in [&threaded, &unthreaded] {
        match engine.process_message(message).await.unwrap() {
            ProcessingOutcome::Discarded { reason, .. } => {
                assert_eq!(reason, DiscardReason::AlreadyApplied)
            }
            other => panic!("expected the correction to stand, got {other:?}"),
        }
        let link = engine.entities().link_for(&message.message_id).unwrap().unwrap();
        assert_eq!(link.target, EntityRef::project("p2"));
    }

    assert!(engine.review_queue().unwrap().is_empty());
    let after = engine.pattern(&original.pattern_id).unwrap().unwrap();
    assert_eq!(after.confidence, corrected.confidence);
    assert_eq!(after.times_used, corrected.times_used);
}

#[tokio::test]
async fn test_edit_to_unknown_entity_is_refused_without_learning() {
    let engine = engine();
    let original = engine
        .create_pattern(NewPattern::new(
            PatternType::DomainEntity,
            "client.com",
            Some(EntityRef::project("p1")),
            0.80,
        ))
        .unwrap();

    let queued = engine
        .process_message(&Message::new("m1", "pm@client.com"))
        .await
        .unwrap();
    let id = queued.suggestion().unwrap().suggestion_id.clone();

    let result = engine.decide(&DecisionRequest::edit(
        &id,
        "reviewer",
        EntityRef::project("typo-999"),
    ));
    assert!(matches!(result, Err(EngineError::InvalidDecision(_))));

    let suggestion = engine.suggestion(&id).unwrap();
    assert_eq!(suggestion.status, SuggestionStatus::Pending);
    assert_eq!(suggestion.target, Some(EntityRef::project("p1")));
    assert_eq!(engine.decision_history(&id).unwrap().len(), 1);

    let patterns = engine.list_patterns(true).unwrap();
    assert_eq!(patterns.len(), 1);
    let untouched = &patterns[0];
    assert_eq!(untouched.pattern_id, original.pattern_id);
    assert_eq!(untouched.confidence, 0.80);
    assert_eq!(untouched.times_rejected, 0);

    // The same suggestion can still be corrected to a real entity.
    let decided = engine
        .decide(&DecisionRequest::edit(&id, "reviewer", EntityRef::project("p2")))
        .unwrap();
    assert_eq!(decided.status(), SuggestionStatus::Applied);
}
