use anyhow::{anyhow, bail, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use mail_intel::engine::BatchDecisionItem;
use mail_intel::statistics::{self, StatisticsCollector};
use mail_intel::store::patterns::normalize_key;
use mail_intel::{
    BatchDecisionRequest, Decision, DecisionRequest, Engine, EngineConfig, Entity, EntityRef,
    Message, NewPattern, PatternType, ProcessingOutcome, RollbackDisposition,
};
use std::io::BufRead;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("mail-intel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Email intelligence and suggestion learning engine")
        .long_about("Links inbound correspondence to projects and proposals:\n\
                    • Layered matching: skip rules, thread inheritance, entity codes, learned patterns\n\
                    • Confidence tiers: auto-apply, batch review, individual review, log only\n\
                    • Learns from approvals, rejections and corrections")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mail-intel.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and list the matching stages")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("process")
                .long("process")
                .value_name("FILE")
                .help("Process a JSON-lines file of messages ('-' for stdin)")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("review")
                .long("review")
                .help("Show the review queue")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("decide")
                .long("decide")
                .value_name("SUGGESTION_ID")
                .help("Decide one or more suggestions (see --decision)")
                .num_args(1..)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("decision")
                .long("decision")
                .value_name("DECISION")
                .help("approve, reject or edit")
                .default_value("approve"),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .value_name("TYPE:ID")
                .help("Corrected target for an edit, e.g. project:42"),
        )
        .arg(
            Arg::new("actor")
                .long("actor")
                .value_name("NAME")
                .help("Who is deciding")
                .default_value("operator"),
        )
        .arg(
            Arg::new("note")
                .long("note")
                .value_name("TEXT")
                .help("Rationale recorded in the decision log"),
        )
        .arg(
            Arg::new("rollback")
                .long("rollback")
                .value_name("SUGGESTION_ID")
                .help("Undo an applied suggestion and return it to review")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("discard")
                .long("discard")
                .help("With --rollback: discard instead of returning to review")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("retry")
                .long("retry")
                .value_name("SUGGESTION_ID")
                .help("Retry applying a suggestion in error")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("history")
                .long("history")
                .value_name("SUGGESTION_ID")
                .help("Show the decision log of a suggestion")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("patterns")
                .long("patterns")
                .help("List active patterns")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("all")
                .long("all")
                .help("With --patterns: include retired patterns")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("add-pattern")
                .long("add-pattern")
                .value_names(["TYPE", "KEY", "TARGET", "CONFIDENCE"])
                .help("Create a pattern; TARGET is TYPE:ID or 'skip'")
                .num_args(4),
        )
        .arg(
            Arg::new("deactivate-pattern")
                .long("deactivate-pattern")
                .value_name("PATTERN_ID")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("set-confidence")
                .long("set-confidence")
                .value_names(["PATTERN_ID", "CONFIDENCE"])
                .num_args(2),
        )
        .arg(
            Arg::new("annotate-pattern")
                .long("annotate-pattern")
                .value_names(["PATTERN_ID", "TEXT"])
                .num_args(2),
        )
        .arg(
            Arg::new("register-entity")
                .long("register-entity")
                .value_names(["TYPE:ID", "NAME", "CODE"])
                .help("Register a project or proposal the engine can link to")
                .num_args(2..=3),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show processing statistics")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-idle")
                .long("stats-idle")
                .help("Show matching stages that have never fired")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-reset")
                .long("stats-reset")
                .help("Reset all statistics and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Initialize logger based on verbose flag
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Err(e) = run(&matches).await {
        eprintln!("❌ {e:#}");
        process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        EngineConfig::default()
            .to_file(generate_path)
            .with_context(|| format!("Failed to write {generate_path}"))?;
        println!("✅ Default configuration written to: {generate_path}");
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .ok_or_else(|| anyhow!("no configuration path"))?;
    let config = EngineConfig::from_file(config_path)
        .with_context(|| format!("Error loading configuration from {config_path}"))?;

    if matches.get_flag("stats") || matches.get_flag("stats-idle") || matches.get_flag("stats-reset") {
        return show_statistics(matches, &config);
    }

    let stats_config = config.statistics.clone().filter(|s| s.enabled);
    let mut engine = Engine::open(config.clone()).context("Failed to open engine database")?;

    if matches.get_flag("test-config") {
        println!("🔍 Configuration is valid");
        println!("Database: {}", config.database_path);
        println!("Workers: {}", config.workers);
        println!("Matching stages:");
        for (i, stage) in engine.stage_names().iter().enumerate() {
            println!("  {}. {}", i + 1, stage);
        }
        println!(
            "Tiers: auto >= {:.2}, batch >= {:.2}, individual >= {:.2}",
            config.tiers.auto_apply_threshold,
            config.tiers.batch_review_threshold,
            config.tiers.individual_review_threshold
        );
        return Ok(());
    }

    if let Some(values) = matches.get_many::<String>("register-entity") {
        let values: Vec<&String> = values.collect();
        let entity: EntityRef = values[0].parse()?;
        engine.register_entity(&Entity {
            entity: entity.clone(),
            code: values.get(2).map(|c| c.to_string()),
            name: values[1].to_string(),
            status: "active".to_string(),
        })?;
        println!("✅ Registered {entity}");
        return Ok(());
    }

    if let Some(values) = matches.get_many::<String>("add-pattern") {
        let values: Vec<&String> = values.collect();
        let pattern_type: PatternType = values[0].parse()?;
        let target = if values[2] == "skip" {
            None
        } else {
            Some(values[2].parse::<EntityRef>()?)
        };
        let confidence: f64 = values[3]
            .parse()
            .with_context(|| format!("Invalid confidence '{}'", values[3]))?;
        let pattern = engine.create_pattern(NewPattern::new(
            pattern_type,
            normalize_key(pattern_type, values[1]),
            target,
            confidence,
        ))?;
        println!("✅ Created pattern {}", pattern.pattern_id);
        return Ok(());
    }

    if let Some(pattern_id) = matches.get_one::<String>("deactivate-pattern") {
        engine.deactivate_pattern(pattern_id)?;
        println!("✅ Pattern {pattern_id} retired");
        return Ok(());
    }

    if let Some(values) = matches.get_many::<String>("set-confidence") {
        let values: Vec<&String> = values.collect();
        let confidence: f64 = values[1]
            .parse()
            .with_context(|| format!("Invalid confidence '{}'", values[1]))?;
        let pattern = engine.adjust_confidence(values[0], confidence)?;
        println!("✅ Pattern {} confidence now {:.3}", pattern.pattern_id, pattern.confidence);
        return Ok(());
    }

    if let Some(values) = matches.get_many::<String>("annotate-pattern") {
        let values: Vec<&String> = values.collect();
        engine.annotate_pattern(values[0], values[1])?;
        println!("✅ Pattern {} annotated", values[0]);
        return Ok(());
    }

    if matches.get_flag("patterns") {
        let patterns = engine.list_patterns(matches.get_flag("all"))?;
        if patterns.is_empty() {
            println!("📭 No patterns");
        }
        for p in patterns {
            println!(
                "{} {:<15} {:<32} -> {:<20} {:.3} used {:>4} ok {:>4} rej {:>4}{}",
                p.pattern_id,
                p.pattern_type.as_str(),
                truncate_string(&p.pattern_key, 32),
                p.target().map_or_else(|| "skip".to_string(), |t| t.to_string()),
                p.confidence,
                p.times_used,
                p.times_correct,
                p.times_rejected,
                if p.is_active { "" } else { " (retired)" }
            );
        }
        return Ok(());
    }

    if let Some(ids) = matches.get_many::<String>("decide") {
        let ids: Vec<String> = ids.cloned().collect();
        return decide(matches, &engine, ids);
    }

    if let Some(id) = matches.get_one::<String>("rollback") {
        let disposition = if matches.get_flag("discard") {
            RollbackDisposition::Discard
        } else {
            RollbackDisposition::ReturnToPending
        };
        let actor = actor(matches)?;
        let note = matches.get_one::<String>("note").map(String::as_str);
        let suggestion = engine.rollback(id, &actor, disposition, note)?;
        println!("✅ Rolled back {id}, now {}", suggestion.status);
        return Ok(());
    }

    if let Some(id) = matches.get_one::<String>("retry") {
        let suggestion = engine.retry_apply(id, &actor(matches)?)?;
        println!("✅ Suggestion {id} now {}", suggestion.status);
        return Ok(());
    }

    if let Some(id) = matches.get_one::<String>("history") {
        for entry in engine.decision_history(id)? {
            println!(
                "{} {:>10} -> {:<12} by {}{}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                entry.from_status.map_or("(new)", |s| s.as_str()),
                entry.to_status.as_str(),
                entry.actor,
                entry.rationale.map(|r| format!(" ({r})")).unwrap_or_default()
            );
        }
        return Ok(());
    }

    if matches.get_flag("review") {
        let queue = engine.review_queue()?;
        if queue.superseded > 0 {
            println!("🧹 {} superseded suggestion(s) marked stale", queue.superseded);
        }
        if queue.is_empty() {
            println!("📭 Nothing to review");
            return Ok(());
        }
        for (sender, items) in &queue.batches {
            println!("📦 Batch from {} ({} item(s))", sender, items.len());
            for item in items {
                println!(
                    "   {} [{:.2}] {}",
                    item.suggestion.suggestion_id, item.suggestion.confidence, item.preview
                );
            }
        }
        if !queue.individual.is_empty() {
            println!("🔎 Individual review");
            for item in &queue.individual {
                println!(
                    "   {} [{:.2}] {} <{}> {}",
                    item.suggestion.suggestion_id,
                    item.suggestion.confidence,
                    item.preview,
                    item.sender,
                    truncate_string(&item.subject, 40)
                );
            }
        }
        return Ok(());
    }

    if let Some(path) = matches.get_one::<String>("process") {
        let messages = read_messages(path)?;
        if let Some(stats) = &stats_config {
            let collector =
                StatisticsCollector::new(stats.database_path.clone(), stats.flush_interval_seconds)?;
            engine = engine.with_statistics(collector);
        }

        let engine = Arc::new(engine);
        let total = messages.len();
        let results = Arc::clone(&engine).process_batch(messages).await;

        let (mut applied, mut queued, mut skipped, mut unresolved, mut failed) = (0, 0, 0, 0, 0);
        for item in &results {
            match &item.result {
                Ok(ProcessingOutcome::Applied(_)) => applied += 1,
                Ok(ProcessingOutcome::Queued(_)) => queued += 1,
                Ok(ProcessingOutcome::Skipped { .. }) => skipped += 1,
                Ok(ProcessingOutcome::Unresolved { .. }) | Ok(ProcessingOutcome::Discarded { .. }) => {
                    unresolved += 1
                }
                Ok(ProcessingOutcome::ApplyFailed { error, .. }) => {
                    failed += 1;
                    println!("⚠️  {}: apply failed: {}", item.message_id, error);
                }
                Err(e) => {
                    failed += 1;
                    println!("⚠️  {}: {}", item.message_id, e);
                }
            }
        }
        println!("📊 Processed {total} message(s)");
        println!("  Auto-applied: {applied}");
        println!("  Queued:       {queued}");
        println!("  Skipped:      {skipped}");
        println!("  No change:    {unresolved}");
        println!("  Failed:       {failed}");

        if let Ok(engine) = Arc::try_unwrap(engine) {
            engine.shutdown().await;
        }
        return Ok(());
    }

    bail!("Nothing to do; see --help")
}

fn actor(matches: &ArgMatches) -> anyhow::Result<String> {
    matches
        .get_one::<String>("actor")
        .cloned()
        .ok_or_else(|| anyhow!("--actor is required"))
}

fn decide(matches: &ArgMatches, engine: &Engine, ids: Vec<String>) -> anyhow::Result<()> {
    let decision: Decision = matches
        .get_one::<String>("decision")
        .map(String::as_str)
        .unwrap_or("approve")
        .parse()?;
    let corrected_target = matches
        .get_one::<String>("target")
        .map(|t| t.parse::<EntityRef>())
        .transpose()?;
    let note = matches.get_one::<String>("note").cloned();
    let actor = actor(matches)?;

    let items = if ids.len() == 1 {
        let request = DecisionRequest {
            suggestion_id: ids[0].clone(),
            decision,
            actor,
            corrected_target,
            note,
        };
        vec![BatchDecisionItem {
            suggestion_id: ids[0].clone(),
            result: engine.decide(&request),
        }]
    } else {
        engine.decide_batch(&BatchDecisionRequest {
            suggestion_ids: ids,
            decision,
            actor,
            corrected_target,
            note,
        })
    };

    let mut failures = 0;
    for item in items {
        match item.result {
            Ok(outcome) => {
                println!("✅ {} -> {}", item.suggestion_id, outcome.status());
                for pattern in &outcome.pattern_updates {
                    println!(
                        "   pattern {} '{}' confidence {:.3}{}",
                        pattern.pattern_id,
                        pattern.pattern_key,
                        pattern.confidence,
                        if pattern.is_active { "" } else { " (retired)" }
                    );
                }
                for warning in &outcome.warnings {
                    println!("   ⚠️  {warning}");
                }
            }
            Err(e) => {
                failures += 1;
                println!("❌ {}: {}", item.suggestion_id, e);
            }
        }
    }
    if failures > 0 {
        bail!("{failures} decision(s) failed");
    }
    Ok(())
}

fn read_messages(path: &str) -> anyhow::Result<Vec<Message>> {
    let reader: Box<dyn BufRead> = if path == "-" {
        Box::new(std::io::BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(path).with_context(|| format!("Failed to open {path}"))?;
        Box::new(std::io::BufReader::new(file))
    };

    let mut messages = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(&line) {
            Ok(message) => messages.push(message),
            Err(e) => log::warn!("Skipping line {} of {}: {}", line_no + 1, path, e),
        }
    }
    Ok(messages)
}

fn show_statistics(matches: &ArgMatches, config: &EngineConfig) -> anyhow::Result<()> {
    let stats_config = match config.statistics.as_ref().filter(|s| s.enabled) {
        Some(stats_config) => stats_config,
        None => bail!("Statistics are not enabled in configuration"),
    };
    let path = stats_config.database_path.as_str();

    if matches.get_flag("stats-reset") {
        statistics::reset_stats(path)?;
        println!("✅ Statistics reset successfully");
        return Ok(());
    }

    if matches.get_flag("stats-idle") {
        let stage_names = [
            "skip_filter",
            "thread_inheritance",
            "code_extraction",
            "learned_sender",
            "learned_domain",
            "learned_keyword",
            "deep_analysis",
        ];
        let idle = statistics::idle_stages(path, &stage_names)?;
        if idle.is_empty() {
            println!("✅ Every stage has fired at least once");
        } else {
            println!("💤 Stages that have never fired:");
            for stage in idle {
                println!("  • {stage}");
            }
        }
        return Ok(());
    }

    let (global, stages) = statistics::read_stats(path)?;
    println!("📊 Mail Intelligence Statistics");
    println!("═══════════════════════════════════════");
    println!("  Messages processed:  {}", global.total_messages);
    println!("  Rejected at intake:  {}", global.failed_messages);
    println!("  Unresolved:          {}", global.unresolved);
    println!("  Deep analysis fails: {}", global.deep_analysis_failures);
    println!();
    println!("  Routed auto-apply:   {}", global.auto_applied);
    println!("  Routed batch:        {}", global.batch_review);
    println!("  Routed individual:   {}", global.individual_review);
    println!("  Routed log-only:     {}", global.log_only);
    println!();
    println!(
        "  Decisions: {} approved, {} rejected, {} edited, {} rolled back",
        global.approvals, global.rejections, global.edits, global.rollbacks
    );
    println!(
        "  Since {} (updated {})",
        global.start_time.format("%Y-%m-%d %H:%M:%S UTC"),
        global.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();

    if stages.is_empty() {
        println!("📭 No stage activity recorded yet");
    } else {
        println!("🎯 Stage activity:");
        for stage in stages {
            println!(
                "  {:<20} matches {:>6} skips {:>6}",
                stage.stage_name, stage.matches, stage.skips
            );
        }
    }
    Ok(())
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
