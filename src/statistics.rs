use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::engine::Decision;
use crate::types::Tier;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStats {
    pub stage_name: String,
    pub matches: u64,
    pub skips: u64,
    pub first_hit: Option<DateTime<Utc>>,
    pub last_hit: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_messages: u64,
    pub failed_messages: u64,
    pub unresolved: u64, // Messages no stage or adapter could place
    pub auto_applied: u64,
    pub batch_review: u64,
    pub individual_review: u64,
    pub log_only: u64,
    pub approvals: u64,
    pub rejections: u64,
    pub edits: u64,
    pub rollbacks: u64,
    pub deep_analysis_failures: u64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    MessageProcessed,
    MessageFailed,
    StageMatched { stage: String },
    Skipped { stage: String },
    Unresolved,
    TierRouted { tier: Tier },
    Decision { decision: Decision },
    Rollback,
    DeepAnalysisFailure,
}

pub struct StatisticsCollector {
    db_path: String,
    sender: mpsc::UnboundedSender<StatEvent>,
    handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    /// Must be called from inside a tokio runtime.
    pub fn new(db_path: String, flush_interval_seconds: u64) -> Result<Self> {
        // Create database directory if it doesn't exist
        if let Some(parent) = Path::new(&db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create stats directory: {}", parent.display())
                })?;
            }
        }
        Self::init_database(&db_path)?;

        let (sender, receiver) = mpsc::unbounded_channel();

        let db_path_clone = db_path.clone();
        let flush_interval_seconds = flush_interval_seconds.max(1);
        let handle = tokio::spawn(async move {
            if let Err(e) =
                Self::stats_worker(db_path_clone, receiver, flush_interval_seconds).await
            {
                log::error!("Statistics worker error: {e}");
            }
        });

        Ok(Self {
            db_path,
            sender,
            handle,
        })
    }

    pub fn record_event(&self, event: StatEvent) {
        if let Err(e) = self.sender.send(event) {
            log::warn!("Failed to send statistics event: {e}");
        }
    }

    /// Close the channel and wait for the worker's final flush.
    pub async fn shutdown(self) {
        let Self { sender, handle, .. } = self;
        drop(sender);
        if let Err(e) = handle.await {
            log::error!("Statistics worker did not shut down cleanly: {e}");
        }
    }

    async fn stats_worker(
        db_path: String,
        mut receiver: mpsc::UnboundedReceiver<StatEvent>,
        flush_interval_seconds: u64,
    ) -> Result<()> {
        let conn = Arc::new(Mutex::new(Self::init_database(&db_path)?));
        let mut buffer: HashMap<String, StageStats> = HashMap::new();
        let mut global_stats = Self::load_global_stats(&conn)?;

        let mut flush_timer = interval(Duration::from_secs(flush_interval_seconds));
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            Self::process_event(event, &mut buffer, &mut global_stats);
                        }
                        None => {
                            // Channel closed, flush and exit
                            Self::flush_to_database(&conn, &buffer, &global_stats)?;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if last_flush.elapsed() >= Duration::from_secs(flush_interval_seconds) {
                        if let Err(e) = Self::flush_to_database(&conn, &buffer, &global_stats) {
                            log::error!("Failed to flush statistics: {e}");
                        } else {
                            buffer.clear();
                            last_flush = Instant::now();
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn process_event(
        event: StatEvent,
        buffer: &mut HashMap<String, StageStats>,
        global_stats: &mut GlobalStats,
    ) {
        let now = Utc::now();
        global_stats.last_updated = now;

        match event {
            StatEvent::MessageProcessed => global_stats.total_messages += 1,
            StatEvent::MessageFailed => global_stats.failed_messages += 1,
            StatEvent::Unresolved => global_stats.unresolved += 1,
            StatEvent::Rollback => global_stats.rollbacks += 1,
            StatEvent::DeepAnalysisFailure => global_stats.deep_analysis_failures += 1,
            StatEvent::TierRouted { tier } => match tier {
                Tier::AutoApply => global_stats.auto_applied += 1,
                Tier::BatchReview => global_stats.batch_review += 1,
                Tier::IndividualReview => global_stats.individual_review += 1,
                Tier::LogOnly => global_stats.log_only += 1,
            },
            StatEvent::Decision { decision } => match decision {
                Decision::Approve => global_stats.approvals += 1,
                Decision::Reject => global_stats.rejections += 1,
                Decision::Edit => global_stats.edits += 1,
            },
            StatEvent::StageMatched { stage } => {
                let stats = Self::stage_entry(buffer, stage, now);
                stats.matches += 1;
            }
            StatEvent::Skipped { stage } => {
                let stats = Self::stage_entry(buffer, stage, now);
                stats.skips += 1;
            }
        }
    }

    fn stage_entry(
        buffer: &mut HashMap<String, StageStats>,
        stage: String,
        now: DateTime<Utc>,
    ) -> &mut StageStats {
        let stats = buffer
            .entry(stage.clone())
            .or_insert_with(|| StageStats {
                stage_name: stage,
                matches: 0,
                skips: 0,
                first_hit: Some(now),
                last_hit: Some(now),
            });
        stats.last_hit = Some(now);
        stats
    }

    fn init_database(db_path: &str) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open statistics database: {db_path}"))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS stage_stats (
                stage_name TEXT PRIMARY KEY,
                matches INTEGER NOT NULL DEFAULT 0,
                skips INTEGER NOT NULL DEFAULT 0,
                first_hit TEXT,
                last_hit TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS global_stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_messages INTEGER NOT NULL DEFAULT 0,
                failed_messages INTEGER NOT NULL DEFAULT 0,
                unresolved INTEGER NOT NULL DEFAULT 0,
                auto_applied INTEGER NOT NULL DEFAULT 0,
                batch_review INTEGER NOT NULL DEFAULT 0,
                individual_review INTEGER NOT NULL DEFAULT 0,
                log_only INTEGER NOT NULL DEFAULT 0,
                approvals INTEGER NOT NULL DEFAULT 0,
                rejections INTEGER NOT NULL DEFAULT 0,
                edits INTEGER NOT NULL DEFAULT 0,
                rollbacks INTEGER NOT NULL DEFAULT 0,
                deep_analysis_failures INTEGER NOT NULL DEFAULT 0,
                start_time TEXT NOT NULL,
                last_updated TEXT NOT NULL
            )",
            [],
        )?;

        // Initialize global stats if not exists
        conn.execute(
            "INSERT OR IGNORE INTO global_stats (id, start_time, last_updated) VALUES (1, ?, ?)",
            params![Utc::now().to_rfc3339(), Utc::now().to_rfc3339()],
        )?;

        Ok(conn)
    }

    fn load_global_stats(conn: &Arc<Mutex<Connection>>) -> Result<GlobalStats> {
        let conn = conn
            .lock()
            .map_err(|_| anyhow::anyhow!("statistics connection lock poisoned"))?;
        Self::read_global_stats(&conn)
    }

    fn read_global_stats(conn: &Connection) -> Result<GlobalStats> {
        let mut stmt = conn.prepare(
            "SELECT total_messages, failed_messages, unresolved, auto_applied, batch_review,
                    individual_review, log_only, approvals, rejections, edits, rollbacks,
                    deep_analysis_failures, start_time, last_updated
             FROM global_stats WHERE id = 1",
        )?;

        let (counts, start_time, last_updated) = stmt.query_row([], |row| {
            let mut counts = [0u64; 12];
            for (i, slot) in counts.iter_mut().enumerate() {
                *slot = row.get(i)?;
            }
            Ok((counts, row.get::<_, String>(12)?, row.get::<_, String>(13)?))
        })?;

        Ok(GlobalStats {
            total_messages: counts[0],
            failed_messages: counts[1],
            unresolved: counts[2],
            auto_applied: counts[3],
            batch_review: counts[4],
            individual_review: counts[5],
            log_only: counts[6],
            approvals: counts[7],
            rejections: counts[8],
            edits: counts[9],
            rollbacks: counts[10],
            deep_analysis_failures: counts[11],
            start_time: parse_time(&start_time)?,
            last_updated: parse_time(&last_updated)?,
        })
    }

    fn flush_to_database(
        conn: &Arc<Mutex<Connection>>,
        buffer: &HashMap<String, StageStats>,
        global_stats: &GlobalStats,
    ) -> Result<()> {
        let conn = conn
            .lock()
            .map_err(|_| anyhow::anyhow!("statistics connection lock poisoned"))?;
        let tx = conn.unchecked_transaction()?;

        // Update global stats
        tx.execute(
            "UPDATE global_stats SET
                total_messages = ?, failed_messages = ?, unresolved = ?, auto_applied = ?,
                batch_review = ?, individual_review = ?, log_only = ?, approvals = ?,
                rejections = ?, edits = ?, rollbacks = ?, deep_analysis_failures = ?,
                last_updated = ?
             WHERE id = 1",
            params![
                global_stats.total_messages,
                global_stats.failed_messages,
                global_stats.unresolved,
                global_stats.auto_applied,
                global_stats.batch_review,
                global_stats.individual_review,
                global_stats.log_only,
                global_stats.approvals,
                global_stats.rejections,
                global_stats.edits,
                global_stats.rollbacks,
                global_stats.deep_analysis_failures,
                global_stats.last_updated.to_rfc3339()
            ],
        )?;

        // Update stage stats
        for stats in buffer.values() {
            tx.execute(
                "INSERT OR REPLACE INTO stage_stats
                 (stage_name, matches, skips, first_hit, last_hit)
                 VALUES (?,
                         COALESCE((SELECT matches FROM stage_stats WHERE stage_name = ?), 0) + ?,
                         COALESCE((SELECT skips FROM stage_stats WHERE stage_name = ?), 0) + ?,
                         COALESCE((SELECT first_hit FROM stage_stats WHERE stage_name = ?), ?),
                         ?)",
                params![
                    stats.stage_name,
                    stats.stage_name, stats.matches,
                    stats.stage_name, stats.skips,
                    stats.stage_name, stats.first_hit.map(|t| t.to_rfc3339()),
                    stats.last_hit.map(|t| t.to_rfc3339()),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<(GlobalStats, Vec<StageStats>)> {
        read_stats(&self.db_path)
    }

    pub fn reset_stats(&self) -> Result<()> {
        reset_stats(&self.db_path)
    }
}

/// Read persisted statistics without running a collector.
pub fn read_stats(db_path: &str) -> Result<(GlobalStats, Vec<StageStats>)> {
    // Initialize database if it doesn't exist
    let conn = StatisticsCollector::init_database(db_path)?;
    let global_stats = StatisticsCollector::read_global_stats(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT stage_name, matches, skips, first_hit, last_hit
         FROM stage_stats ORDER BY matches DESC, stage_name",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let stage_stats = rows
        .into_iter()
        .map(|(stage_name, matches, skips, first_hit, last_hit)| {
            Ok(StageStats {
                stage_name,
                matches,
                skips,
                first_hit: first_hit.as_deref().map(parse_time).transpose()?,
                last_hit: last_hit.as_deref().map(parse_time).transpose()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((global_stats, stage_stats))
}

/// Stage names that have never matched or skipped anything.
pub fn idle_stages(db_path: &str, all_stage_names: &[&str]) -> Result<Vec<String>> {
    let (_, stage_stats) = read_stats(db_path)?;
    let active: std::collections::HashSet<&str> = stage_stats
        .iter()
        .filter(|s| s.matches + s.skips > 0)
        .map(|s| s.stage_name.as_str())
        .collect();

    Ok(all_stage_names
        .iter()
        .filter(|name| !active.contains(**name))
        .map(|name| name.to_string())
        .collect())
}

pub fn reset_stats(db_path: &str) -> Result<()> {
    // Initialize database if it doesn't exist
    let conn = StatisticsCollector::init_database(db_path)?;

    conn.execute("DELETE FROM stage_stats", [])?;
    conn.execute(
        "UPDATE global_stats SET
            total_messages = 0, failed_messages = 0, unresolved = 0, auto_applied = 0,
            batch_review = 0, individual_review = 0, log_only = 0, approvals = 0,
            rejections = 0, edits = 0, rollbacks = 0, deep_analysis_failures = 0,
            start_time = ?, last_updated = ?
         WHERE id = 1",
        params![Utc::now().to_rfc3339(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp in statistics database: {value}"))?
        .with_timezone(&Utc))
}
