use crate::components::Decision;
use crate::db;
use crate::events::Stage;
use crate::workers::JobOutcome;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

/// What happened to one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatOutcome {
    Allow,
    Review,
    Block,
    Skipped,
    Unresolved,
    Retried,
    DeadLettered,
}

impl StatOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatOutcome::Allow => "allow",
            StatOutcome::Review => "review",
            StatOutcome::Block => "block",
            StatOutcome::Skipped => "skipped",
            StatOutcome::Unresolved => "unresolved",
            StatOutcome::Retried => "retried",
            StatOutcome::DeadLettered => "dead_lettered",
        }
    }
}

impl From<JobOutcome> for StatOutcome {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Skipped => StatOutcome::Skipped,
            JobOutcome::Unresolved => StatOutcome::Unresolved,
            JobOutcome::Decided(Decision::Allow) => StatOutcome::Allow,
            JobOutcome::Decided(Decision::Review) => StatOutcome::Review,
            JobOutcome::Decided(Decision::Block) => StatOutcome::Block,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub stage: String,
    pub outcome: String,
    pub count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub total_processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_jobs: u64,
    pub total_allows: u64,
    pub total_blocks: u64,
    pub total_reviews: u64,
    pub total_failures: u64, // Retries and dead letters
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingTotals {
    jobs: u64,
    allows: u64,
    blocks: u64,
    reviews: u64,
    failures: u64,
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    JobProcessed {
        stage: Stage,
        outcome: StatOutcome,
        processing_time_ms: u64,
    },
}

pub struct StatisticsCollector {
    db_path: String,
    sender: mpsc::UnboundedSender<StatEvent>,
    handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    pub fn new(db_path: String, flush_interval_seconds: u64) -> Result<Self> {
        // Create database directory if it doesn't exist
        if let Some(parent) = Path::new(&db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create stats directory: {}", parent.display())
                })?;
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let flush_interval = Duration::from_secs(flush_interval_seconds.max(1));

        let db_path_clone = db_path.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = Self::stats_worker(db_path_clone, receiver, flush_interval).await {
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

    pub fn record_job(&self, stage: Stage, outcome: StatOutcome, elapsed: Duration) {
        self.record_event(StatEvent::JobProcessed {
            stage,
            outcome,
            processing_time_ms: elapsed.as_millis() as u64,
        });
    }

    /// Close the channel and wait for the final flush.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.handle.await {
            log::error!("Statistics worker did not shut down cleanly: {e}");
        }
    }

    async fn stats_worker(
        db_path: String,
        mut receiver: mpsc::UnboundedReceiver<StatEvent>,
        flush_interval: Duration,
    ) -> Result<()> {
        let conn = Self::init_database(&db_path)?;
        let mut buffer: HashMap<(Stage, StatOutcome), OutcomeStats> = HashMap::new();
        let mut totals = PendingTotals::default();

        let mut flush_timer = interval(flush_interval);
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            Self::process_event(event, &mut buffer, &mut totals);
                        }
                        None => {
                            // Channel closed, flush and exit
                            Self::flush_to_database(&conn, &buffer, &totals)?;
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if last_flush.elapsed() >= flush_interval {
                        if let Err(e) = Self::flush_to_database(&conn, &buffer, &totals) {
                            log::error!("Failed to flush statistics: {e}");
                        } else {
                            buffer.clear();
                            totals = PendingTotals::default();
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
        buffer: &mut HashMap<(Stage, StatOutcome), OutcomeStats>,
        totals: &mut PendingTotals,
    ) {
        let now = Utc::now();
        totals.last_updated = Some(now);

        match event {
            StatEvent::JobProcessed {
                stage,
                outcome,
                processing_time_ms,
            } => {
                let stats = buffer
                    .entry((stage, outcome))
                    .or_insert_with(|| OutcomeStats {
                        stage: stage.as_str().to_string(),
                        outcome: outcome.as_str().to_string(),
                        count: 0,
                        first_seen: Some(now),
                        last_seen: Some(now),
                        total_processing_time_ms: 0,
                    });

                stats.count += 1;
                stats.last_seen = Some(now);
                stats.total_processing_time_ms += processing_time_ms;

                totals.jobs += 1;
                match outcome {
                    StatOutcome::Allow => totals.allows += 1,
                    StatOutcome::Block => totals.blocks += 1,
                    StatOutcome::Review => totals.reviews += 1,
                    StatOutcome::Retried | StatOutcome::DeadLettered => totals.failures += 1,
                    StatOutcome::Skipped | StatOutcome::Unresolved => {}
                }
            }
        }
    }

    fn init_database(db_path: &str) -> Result<Connection> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open statistics database: {db_path}"))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS outcome_stats (
                stage TEXT NOT NULL,
                outcome TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT,
                last_seen TEXT,
                total_processing_time_ms INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (stage, outcome)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS global_stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                total_jobs INTEGER NOT NULL DEFAULT 0,
                total_allows INTEGER NOT NULL DEFAULT 0,
                total_blocks INTEGER NOT NULL DEFAULT 0,
                total_reviews INTEGER NOT NULL DEFAULT 0,
                total_failures INTEGER NOT NULL DEFAULT 0,
                start_time TEXT NOT NULL,
                last_updated TEXT NOT NULL
            )",
            [],
        )?;

        // Initialize global stats if not exists
        let now = db::now();
        conn.execute(
            "INSERT OR IGNORE INTO global_stats (id, start_time, last_updated) VALUES (1, ?, ?)",
            params![now, now],
        )?;

        Ok(conn)
    }

    fn load_global_stats(conn: &Connection) -> Result<GlobalStats> {
        let mut stmt = conn.prepare(
            "SELECT total_jobs, total_allows, total_blocks, total_reviews,
                    total_failures, start_time, last_updated
             FROM global_stats WHERE id = 1",
        )?;

        let (mut stats, start_time, last_updated) = stmt.query_row([], |row| {
            Ok((
                GlobalStats {
                    total_jobs: row.get(0)?,
                    total_allows: row.get(1)?,
                    total_blocks: row.get(2)?,
                    total_reviews: row.get(3)?,
                    total_failures: row.get(4)?,
                    start_time: Utc::now(),
                    last_updated: Utc::now(),
                },
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        stats.start_time = db::parse_timestamp(&start_time)
            .with_context(|| format!("Invalid start_time in statistics: {start_time}"))?;
        stats.last_updated = db::parse_timestamp(&last_updated)
            .with_context(|| format!("Invalid last_updated in statistics: {last_updated}"))?;

        Ok(stats)
    }

    /// Add buffered counts to the stored ones. Counts are applied as deltas so
    /// a reset from another process is not overwritten.
    fn flush_to_database(
        conn: &Connection,
        buffer: &HashMap<(Stage, StatOutcome), OutcomeStats>,
        totals: &PendingTotals,
    ) -> Result<()> {
        let Some(last_updated) = totals.last_updated else {
            return Ok(());
        };
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "UPDATE global_stats SET
                total_jobs = total_jobs + ?, total_allows = total_allows + ?,
                total_blocks = total_blocks + ?, total_reviews = total_reviews + ?,
                total_failures = total_failures + ?, last_updated = ?
             WHERE id = 1",
            params![
                totals.jobs,
                totals.allows,
                totals.blocks,
                totals.reviews,
                totals.failures,
                db::timestamp(last_updated)
            ],
        )?;

        for stats in buffer.values() {
            tx.execute(
                "INSERT INTO outcome_stats
                 (stage, outcome, count, first_seen, last_seen, total_processing_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (stage, outcome) DO UPDATE SET
                    count = count + excluded.count,
                    first_seen = COALESCE(first_seen, excluded.first_seen),
                    last_seen = excluded.last_seen,
                    total_processing_time_ms = total_processing_time_ms + excluded.total_processing_time_ms",
                params![
                    stats.stage,
                    stats.outcome,
                    stats.count,
                    stats.first_seen.map(db::timestamp),
                    stats.last_seen.map(db::timestamp),
                    stats.total_processing_time_ms,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<(GlobalStats, Vec<OutcomeStats>)> {
        let conn = Self::init_database(&self.db_path)?;
        let global_stats = Self::load_global_stats(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT stage, outcome, count, first_seen, last_seen, total_processing_time_ms
             FROM outcome_stats ORDER BY stage, count DESC",
        )?;

        let outcome_stats = stmt
            .query_map([], |row| {
                Ok(OutcomeStats {
                    stage: row.get(0)?,
                    outcome: row.get(1)?,
                    count: row.get(2)?,
                    first_seen: row
                        .get::<_, Option<String>>(3)?
                        .and_then(|s| db::parse_timestamp(&s)),
                    last_seen: row
                        .get::<_, Option<String>>(4)?
                        .and_then(|s| db::parse_timestamp(&s)),
                    total_processing_time_ms: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((global_stats, outcome_stats))
    }

    pub fn reset_stats(&self) -> Result<()> {
        let conn = Self::init_database(&self.db_path)?;
        let now = db::now();

        conn.execute("DELETE FROM outcome_stats", [])?;
        conn.execute(
            "UPDATE global_stats SET
                total_jobs = 0, total_allows = 0, total_blocks = 0, total_reviews = 0,
                total_failures = 0, start_time = ?, last_updated = ?
             WHERE id = 1",
            params![now, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_flushed_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db").to_str().unwrap().to_string();

        let collector = StatisticsCollector::new(path.clone(), 60).unwrap();
        collector.record_job(Stage::Classifier, StatOutcome::Block, Duration::from_millis(12));
        collector.record_job(Stage::Classifier, StatOutcome::Block, Duration::from_millis(8));
        collector.record_job(Stage::Classifier, StatOutcome::Review, Duration::from_millis(5));
        collector.record_job(Stage::Reviewer, StatOutcome::Unresolved, Duration::from_millis(900));
        collector.record_job(Stage::Reviewer, StatOutcome::Retried, Duration::from_millis(30));
        collector.shutdown().await;

        let reader = StatisticsCollector::new(path, 60).unwrap();
        let (global, outcomes) = reader.get_stats().unwrap();
        assert_eq!(global.total_jobs, 5);
        assert_eq!(global.total_blocks, 2);
        assert_eq!(global.total_reviews, 1);
        assert_eq!(global.total_failures, 1);

        let blocks = outcomes
            .iter()
            .find(|s| s.stage == "classifier" && s.outcome == "block")
            .unwrap();
        assert_eq!(blocks.count, 2);
        assert_eq!(blocks.total_processing_time_ms, 20);
        assert_eq!(outcomes.len(), 4);

        reader.reset_stats().unwrap();
        let (global, outcomes) = reader.get_stats().unwrap();
        assert_eq!(global.total_jobs, 0);
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_job_outcomes_map_to_stat_outcomes() {
        assert_eq!(
            StatOutcome::from(JobOutcome::Decided(Decision::Block)),
            StatOutcome::Block
        );
        assert_eq!(StatOutcome::from(JobOutcome::Skipped), StatOutcome::Skipped);
        assert_eq!(StatOutcome::DeadLettered.as_str(), "dead_lettered");
    }
}
