//! Durable job queue
//!
//! Jobs live in a `moderation_jobs` table next to the comments they refer to.
//! Delivery is at-least-once: a claimed row is `running` until its outcome is
//! recorded, and rows left `running` by a crash are requeued on startup.

use crate::config::QueueConfig;
use crate::db;
use crate::error::{ModerationError, Result};
use crate::events::Stage;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

pub const CLASSIFY_JOB: &str = "omni_moderation";
pub const REVIEW_JOB: &str = "llm_moderation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Stage 1: fast-path classification
    Classify { comment_id: String },
    /// Stage 2: contextual review of a borderline comment
    Review { comment_id: String },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobPayload {
    comment_id: String,
}

impl Job {
    pub fn classify(comment_id: &str) -> Self {
        Job::Classify {
            comment_id: comment_id.to_string(),
        }
    }

    pub fn review(comment_id: &str) -> Self {
        Job::Review {
            comment_id: comment_id.to_string(),
        }
    }

    pub fn job_type(&self) -> &'static str {
        match self {
            Job::Classify { .. } => CLASSIFY_JOB,
            Job::Review { .. } => REVIEW_JOB,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Job::Classify { .. } => Stage::Classifier,
            Job::Review { .. } => Stage::Reviewer,
        }
    }

    pub fn comment_id(&self) -> &str {
        match self {
            Job::Classify { comment_id } | Job::Review { comment_id } => comment_id,
        }
    }

    pub fn payload(&self) -> Result<String> {
        Ok(serde_json::to_string(&JobPayload {
            comment_id: self.comment_id().to_string(),
        })?)
    }

    /// Rebuild a job from its stored type and payload.
    pub fn from_parts(job_type: &str, payload: &str) -> Result<Self> {
        let builder: fn(&str) -> Job = match job_type {
            CLASSIFY_JOB => Job::classify,
            REVIEW_JOB => Job::review,
            other => return Err(ModerationError::UnknownJobType(other.to_string())),
        };
        let payload: JobPayload = serde_json::from_str(payload)?;
        Ok(builder(&payload.comment_id))
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.job_type(), self.comment_id())
    }
}

/// Producer side of the queue, as seen by the workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Unresolved,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Unresolved => "unresolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "unresolved" => Some(JobState::Unresolved),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row handed to a worker. `attempts` includes the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: i64,
    pub job_type: String,
    pub payload: String,
    pub attempts: u32,
}

impl ClaimedJob {
    pub fn job(&self) -> Result<Job> {
        Job::from_parts(&self.job_type, &self.payload)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub job_type: String,
    pub payload: String,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { delay: Duration },
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long a claim stays owned by its worker before it counts as abandoned.
    pub lease: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            lease: Duration::from_secs(config.lease_seconds),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Delay before retry number `attempts`: base doubled per prior attempt,
/// capped at `max`.
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
    policy: RetryPolicy,
}

impl SqliteJobQueue {
    pub fn open(path: &str, policy: RetryPolicy) -> Result<Self> {
        Self::from_connection(db::open(path)?, policy)
    }

    pub fn open_in_memory(policy: RetryPolicy) -> Result<Self> {
        Self::from_connection(db::open_in_memory()?, policy)
    }

    fn from_connection(conn: Connection, policy: RetryPolicy) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS moderation_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                available_at TEXT NOT NULL,
                last_error TEXT,
                lease_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_moderation_jobs_due
                ON moderation_jobs (state, available_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            policy,
        })
    }

    /// Insert a row as an external producer would, without validating it.
    pub fn enqueue_raw(&self, job_type: &str, payload: &str) -> Result<i64> {
        let now = db::now();
        let conn = db::lock(&self.conn);
        conn.execute(
            "INSERT INTO moderation_jobs (job_type, payload, state, attempts, available_at, created_at, updated_at)
             VALUES (?1, ?2, 'queued', 0, ?3, ?3, ?3)",
            params![job_type, payload, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim the oldest due job, marking it `running` under a lease.
    pub fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        let claimed_at = Utc::now();
        let now = db::timestamp(claimed_at);
        let lease_expires_at = db::timestamp(claimed_at + to_chrono(self.policy.lease));
        let conn = db::lock(&self.conn);
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let claimed = tx
            .query_row(
                "SELECT id, job_type, payload, attempts FROM moderation_jobs
                 WHERE state = 'queued' AND available_at <= ?1
                 ORDER BY available_at ASC, id ASC
                 LIMIT 1",
                params![now],
                |row| {
                    Ok(ClaimedJob {
                        id: row.get(0)?,
                        job_type: row.get(1)?,
                        payload: row.get(2)?,
                        attempts: row.get::<_, u32>(3)? + 1,
                    })
                },
            )
            .optional()?;

        if let Some(job) = &claimed {
            tx.execute(
                "UPDATE moderation_jobs
                 SET state = 'running', attempts = ?1, lease_expires_at = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![job.attempts, lease_expires_at, now, job.id],
            )?;
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub fn complete(&self, id: i64) -> Result<()> {
        self.set_terminal(id, JobState::Completed, None)
    }

    /// Finished without a usable result; kept for a human to look at.
    pub fn mark_unresolved(&self, id: i64, reason: &str) -> Result<()> {
        self.set_terminal(id, JobState::Unresolved, Some(reason))
    }

    /// Fail without retrying.
    pub fn dead_letter(&self, id: i64, error: &str) -> Result<()> {
        self.set_terminal(id, JobState::Failed, Some(error))
    }

    fn set_terminal(&self, id: i64, state: JobState, error: Option<&str>) -> Result<()> {
        let conn = db::lock(&self.conn);
        conn.execute(
            "UPDATE moderation_jobs
             SET state = ?1, last_error = COALESCE(?2, last_error), lease_expires_at = NULL, updated_at = ?3
             WHERE id = ?4",
            params![state.as_str(), error, db::now(), id],
        )?;
        Ok(())
    }

    /// Record a failed attempt. The job is requeued with backoff until it has
    /// used up `max_attempts`, then dead-lettered.
    pub fn fail(&self, job: &ClaimedJob, error: &str) -> Result<FailureOutcome> {
        if job.attempts >= self.policy.max_attempts {
            self.dead_letter(job.id, error)?;
            return Ok(FailureOutcome::DeadLettered);
        }

        let delay = backoff_delay(
            job.attempts,
            self.policy.backoff_base,
            self.policy.backoff_max,
        );
        let now = Utc::now();
        let available_at = now + to_chrono(delay);
        let conn = db::lock(&self.conn);
        conn.execute(
            "UPDATE moderation_jobs
             SET state = 'queued', last_error = ?1, available_at = ?2, lease_expires_at = NULL, updated_at = ?3
             WHERE id = ?4",
            params![
                error,
                db::timestamp(available_at),
                db::timestamp(now),
                job.id
            ],
        )?;
        Ok(FailureOutcome::Retrying { delay })
    }

    /// Requeue `running` rows whose lease has run out. Claims still held by
    /// a live worker, in this process or another, are left alone.
    pub fn recover_running(&self) -> Result<usize> {
        let now = db::now();
        let conn = db::lock(&self.conn);
        let recovered = conn.execute(
            "UPDATE moderation_jobs
             SET state = 'queued', available_at = ?1, lease_expires_at = NULL, updated_at = ?1
             WHERE state = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)",
            params![now],
        )?;
        Ok(recovered)
    }

    /// Delete completed rows older than `retain_completed`, and failed or
    /// unresolved rows older than `retain_failed`.
    pub fn prune_finished(&self, retain_completed: Duration, retain_failed: Duration) -> Result<usize> {
        let now = Utc::now();
        let cutoff = |age: Duration| db::timestamp(now - to_chrono(age));
        let conn = db::lock(&self.conn);
        let completed = conn.execute(
            "DELETE FROM moderation_jobs WHERE state = 'completed' AND updated_at < ?1",
            params![cutoff(retain_completed)],
        )?;
        let failed = conn.execute(
            "DELETE FROM moderation_jobs
             WHERE state IN ('failed', 'unresolved') AND updated_at < ?1",
            params![cutoff(retain_failed)],
        )?;
        Ok(completed + failed)
    }

    /// Jobs that need a human: unresolved verdicts and dead letters.
    pub fn list_stuck(&self) -> Result<Vec<JobRecord>> {
        let conn = db::lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT id, job_type, payload, state, attempts, last_error, created_at, updated_at
             FROM moderation_jobs
             WHERE state IN ('unresolved', 'failed')
             ORDER BY updated_at ASC, id ASC",
        )?;
        let records = stmt
            .query_map([], Self::record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get(&self, id: i64) -> Result<Option<JobRecord>> {
        let conn = db::lock(&self.conn);
        let record = conn
            .query_row(
                "SELECT id, job_type, payload, state, attempts, last_error, created_at, updated_at
                 FROM moderation_jobs WHERE id = ?1",
                params![id],
                Self::record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Row count per state, for operator output.
    pub fn state_counts(&self) -> Result<Vec<(JobState, u64)>> {
        let conn = db::lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM moderation_jobs GROUP BY state ORDER BY state",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(state, count)| JobState::parse(&state).map(|s| (s, count)))
            .collect())
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
        let state: String = row.get(3)?;
        Ok(JobRecord {
            id: row.get(0)?,
            job_type: row.get(1)?,
            payload: row.get(2)?,
            state: JobState::parse(&state).unwrap_or(JobState::Failed),
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<i64> {
        let id = self.enqueue_raw(job.job_type(), &job.payload()?)?;
        log::debug!("Enqueued job {id} {job}");
        Ok(id)
    }
}
