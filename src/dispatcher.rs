//! Worker pool over the durable queue
//!
//! Each worker claims one job at a time, runs it through the `JobHandler` and
//! records the outcome. Shutdown is signalled through a watch channel; jobs in
//! flight run to completion.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::queue::{FailureOutcome, SqliteJobQueue};
use crate::statistics::{StatOutcome, StatisticsCollector};
use crate::workers::{JobHandler, JobOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<SqliteJobQueue>,
    handler: Arc<JobHandler>,
    stats: Option<Arc<StatisticsCollector>>,
    config: QueueConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<SqliteJobQueue>,
        handler: Arc<JobHandler>,
        stats: Option<StatisticsCollector>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            stats: stats.map(Arc::new),
            config,
        }
    }

    /// Claim and run a single job. Returns `false` when nothing was due.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(claimed) = self.queue.claim_next()? else {
            return Ok(false);
        };

        let job = match claimed.job() {
            Ok(job) => job,
            Err(e) => {
                log::error!("Job {} cannot be run and was dead-lettered: {e}", claimed.id);
                self.queue.dead_letter(claimed.id, &e.to_string())?;
                return Ok(true);
            }
        };

        log::debug!("Job {} {job} attempt {}", claimed.id, claimed.attempts);
        let started = Instant::now();
        let stat = match self.handler.handle(&job).await {
            Ok(JobOutcome::Unresolved) => {
                self.queue
                    .mark_unresolved(claimed.id, "reviewer returned no usable verdict")?;
                log::warn!(
                    "Job {} for comment {} needs manual review",
                    claimed.id,
                    job.comment_id()
                );
                StatOutcome::Unresolved
            }
            Ok(outcome) => {
                self.queue.complete(claimed.id)?;
                StatOutcome::from(outcome)
            }
            Err(e) => match self.queue.fail(&claimed, &e.to_string())? {
                FailureOutcome::Retrying { delay } => {
                    log::warn!(
                        "Job {} {job} failed on attempt {}, retrying in {:?}: {e}",
                        claimed.id,
                        claimed.attempts,
                        delay
                    );
                    StatOutcome::Retried
                }
                FailureOutcome::DeadLettered => {
                    log::error!(
                        "Job {} {job} dead-lettered after {} attempts: {e}",
                        claimed.id,
                        claimed.attempts
                    );
                    StatOutcome::DeadLettered
                }
            },
        };

        if let Some(stats) = &self.stats {
            stats.record_job(job.stage(), stat, started.elapsed());
        }
        Ok(true)
    }

    /// Run the worker pool until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let recovered = self.queue.recover_running()?;
        if recovered > 0 {
            log::warn!("Requeued {recovered} jobs whose worker lease expired");
        }

        log::info!("Starting {} moderation workers", self.config.workers);
        let mut tasks = Vec::with_capacity(self.config.workers + 1);
        for worker_id in 0..self.config.workers {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                worker.worker_loop(worker_id, shutdown).await
            }));
        }
        let pruner = self.clone();
        let pruner_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            pruner.prune_loop(pruner_shutdown).await
        }));

        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Worker task panicked: {e}");
            }
        }

        let Dispatcher { stats, .. } = self;
        if let Some(stats) = stats.and_then(|s| Arc::try_unwrap(s).ok()) {
            stats.shutdown().await;
        }
        log::info!("All moderation workers stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => log::error!("Worker {worker_id}: queue error: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::debug!("Worker {worker_id} stopped");
    }

    async fn prune_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let retain_completed = Duration::from_secs(self.config.retain_completed_seconds);
        let retain_failed = Duration::from_secs(self.config.retain_failed_seconds);
        loop {
            match self.queue.recover_running() {
                Ok(0) => {}
                Ok(recovered) => log::warn!("Requeued {recovered} jobs whose worker lease expired"),
                Err(e) => log::error!("Failed to recover abandoned jobs: {e}"),
            }
            match self.queue.prune_finished(retain_completed, retain_failed) {
                Ok(0) => {}
                Ok(pruned) => log::info!("Pruned {pruned} finished jobs"),
                Err(e) => log::error!("Failed to prune finished jobs: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
