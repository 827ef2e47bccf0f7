//! Stage workers
//!
//! `JobHandler` owns the collaborator ports and routes each job to its stage.
//! Handlers return `Err` only for failures the queue should retry.

pub mod classifier_worker;
pub mod reviewer_worker;

use crate::classifier::Classifier;
use crate::comment::{Comment, CommentStore};
use crate::components::{Decision, DecisionEngine};
use crate::config::Config;
use crate::error::Result;
use crate::events::EventStore;
use crate::notifier::Notifier;
use crate::queue::{Job, JobQueue};
use crate::reviewer::Reviewer;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The comment no longer exists
    Skipped,
    /// An event was written with this decision
    Decided(Decision),
    /// The reviewer produced no usable verdict; nothing was written
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub classifier_model: String,
    pub reviewer_model: String,
    pub reasoning_effort: String,
    pub notification_title: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            classifier_model: config.classifier.model.clone(),
            reviewer_model: config.reviewer.model.clone(),
            reasoning_effort: config.reviewer.reasoning_effort.clone(),
            notification_title: config.notifier.title.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub comments: Arc<dyn CommentStore>,
    pub events: Arc<dyn EventStore>,
    pub classifier: Arc<dyn Classifier>,
    pub reviewer: Arc<dyn Reviewer>,
    pub notifier: Arc<dyn Notifier>,
    pub queue: Arc<dyn JobQueue>,
}

pub struct JobHandler {
    collaborators: Collaborators,
    engine: DecisionEngine,
    settings: PipelineSettings,
}

impl JobHandler {
    pub fn new(collaborators: Collaborators, engine: DecisionEngine, settings: PipelineSettings) -> Self {
        Self {
            collaborators,
            engine,
            settings,
        }
    }

    pub async fn handle(&self, job: &Job) -> Result<JobOutcome> {
        match job {
            Job::Classify { comment_id } => classifier_worker::run(self, comment_id).await,
            Job::Review { comment_id } => reviewer_worker::run(self, comment_id).await,
        }
    }

    /// Apply the visibility a final decision implies. REVIEW leaves the
    /// comment untouched.
    async fn apply_decision(&self, comment_id: &str, decision: Decision) -> Result<()> {
        if let Some((status, is_deleted)) = decision.visibility() {
            self.collaborators
                .comments
                .update_visibility(comment_id, status, is_deleted)
                .await?;
            log::debug!("Comment {comment_id} set to {status} (deleted: {is_deleted})");
        }
        Ok(())
    }

    async fn notify_author(&self, comment: &Comment, body: &str) {
        if let Err(e) = self
            .collaborators
            .notifier
            .notify(&comment.author_id, &self.settings.notification_title, body)
            .await
        {
            log::warn!(
                "Failed to notify author {} of blocked comment {}: {e}",
                comment.author_id,
                comment.id
            );
        }
    }
}
