//! Stage 1: score the comment with the fast-path classifier and decide.

use super::{JobHandler, JobOutcome};
use crate::classifier::{Classifier, ClassifierOutput};
use crate::components::{ClassifierDecision, Decision, DecisionEngine};
use crate::error::Result;
use crate::events::NewEvent;
use crate::normalization::html_to_text;
use crate::notifier::generic_block_message;
use crate::queue::Job;

pub(super) async fn run(handler: &JobHandler, comment_id: &str) -> Result<JobOutcome> {
    let ports = &handler.collaborators;
    let Some(comment) = ports.comments.get(comment_id).await? else {
        log::info!("Comment {comment_id} not found, skipping classification");
        return Ok(JobOutcome::Skipped);
    };

    let (output, outcome) = classify_markup(
        ports.classifier.as_ref(),
        &handler.engine,
        &handler.settings.classifier_model,
        &comment.content,
    )
    .await?;
    log::info!(
        "Comment {comment_id} classified: {}",
        outcome.summary(handler.engine.get_config())
    );

    ports
        .events
        .append(NewEvent::classifier(
            comment_id,
            &handler.settings.classifier_model,
            &outcome,
            output.flags,
            output.scores,
        ))
        .await?;

    match outcome.decision {
        Decision::Allow => handler.apply_decision(comment_id, Decision::Allow).await?,
        Decision::Block => {
            handler.apply_decision(comment_id, Decision::Block).await?;
            let body = generic_block_message(outcome.top_category, None);
            handler.notify_author(&comment, &body).await;
        }
        Decision::Review => {
            let job_id = ports.queue.enqueue(&Job::review(comment_id)).await?;
            log::info!("Comment {comment_id} sent to contextual review as job {job_id}");
        }
    }

    Ok(JobOutcome::Decided(outcome.decision))
}

/// Normalize markup, classify it and apply the thresholds. Performs no writes.
pub async fn classify_markup(
    classifier: &dyn Classifier,
    engine: &DecisionEngine,
    model: &str,
    markup: &str,
) -> Result<(ClassifierOutput, ClassifierDecision)> {
    let text = html_to_text(markup);
    let output = classifier.classify(model, &text).await?;
    let outcome = engine.classify(&output.scores);
    Ok((output, outcome))
}
