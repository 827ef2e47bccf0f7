//! Stage 2: contextual review of comments the classifier could not settle.

use super::{JobHandler, JobOutcome};
use crate::comment::CommentThread;
use crate::components::verdict::{MAX_EVIDENCE_CHARS, MAX_REASON_CHARS, SCHEMA_NAME};
use crate::components::{parse_verdict, verdict_schema, Decision};
use crate::error::Result;
use crate::events::NewEvent;
use crate::normalization::html_to_text;
use crate::notifier::reviewer_block_message;
use crate::reviewer::ReviewRequest;
use crate::taxonomy::Category;

pub(super) async fn run(handler: &JobHandler, comment_id: &str) -> Result<JobOutcome> {
    let ports = &handler.collaborators;
    let Some(thread) = ports.comments.get_with_ancestor(comment_id).await? else {
        log::info!("Comment {comment_id} not found, skipping review");
        return Ok(JobOutcome::Skipped);
    };

    let context = build_context(&thread);
    let prompt = system_prompt();
    let schema = verdict_schema();
    let request = ReviewRequest {
        model: &handler.settings.reviewer_model,
        system_prompt: &prompt,
        user_content: &context,
        output_schema: &schema,
        effort: &handler.settings.reasoning_effort,
    };

    let Some(text) = ports.reviewer.review(&request).await? else {
        log::warn!("Reviewer returned no verdict for comment {comment_id}");
        return Ok(JobOutcome::Unresolved);
    };
    let verdict = match parse_verdict(&text) {
        Ok(verdict) => verdict,
        Err(e) => {
            log::warn!("Discarding malformed verdict for comment {comment_id}: {e}");
            return Ok(JobOutcome::Unresolved);
        }
    };

    let decision = Decision::from(verdict.decision);
    log::info!(
        "Comment {comment_id} reviewed: {decision} ({}): {}",
        verdict.top_category,
        verdict.reason
    );

    ports
        .events
        .append(NewEvent::reviewer(
            comment_id,
            &handler.settings.reviewer_model,
            &verdict,
        ))
        .await?;
    handler.apply_decision(comment_id, decision).await?;

    if decision == Decision::Block {
        let body = reviewer_block_message(&verdict.reason, &verdict.evidence, verdict.top_category);
        handler.notify_author(&thread.comment, &body).await;
    }

    Ok(JobOutcome::Decided(decision))
}

/// Plain-text context for the reviewer, one line per available fact.
pub fn build_context(thread: &CommentThread) -> String {
    let comment = &thread.comment;
    let mut lines = Vec::with_capacity(3);

    if !comment.source.is_empty() {
        lines.push(format!("From: {}({})", comment.source, comment.source_id));
    }
    if let Some(ancestor) = thread.ancestor_content.as_deref() {
        let ancestor = html_to_text(ancestor);
        if !ancestor.is_empty() {
            lines.push(format!("Replying to: \"{ancestor}\""));
        }
    }
    lines.push(format!("Comment: \"{}\"", html_to_text(&comment.content)));

    lines.join("\n")
}

pub fn system_prompt() -> String {
    let categories = Category::ALL
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You moderate comments on a community site for game and visual novel reviews. \
Decide whether the comment must be blocked.\n\
\n\
Be lenient. Gaming slang, memes, spoilers, hyperbole and heated opinions about games, \
studios or characters are normal here and should be allowed. Block only content that \
clearly targets a person with abuse or threats, sexualizes minors, encourages self-harm, \
promotes violence or illegal activity, or is hateful toward a protected group.\n\
\n\
The only legal category values are: {categories}. \
Use \"{sentinel}\" as top_category when none applies.\n\
\n\
Respond with the {SCHEMA_NAME} JSON object:\n\
- decision: ALLOW or BLOCK\n\
- reason: a short explanation, at most {MAX_REASON_CHARS} characters\n\
- evidence: the offending excerpt quoted from the comment, or an empty string, \
at most {MAX_EVIDENCE_CHARS} characters\n\
- top_category: the most relevant category\n\
- categories_json: an object mapping every category to true or false",
        sentinel = Category::SENTINEL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comment::Comment;

    fn thread(ancestor: Option<&str>) -> CommentThread {
        CommentThread {
            comment: Comment::new("c1", "u1", "galgame", "g42", "<p>This route is <b>trash</b></p>"),
            ancestor_content: ancestor.map(str::to_string),
        }
    }

    #[test]
    fn test_context_with_ancestor() {
        let context = build_context(&thread(Some("<p>Best route &amp; ending</p>")));
        assert_eq!(
            context,
            "From: galgame(g42)\nReplying to: \"Best route & ending\"\nComment: \"This route is trash\""
        );
    }

    #[test]
    fn test_context_omits_missing_lines() {
        let context = build_context(&thread(None));
        assert_eq!(context, "From: galgame(g42)\nComment: \"This route is trash\"");

        let mut bare = thread(Some("<p> </p>"));
        bare.comment.source = String::new();
        assert_eq!(build_context(&bare), "Comment: \"This route is trash\"");
    }

    #[test]
    fn test_system_prompt_lists_taxonomy() {
        let prompt = system_prompt();
        for category in Category::ALL {
            assert!(prompt.contains(category.as_str()));
        }
        assert!(prompt.contains("lenient"));
        assert!(prompt.contains("\"harassment\""));
    }
}
