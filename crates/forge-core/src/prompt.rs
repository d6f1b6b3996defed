//! Prompt assembly for the implementation and review stages.
//!
//! Kernels own all prompt rendering; the orchestrator never sees prompt
//! text. Accumulated feedback from the previous failed gate is folded in
//! verbatim so the backend reads the failure context before doing new work.

use crate::protocol::{COMPLETION_MARKER, SUMMARY_CLOSE, SUMMARY_OPEN};
use crate::types::WorkflowContext;

/// Render the implementation request for one bounded increment.
pub fn render_impl_prompt(ctx: &WorkflowContext, issue_description: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are implementing issue #{} in the repository at your working directory.\n\n",
        ctx.issue_id
    ));
    prompt.push_str("Issue description:\n");
    prompt.push_str(issue_description.trim());
    prompt.push_str("\n\n");

    if let Some(plan) = &ctx.plan_path {
        prompt.push_str(&format!("The agreed plan is in {plan}. Follow it.\n\n"));
    }

    push_feedback(&mut prompt, "parse gate", ctx.parse_feedback.as_deref());
    push_feedback(&mut prompt, "review", ctx.review_feedback.as_deref());
    push_feedback(&mut prompt, "CI", ctx.ci_feedback.as_deref());

    prompt.push_str(
        "Make one bounded increment of progress. Do not attempt the whole \
         issue in one pass if it is large.\n\n",
    );
    prompt.push_str(&format!(
        "Describe what you changed in a block between {SUMMARY_OPEN} and \
         {SUMMARY_CLOSE}; it becomes the commit message. Always include the \
         block when you changed any file.\n\n"
    ));
    prompt.push_str(&format!(
        "When, and only when, the issue is fully resolved, end your response \
         with this exact marker as the final line:\n{COMPLETION_MARKER}\n"
    ));

    prompt
}

/// Render the review request over an aggregate diff.
pub fn render_review_prompt(ctx: &WorkflowContext, issue_description: &str, diff: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "Review the following change for issue #{}.\n\nIssue description:\n{}\n\n",
        ctx.issue_id,
        issue_description.trim()
    ));
    prompt.push_str("Diff under review:\n");
    prompt.push_str(diff);
    prompt.push_str("\n\n");
    prompt.push_str(
        "Score the change on four dimensions, each 0-100:\n\
         - fidelity: does it implement what the issue asks, exactly?\n\
         - style: is it idiomatic and consistent with the surrounding code?\n\
         - docs: are the changes documented where the codebase documents?\n\
         - corner_cases: are edge cases and failure paths handled?\n\n",
    );
    prompt.push_str(
        "Respond with a single JSON object and nothing else:\n\
         {\"fidelity\": N, \"style\": N, \"docs\": N, \"corner_cases\": N, \
         \"findings\": [\"...\"], \"suggestions\": [\"...\"]}\n",
    );

    prompt
}

fn push_feedback(prompt: &mut String, source: &str, feedback: Option<&str>) {
    if let Some(text) = feedback {
        if !text.trim().is_empty() {
            prompt.push_str(&format!(
                "The previous attempt failed the {source} gate. Read this \
                 failure context carefully and fix it before doing new work:\n{}\n\n",
                text.trim()
            ));
        }
    }
}
