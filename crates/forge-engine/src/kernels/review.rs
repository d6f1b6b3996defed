//! The review kernel: four-dimension scoring over the aggregate diff.

use crate::backend::{Backend, BackendError};
use crate::kernels::StageKernel;
use crate::vcs;
use async_trait::async_trait;
use eyre::WrapErr;
use forge_core::artifacts::{self, ReviewReport};
use forge_core::prompt::render_review_prompt;
use forge_core::review::{gate, parse_review_output, ReviewThresholds};
use forge_core::types::{
    Stage, StageEvent, StageMetrics, StageResult, WorkflowContext, PAYLOAD_REVIEW_FEEDBACK,
    PAYLOAD_REVIEW_SCORE,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ReviewKernel {
    backend: Arc<dyn Backend>,
    thresholds: ReviewThresholds,
    issue_description: String,
    base_branch: String,
}

impl ReviewKernel {
    pub fn new(
        backend: Arc<dyn Backend>,
        thresholds: ReviewThresholds,
        issue_description: String,
        base_branch: String,
    ) -> Self {
        Self {
            backend,
            thresholds,
            issue_description,
            base_branch,
        }
    }
}

impl std::fmt::Debug for ReviewKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewKernel")
            .field("thresholds", &self.thresholds)
            .field("base_branch", &self.base_branch)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StageKernel for ReviewKernel {
    fn stage(&self) -> Stage {
        Stage::Review
    }

    async fn execute(&self, ctx: &WorkflowContext) -> eyre::Result<StageResult> {
        let worktree = Path::new(&ctx.worktree);
        let run_dir = artifacts::ensure_run_dir(worktree, &ctx.issue_id)?;
        let attempt = ctx.review_attempts + 1;

        let diff = vcs::diff_against(worktree, &self.base_branch)?;
        let prompt = render_review_prompt(ctx, &self.issue_description, &diff);

        let response = match self.backend.submit(&prompt, worktree).await {
            Ok(response) => response,
            Err(err @ (BackendError::Timeout(_) | BackendError::ExitCode(_))) => {
                warn!(error = %err, "review call failed, counting as a failed attempt");
                return Ok(StageResult::new(
                    StageEvent::ReviewFailed,
                    format!("review call failed: {err}"),
                ));
            }
            Err(err) => return Err(err).wrap_err("backend unavailable"),
        };

        let raw_path =
            artifacts::write_raw_output(&run_dir, ctx.iteration, Stage::Review, &response.output)
                .wrap_err("failed to write raw review output")?;

        let metrics = StageMetrics {
            duration_ms: response.duration_ms,
            output_bytes: Some(response.output.len() as u64),
        };

        let parsed = match parse_review_output(&response.output) {
            Ok(parsed) => parsed,
            // Not even the free-text fallback recovered four scores. The
            // attempt fails, asking for the strict format next time.
            Err(err) => {
                warn!(error = %err, "review output unrecoverable");
                return Ok(StageResult::new(
                    StageEvent::ReviewFailed,
                    format!("review output unrecoverable: {err}"),
                )
                .with_payload(
                    PAYLOAD_REVIEW_FEEDBACK,
                    "The previous review response could not be scored. Respond with \
                     exactly one JSON object containing the four dimension scores.",
                )
                .with_metrics(metrics));
            }
        };

        let verdict = gate(&parsed.scores, &self.thresholds);
        let overall = parsed.scores.overall();

        let report = ReviewReport {
            issue_id: ctx.issue_id.clone(),
            iteration: ctx.iteration,
            attempt,
            fidelity: parsed.scores.fidelity,
            style: parsed.scores.style,
            docs: parsed.scores.docs,
            corner_cases: parsed.scores.corner_cases,
            passed: verdict.passed,
            failing_dimensions: verdict.failing_dimensions.clone(),
            findings: parsed.findings.clone(),
            suggestions: parsed.suggestions.clone(),
            parse_mode: parsed.parse_mode,
            raw_output_path: raw_path.to_string_lossy().to_string(),
        };
        let artifact =
            artifacts::write_report(&run_dir, ctx.iteration, Stage::Review, "review_report", &report)?;

        info!(
            issue_id = %ctx.issue_id,
            attempt,
            overall,
            passed = verdict.passed,
            parse_mode = ?parsed.parse_mode,
            "review scored"
        );

        if verdict.passed {
            return Ok(StageResult::new(
                StageEvent::ReviewPassed,
                format!("all dimensions above threshold (overall {overall})"),
            )
            .with_payload(PAYLOAD_REVIEW_SCORE, overall.to_string())
            .with_artifact(artifact)
            .with_metrics(metrics));
        }

        let mut feedback = format!(
            "Review failed on: {}.",
            verdict.failing_dimensions.join(", ")
        );
        if !parsed.findings.is_empty() {
            feedback.push_str("\nFindings:\n");
            for finding in &parsed.findings {
                feedback.push_str(&format!("- {finding}\n"));
            }
        }
        if !parsed.suggestions.is_empty() {
            feedback.push_str("\nSuggestions:\n");
            for suggestion in &parsed.suggestions {
                feedback.push_str(&format!("- {suggestion}\n"));
            }
        }

        Ok(StageResult::new(
            StageEvent::ReviewFailed,
            format!(
                "dimensions below threshold: {} (overall {overall})",
                verdict.failing_dimensions.join(", ")
            ),
        )
        .with_payload(PAYLOAD_REVIEW_SCORE, overall.to_string())
        .with_payload(PAYLOAD_REVIEW_FEEDBACK, feedback)
        .with_artifact(artifact)
        .with_metrics(metrics))
    }
}
