//! The implementation kernel: one bounded increment of backend work,
//! committed and parse-gated.

use crate::backend::{Backend, BackendError};
use crate::kernels::StageKernel;
use crate::parse_gate::ParseGate;
use crate::vcs;
use async_trait::async_trait;
use eyre::{bail, WrapErr};
use forge_core::artifacts;
use forge_core::prompt::render_impl_prompt;
use forge_core::protocol::{check_completion, extract_change_summary};
use forge_core::types::{
    Stage, StageEvent, StageMetrics, StageResult, WorkflowContext, PAYLOAD_PARSE_FEEDBACK,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ImplementKernel {
    backend: Arc<dyn Backend>,
    gate: ParseGate,
    issue_description: String,
}

impl ImplementKernel {
    pub fn new(backend: Arc<dyn Backend>, gate: ParseGate, issue_description: String) -> Self {
        Self {
            backend,
            gate,
            issue_description,
        }
    }
}

impl std::fmt::Debug for ImplementKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImplementKernel").finish_non_exhaustive()
    }
}

#[async_trait]
impl StageKernel for ImplementKernel {
    fn stage(&self) -> Stage {
        Stage::Impl
    }

    async fn execute(&self, ctx: &WorkflowContext) -> eyre::Result<StageResult> {
        let worktree = Path::new(&ctx.worktree);
        let run_dir = artifacts::ensure_run_dir(worktree, &ctx.issue_id)?;

        let prompt = render_impl_prompt(ctx, &self.issue_description);
        let response = match self.backend.submit(&prompt, worktree).await {
            Ok(response) => response,
            // A flaky backend call is retried as another iteration, bounded
            // by the iteration budget.
            Err(err @ (BackendError::Timeout(_) | BackendError::ExitCode(_))) => {
                warn!(error = %err, "backend call failed, retrying as a new iteration");
                return Ok(StageResult::new(
                    StageEvent::ImplNotDone,
                    format!("backend call failed: {err}"),
                ));
            }
            Err(err) => return Err(err).wrap_err("backend unavailable"),
        };

        artifacts::write_raw_output(&run_dir, ctx.iteration, Stage::Impl, &response.output)
            .wrap_err("failed to write raw implementation output")?;

        let marker = check_completion(&response.output);
        let summary = extract_change_summary(&response.output);

        let committed = if vcs::has_uncommitted_changes(worktree)? {
            let Some(summary) = summary else {
                bail!(
                    "backend changed files in {} without a change summary block",
                    ctx.worktree
                );
            };
            vcs::commit_all(worktree, &summary)?
        } else {
            false
        };

        // After a parse failure the offending files are already committed,
        // so HEAD must be re-gated even when this increment changed nothing.
        let changed_files = if committed || ctx.consecutive_parse_failures > 0 {
            vcs::changed_files_in_head(worktree)?
        } else {
            Vec::new()
        };

        let metrics = StageMetrics {
            duration_ms: response.duration_ms,
            output_bytes: Some(response.output.len() as u64),
        };

        let outcome = self.gate.run(worktree, &changed_files).await?;
        if !outcome.passed {
            let report = outcome.into_report(&ctx.issue_id, ctx.iteration);
            let feedback = format!(
                "{}\n\n{}",
                report.suggestion,
                report
                    .failing_files
                    .iter()
                    .map(|f| format!("{}:\n{}", f.file, f.trace))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            );
            let failing = report.failing_files.len();
            let artifact =
                artifacts::write_report(&run_dir, ctx.iteration, Stage::Impl, "parse_report", &report)?;

            return Ok(StageResult::new(
                StageEvent::ParseFail,
                format!("{failing} changed file(s) failed the parse gate"),
            )
            .with_payload(PAYLOAD_PARSE_FEEDBACK, feedback)
            .with_artifact(artifact)
            .with_metrics(metrics));
        }

        if marker.is_complete {
            info!(issue_id = %ctx.issue_id, "completion marker accepted");
            return Ok(StageResult::new(
                StageEvent::ImplDone,
                "completion marker present and parse gate passed",
            )
            .with_metrics(metrics));
        }

        let reason = if marker.is_malformed {
            "completion marker embedded mid-output, not accepted".to_string()
        } else if committed {
            "increment committed, issue not yet resolved".to_string()
        } else {
            "no changes this increment, issue not yet resolved".to_string()
        };
        Ok(StageResult::new(StageEvent::ImplNotDone, reason).with_metrics(metrics))
    }
}
