//! The PR kernel: push the branch and create or reuse the pull request
//! from the finalize record.
//!
//! Failure splits into two disjoint classes. Check failures are fixable by
//! another implementation increment; divergent history is not, and routes
//! to the rebase stage instead.

use crate::host;
use crate::kernels::StageKernel;
use crate::vcs::{self, PushOutcome};
use async_trait::async_trait;
use eyre::{eyre, WrapErr};
use forge_core::artifacts::{self, PrReport};
use forge_core::finalize::FinalizeRecord;
use forge_core::types::{
    Stage, StageEvent, StageResult, WorkflowContext, PAYLOAD_CI_FEEDBACK,
};
use std::path::Path;
use tracing::info;

#[derive(Debug)]
pub struct PrKernel {
    remote: String,
    base_branch: String,
}

impl PrKernel {
    pub fn new(remote: String, base_branch: String) -> Self {
        Self {
            remote,
            base_branch,
        }
    }

    fn report(
        ctx: &WorkflowContext,
        event: StageEvent,
        message: &str,
        pr: Option<&host::PullRequest>,
    ) -> PrReport {
        PrReport {
            issue_id: ctx.issue_id.clone(),
            iteration: ctx.iteration,
            attempt: ctx.pr_attempts + 1,
            event: event.as_str().to_string(),
            message: message.to_string(),
            pr_number: pr.map(|p| p.number),
            pr_url: pr.map(|p| p.url.clone()),
        }
    }
}

#[async_trait]
impl StageKernel for PrKernel {
    fn stage(&self) -> Stage {
        Stage::Pr
    }

    async fn execute(&self, ctx: &WorkflowContext) -> eyre::Result<StageResult> {
        let worktree = Path::new(&ctx.worktree);
        let run_dir = artifacts::ensure_run_dir(worktree, &ctx.issue_id)?;

        // The finalize record is a precondition. Missing or malformed means
        // a broken invariant upstream, so no event is emitted.
        let record = FinalizeRecord::load(&run_dir)
            .wrap_err("finalize record required before PR submission")?;
        record.validate(&ctx.issue_id)?;

        let branch = vcs::current_branch(worktree)?;

        if let PushOutcome::NonFastForward(stderr) = vcs::push(worktree, &self.remote, &branch)? {
            let message = format!("push rejected, history diverged: {stderr}");
            let report = Self::report(ctx, StageEvent::PrFailNeedRebase, &message, None);
            let artifact =
                artifacts::write_report(&run_dir, ctx.iteration, Stage::Pr, "pr_report", &report)?;
            return Ok(
                StageResult::new(StageEvent::PrFailNeedRebase, message).with_artifact(artifact)
            );
        }

        if !host::is_available() {
            return Err(eyre!("gh CLI not available"));
        }

        let pr = match host::find_open_pr(worktree, &branch)? {
            Some(existing) => {
                info!(number = existing.number, "reusing open pull request");
                existing
            }
            None => {
                let body = host::ensure_closing_reference(&record.body, &ctx.issue_id);
                let url =
                    host::create_pr(worktree, &branch, &self.base_branch, &record.title, &body)?;
                info!(url = %url, "created pull request");
                // Re-query for the number; creation only reports the URL.
                host::find_open_pr(worktree, &branch)?
                    .unwrap_or(host::PullRequest { number: 0, url })
            }
        };

        let (event, message, payload_ci) = match host::pr_checks(worktree, pr.number)? {
            host::ChecksOutcome::Pass => (
                StageEvent::PrPass,
                "pull request open and checks green".to_string(),
                None,
            ),
            host::ChecksOutcome::Pending => (
                StageEvent::PrPass,
                "pull request open, checks still pending".to_string(),
                None,
            ),
            host::ChecksOutcome::Fail(summary) => (
                StageEvent::PrFailFixable,
                "pull request checks failed".to_string(),
                Some(summary),
            ),
        };

        let report = Self::report(ctx, event, &message, Some(&pr));
        let artifact =
            artifacts::write_report(&run_dir, ctx.iteration, Stage::Pr, "pr_report", &report)?;

        let mut result = StageResult::new(event, message).with_artifact(artifact);
        if let Some(summary) = payload_ci {
            result = result.with_payload(PAYLOAD_CI_FEEDBACK, summary);
        }
        Ok(result)
    }
}
