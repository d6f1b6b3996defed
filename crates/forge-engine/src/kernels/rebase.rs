//! The rebase kernel: reconcile divergent history against the base branch.
//!
//! Conflicts are aborted in place, leaving the working tree exactly as it
//! was; automatic conflict resolution is out of scope and routes toward
//! fatal.

use crate::kernels::StageKernel;
use crate::vcs::{self, RebaseOutcome};
use async_trait::async_trait;
use forge_core::artifacts::{self, RebaseReport};
use forge_core::types::{Stage, StageEvent, StageResult, WorkflowContext};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug)]
pub struct RebaseKernel {
    remote: String,
    /// Base branch override; detected from the remote when unset.
    base_branch: Option<String>,
}

impl RebaseKernel {
    pub fn new(remote: String, base_branch: Option<String>) -> Self {
        Self {
            remote,
            base_branch,
        }
    }
}

#[async_trait]
impl StageKernel for RebaseKernel {
    fn stage(&self) -> Stage {
        Stage::Rebase
    }

    async fn execute(&self, ctx: &WorkflowContext) -> eyre::Result<StageResult> {
        let worktree = Path::new(&ctx.worktree);
        let run_dir = artifacts::ensure_run_dir(worktree, &ctx.issue_id)?;

        vcs::fetch(worktree, &self.remote)?;
        let base = match &self.base_branch {
            Some(base) => base.clone(),
            None => vcs::detect_base_branch(worktree, &self.remote)?,
        };
        let upstream = format!("{}/{base}", self.remote);
        let commands = vec![
            format!("git fetch {}", self.remote),
            format!("git rebase {upstream}"),
        ];

        let (event, message, conflict_summary) = match vcs::rebase_onto(worktree, &upstream)? {
            RebaseOutcome::Rebased => {
                info!(upstream = %upstream, "rebase succeeded");
                (
                    StageEvent::RebaseOk,
                    format!("rebased onto {upstream}"),
                    None,
                )
            }
            RebaseOutcome::Conflict(summary) => {
                warn!(upstream = %upstream, "rebase conflict, aborted");
                (
                    StageEvent::RebaseConflict,
                    format!("rebase onto {upstream} conflicted and was aborted"),
                    Some(summary),
                )
            }
        };

        let report = RebaseReport {
            issue_id: ctx.issue_id.clone(),
            iteration: ctx.iteration,
            attempt: ctx.rebase_attempts + 1,
            event: event.as_str().to_string(),
            message: message.clone(),
            commands,
            conflict_summary,
        };
        let artifact =
            artifacts::write_report(&run_dir, ctx.iteration, Stage::Rebase, "rebase_report", &report)?;

        Ok(StageResult::new(event, message).with_artifact(artifact))
    }
}
