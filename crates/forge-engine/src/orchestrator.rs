//! The orchestrator loop: dispatch, merge, route, checkpoint, advance.
//!
//! The loop owns the context exclusively. Kernels return results; only the
//! loop mutates state, persists checkpoints, and enforces the convergence
//! guards. Exhausted guards synthesize a `fatal` event rather than living
//! in the transition table, so the table stays pure routing data.

use crate::kernels::KernelRegistry;
use eyre::WrapErr;
use forge_core::artifacts::{self, FatalReport};
use forge_core::checkpoint::CheckpointStore;
use forge_core::transitions::TransitionTable;
use forge_core::types::{Stage, StageEvent, StageResult, WorkflowContext};
use forge_core::WorkflowConfig;
use std::path::Path;
use tracing::{error, info};

/// Hard ceilings on every retryable path. Termination is guaranteed by
/// these counters, not timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceGuards {
    pub max_iterations: u32,
    pub max_parse_failures: u32,
    pub max_review_stalls: u32,
    pub max_pr_attempts: u32,
    pub max_rebase_attempts: u32,
}

impl From<&WorkflowConfig> for ConvergenceGuards {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_parse_failures: config.max_parse_failures,
            max_review_stalls: config.max_review_stalls,
            max_pr_attempts: config.max_pr_attempts,
            max_rebase_attempts: config.max_rebase_attempts,
        }
    }
}

impl Default for ConvergenceGuards {
    fn default() -> Self {
        Self::from(&WorkflowConfig::default())
    }
}

type PreStepHook = Box<dyn Fn(&WorkflowContext) + Send + Sync>;

/// Drives one workflow instance through the stage machine.
pub struct Orchestrator {
    table: TransitionTable,
    registry: KernelRegistry,
    store: CheckpointStore,
    guards: ConvergenceGuards,
    pre_step: Option<PreStepHook>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("guards", &self.guards)
            .field("checkpoint", &self.store.path())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(registry: KernelRegistry, store: CheckpointStore, guards: ConvergenceGuards) -> Self {
        Self {
            table: TransitionTable::canonical(),
            registry,
            store,
            guards,
            pre_step: None,
        }
    }

    /// Install a hook run before each dispatch, after the checkpoint for
    /// the coming stage is persisted.
    pub fn with_pre_step(mut self, hook: PreStepHook) -> Self {
        self.pre_step = Some(hook);
        self
    }

    /// Load the context persisted by a previous run of this instance.
    pub fn resume(&self) -> eyre::Result<WorkflowContext> {
        self.store
            .load()
            .wrap_err("failed to load checkpoint for resumption")
    }

    /// Run the loop until a terminal stage or until `step_budget` steps
    /// have executed. Budget exhaustion is fatal, never a silent stall.
    ///
    /// Hard errors from kernels propagate immediately; the last persisted
    /// checkpoint then allows a resumed run at stage granularity.
    pub async fn run(
        &self,
        mut ctx: WorkflowContext,
        step_budget: u32,
    ) -> eyre::Result<WorkflowContext> {
        self.table
            .validate()
            .wrap_err("transition table failed startup validation")?;

        let mut steps = 0u32;
        while !ctx.stage.is_terminal() {
            if steps >= step_budget {
                self.go_fatal(&mut ctx, format!("step budget of {step_budget} exhausted"))?;
                break;
            }
            steps += 1;

            if ctx.stage == Stage::Impl {
                if ctx.iteration >= self.guards.max_iterations {
                    self.go_fatal(
                        &mut ctx,
                        format!("iteration budget of {} exhausted", self.guards.max_iterations),
                    )?;
                    break;
                }
                ctx.iteration += 1;
            }

            self.store.save(&ctx)?;
            if let Some(hook) = &self.pre_step {
                hook(&ctx);
            }

            let Some(kernel) = self.registry.get(ctx.stage) else {
                let reason = format!("no handler registered for stage {}", ctx.stage);
                self.go_fatal(&mut ctx, reason)?;
                break;
            };

            let result = kernel.execute(&ctx).await?;
            ctx.merge(&result);

            let next = self.table.next_stage(ctx.stage, result.event)?;
            info!(
                stage = %ctx.stage,
                event = %result.event,
                iteration = ctx.iteration,
                reason = %result.reason,
                "stage complete"
            );

            if let Some(reason) = self.guard_trip(&ctx, result.event) {
                self.go_fatal(&mut ctx, reason)?;
                break;
            }

            if next == Stage::Fatal {
                self.write_fatal_report(&mut ctx, &result.reason)?;
            }
            ctx.stage = next;
            self.store.save(&ctx)?;
        }

        self.store.save(&ctx)?;
        Ok(ctx)
    }

    /// Check every convergence guard against the just-merged counters.
    fn guard_trip(&self, ctx: &WorkflowContext, event: StageEvent) -> Option<String> {
        match event {
            StageEvent::ParseFail
                if ctx.consecutive_parse_failures >= self.guards.max_parse_failures =>
            {
                Some(format!(
                    "{} consecutive parse failures",
                    ctx.consecutive_parse_failures
                ))
            }
            StageEvent::ReviewFailed if ctx.review_stalls >= self.guards.max_review_stalls => {
                Some(format!(
                    "{} consecutive non-improving reviews",
                    ctx.review_stalls
                ))
            }
            StageEvent::PrFailFixable | StageEvent::PrFailNeedRebase
                if ctx.pr_attempts >= self.guards.max_pr_attempts =>
            {
                Some(format!("{} PR attempts exhausted", ctx.pr_attempts))
            }
            // A completed rebase routes back to impl; the ceiling binds when
            // yet another rebase would start.
            StageEvent::PrFailNeedRebase
                if ctx.rebase_attempts >= self.guards.max_rebase_attempts =>
            {
                Some(format!(
                    "{} rebase attempts exhausted",
                    ctx.rebase_attempts
                ))
            }
            _ => None,
        }
    }

    /// Synthesize a fatal transition: record it in the audit trail, write
    /// the terminal diagnostic, move to `fatal`, and checkpoint.
    fn go_fatal(&self, ctx: &mut WorkflowContext, reason: String) -> eyre::Result<()> {
        error!(
            stage = %ctx.stage,
            event = %StageEvent::Fatal,
            iteration = ctx.iteration,
            reason = %reason,
            "fatal transition"
        );
        ctx.merge(&StageResult::new(StageEvent::Fatal, reason.clone()));
        self.write_fatal_report(ctx, &reason)?;
        ctx.stage = Stage::Fatal;
        self.store.save(ctx)?;
        Ok(())
    }

    /// Terminal diagnostic with the full history, for manual resumption.
    fn write_fatal_report(&self, ctx: &mut WorkflowContext, reason: &str) -> eyre::Result<()> {
        let worktree = Path::new(&ctx.worktree);
        let run_dir = artifacts::ensure_run_dir(worktree, &ctx.issue_id)?;
        let report = FatalReport {
            issue_id: ctx.issue_id.clone(),
            iteration: ctx.iteration,
            stage: ctx.stage,
            reason: reason.to_string(),
            history: ctx.history.clone(),
        };
        let artifact =
            artifacts::write_report(&run_dir, ctx.iteration, Stage::Fatal, "fatal_report", &report)?;
        ctx.artifacts.push(artifact);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guards() -> ConvergenceGuards {
        ConvergenceGuards::default()
    }

    fn ctx_with(f: impl FnOnce(&mut WorkflowContext)) -> WorkflowContext {
        let mut ctx = WorkflowContext::new("42", "/tmp/wt");
        f(&mut ctx);
        ctx
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            KernelRegistry::new(),
            CheckpointStore::new("/tmp/unused-checkpoint.json"),
            guards(),
        )
    }

    #[test]
    fn guard_trips_on_parse_failure_ceiling() {
        let orch = orchestrator();
        let ctx = ctx_with(|c| c.consecutive_parse_failures = 5);
        assert!(orch.guard_trip(&ctx, StageEvent::ParseFail).is_some());

        let ctx = ctx_with(|c| c.consecutive_parse_failures = 4);
        assert!(orch.guard_trip(&ctx, StageEvent::ParseFail).is_none());
    }

    #[test]
    fn guard_trips_on_review_stall_ceiling() {
        let orch = orchestrator();
        let ctx = ctx_with(|c| c.review_stalls = 4);
        assert!(orch.guard_trip(&ctx, StageEvent::ReviewFailed).is_some());
        // Passing reviews never trip the stall guard.
        assert!(orch.guard_trip(&ctx, StageEvent::ReviewPassed).is_none());
    }

    #[test]
    fn guard_trips_on_pr_and_rebase_ceilings() {
        let orch = orchestrator();

        let ctx = ctx_with(|c| c.pr_attempts = 6);
        assert!(orch.guard_trip(&ctx, StageEvent::PrFailFixable).is_some());
        assert!(orch.guard_trip(&ctx, StageEvent::PrFailNeedRebase).is_some());
        assert!(orch.guard_trip(&ctx, StageEvent::PrPass).is_none());

        // The ceiling blocks a fourth rebase from starting; a completed
        // rebase is never retroactively fatal.
        let ctx = ctx_with(|c| c.rebase_attempts = 3);
        assert!(orch.guard_trip(&ctx, StageEvent::PrFailNeedRebase).is_some());
        assert!(orch.guard_trip(&ctx, StageEvent::RebaseOk).is_none());

        let ctx = ctx_with(|c| c.rebase_attempts = 2);
        assert!(orch.guard_trip(&ctx, StageEvent::PrFailNeedRebase).is_none());
    }

    #[test]
    fn guards_derive_from_config() {
        let config = WorkflowConfig {
            max_iterations: 7,
            max_pr_attempts: 2,
            ..Default::default()
        };
        let guards = ConvergenceGuards::from(&config);
        assert_eq!(guards.max_iterations, 7);
        assert_eq!(guards.max_pr_attempts, 2);
        assert_eq!(guards.max_rebase_attempts, 3);
    }
}
