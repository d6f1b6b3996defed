//! End-to-end loop behavior with scripted kernels: routing, convergence
//! guards, checkpointing, and resumption.

use async_trait::async_trait;
use forge_core::checkpoint::CheckpointStore;
use forge_core::types::{Stage, StageEvent, StageResult, WorkflowContext};
use forge_engine::orchestrator::{ConvergenceGuards, Orchestrator};
use forge_engine::{KernelRegistry, StageKernel};
use std::collections::VecDeque;
use std::sync::Mutex;
use tempfile::TempDir;

/// Kernel that replays a script of events, then repeats the last one.
struct ScriptKernel {
    stage: Stage,
    script: Mutex<VecDeque<StageEvent>>,
    fallback: StageEvent,
}

impl ScriptKernel {
    fn new(stage: Stage, script: Vec<StageEvent>, fallback: StageEvent) -> Box<Self> {
        Box::new(Self {
            stage,
            script: Mutex::new(script.into()),
            fallback,
        })
    }

    fn repeating(stage: Stage, event: StageEvent) -> Box<Self> {
        Self::new(stage, Vec::new(), event)
    }
}

#[async_trait]
impl StageKernel for ScriptKernel {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, _ctx: &WorkflowContext) -> eyre::Result<StageResult> {
        let event = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        Ok(StageResult::new(event, format!("scripted {event}")))
    }
}

fn outcomes(ctx: &WorkflowContext) -> Vec<&str> {
    ctx.history.iter().map(|h| h.outcome.as_str()).collect()
}

fn setup(worktree: &TempDir) -> (WorkflowContext, CheckpointStore) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let ctx = WorkflowContext::new("42", worktree.path().to_string_lossy());
    let store = CheckpointStore::new(worktree.path().join("checkpoint.json"));
    (ctx, store)
}

#[tokio::test]
async fn happy_path_runs_to_finish() {
    let worktree = TempDir::new().unwrap();
    let (ctx, store) = setup(&worktree);

    let registry = KernelRegistry::new()
        .register(ScriptKernel::repeating(Stage::Impl, StageEvent::ImplDone))
        .register(ScriptKernel::repeating(
            Stage::Review,
            StageEvent::ReviewPassed,
        ))
        .register(ScriptKernel::repeating(Stage::Pr, StageEvent::PrPass));

    let orch = Orchestrator::new(registry, store.clone(), ConvergenceGuards::default());
    let final_ctx = orch.run(ctx, 100).await.unwrap();

    assert_eq!(final_ctx.stage, Stage::Finish);
    assert_eq!(final_ctx.iteration, 1);
    assert_eq!(
        outcomes(&final_ctx),
        vec!["impl_done", "review_passed", "pr_pass"]
    );

    // The terminal state is checkpointed and loadable.
    let restored = store.load().unwrap();
    assert_eq!(restored, final_ctx);
}

#[tokio::test]
async fn never_done_kernel_goes_fatal_at_exactly_the_iteration_budget() {
    let worktree = TempDir::new().unwrap();
    let (ctx, store) = setup(&worktree);

    let registry = KernelRegistry::new().register(ScriptKernel::repeating(
        Stage::Impl,
        StageEvent::ImplNotDone,
    ));
    let guards = ConvergenceGuards {
        max_iterations: 5,
        ..ConvergenceGuards::default()
    };

    let orch = Orchestrator::new(registry, store, guards);
    let final_ctx = orch.run(ctx, 100).await.unwrap();

    assert_eq!(final_ctx.stage, Stage::Fatal);
    assert_eq!(final_ctx.iteration, 5);

    let history = outcomes(&final_ctx);
    let attempts = history.iter().filter(|o| **o == "impl_not_done").count();
    assert_eq!(attempts, 5, "exactly the budget, never beyond");
    assert_eq!(*history.last().unwrap(), "fatal");

    // The terminal diagnostic was written with the full history.
    let fatal_artifact = final_ctx
        .artifacts
        .iter()
        .find(|a| a.kind == "fatal_report")
        .unwrap();
    assert!(std::path::Path::new(&fatal_artifact.path).exists());
}

#[tokio::test]
async fn non_fast_forward_routes_through_rebase_not_impl() {
    let worktree = TempDir::new().unwrap();
    let (ctx, store) = setup(&worktree);

    let registry = KernelRegistry::new()
        .register(ScriptKernel::repeating(Stage::Impl, StageEvent::ImplDone))
        .register(ScriptKernel::repeating(
            Stage::Review,
            StageEvent::ReviewPassed,
        ))
        .register(ScriptKernel::repeating(
            Stage::Pr,
            StageEvent::PrFailNeedRebase,
        ))
        .register(ScriptKernel::repeating(
            Stage::Rebase,
            StageEvent::RebaseConflict,
        ));

    let orch = Orchestrator::new(registry, store, ConvergenceGuards::default());
    let final_ctx = orch.run(ctx, 100).await.unwrap();

    assert_eq!(final_ctx.stage, Stage::Fatal);
    let history = outcomes(&final_ctx);
    let rebase_fail = history
        .iter()
        .position(|o| *o == "pr_fail_need_rebase")
        .unwrap();
    // The step after the diverged push is the rebase stage, not another
    // implementation increment.
    assert_eq!(history[rebase_fail + 1], "rebase_conflict");
}

#[tokio::test]
async fn successful_final_rebase_still_reaches_finish() {
    let worktree = TempDir::new().unwrap();
    let (ctx, store) = setup(&worktree);

    // Three divergence rounds, each rebase succeeding, then a clean push.
    let registry = KernelRegistry::new()
        .register(ScriptKernel::repeating(Stage::Impl, StageEvent::ImplDone))
        .register(ScriptKernel::repeating(
            Stage::Review,
            StageEvent::ReviewPassed,
        ))
        .register(ScriptKernel::new(
            Stage::Pr,
            vec![
                StageEvent::PrFailNeedRebase,
                StageEvent::PrFailNeedRebase,
                StageEvent::PrFailNeedRebase,
            ],
            StageEvent::PrPass,
        ))
        .register(ScriptKernel::repeating(Stage::Rebase, StageEvent::RebaseOk));

    let orch = Orchestrator::new(registry, store, ConvergenceGuards::default());
    let final_ctx = orch.run(ctx, 100).await.unwrap();

    // The third rebase exhausts the budget but completed, so the run
    // continues and converges.
    assert_eq!(final_ctx.stage, Stage::Finish);
    assert_eq!(final_ctx.rebase_attempts, 3);
    assert_eq!(*outcomes(&final_ctx).last().unwrap(), "pr_pass");
}

#[tokio::test]
async fn fourth_divergence_goes_fatal_before_another_rebase() {
    let worktree = TempDir::new().unwrap();
    let (ctx, store) = setup(&worktree);

    let registry = KernelRegistry::new()
        .register(ScriptKernel::repeating(Stage::Impl, StageEvent::ImplDone))
        .register(ScriptKernel::repeating(
            Stage::Review,
            StageEvent::ReviewPassed,
        ))
        .register(ScriptKernel::repeating(
            Stage::Pr,
            StageEvent::PrFailNeedRebase,
        ))
        .register(ScriptKernel::repeating(Stage::Rebase, StageEvent::RebaseOk));

    let orch = Orchestrator::new(registry, store, ConvergenceGuards::default());
    let final_ctx = orch.run(ctx, 100).await.unwrap();

    assert_eq!(final_ctx.stage, Stage::Fatal);
    assert!(final_ctx.last_feedback.as_ref().unwrap().contains("rebase attempts"));
    // The budget blocks the fourth rebase from starting.
    let history = outcomes(&final_ctx);
    assert_eq!(history.iter().filter(|o| **o == "rebase_ok").count(), 3);
}

#[tokio::test]
async fn missing_handler_synthesizes_fatal_in_the_audit_trail() {
    let worktree = TempDir::new().unwrap();
    let (ctx, store) = setup(&worktree);

    // Review has no handler.
    let registry =
        KernelRegistry::new().register(ScriptKernel::repeating(Stage::Impl, StageEvent::ImplDone));

    let orch = Orchestrator::new(registry, store, ConvergenceGuards::default());
    let final_ctx = orch.run(ctx, 100).await.unwrap();

    assert_eq!(final_ctx.stage, Stage::Fatal);
    assert_eq!(outcomes(&final_ctx), vec!["impl_done", "fatal"]);
    assert!(final_ctx
        .last_feedback
        .unwrap()
        .contains("no handler registered for stage review"));
}

#[tokio::test]
async fn step_budget_exhaustion_is_fatal_not_a_stall() {
    let worktree = TempDir::new().unwrap();
    let (ctx, store) = setup(&worktree);

    let registry = KernelRegistry::new().register(ScriptKernel::repeating(
        Stage::Impl,
        StageEvent::ImplNotDone,
    ));

    let orch = Orchestrator::new(registry, store, ConvergenceGuards::default());
    let final_ctx = orch.run(ctx, 3).await.unwrap();

    assert_eq!(final_ctx.stage, Stage::Fatal);
    let history = outcomes(&final_ctx);
    assert_eq!(
        history.iter().filter(|o| **o == "impl_not_done").count(),
        3
    );
    assert!(final_ctx.last_feedback.unwrap().contains("step budget"));
}

#[tokio::test]
async fn resumed_run_continues_at_the_persisted_stage() {
    let worktree = TempDir::new().unwrap();
    let (mut ctx, store) = setup(&worktree);

    // Simulate an earlier run that was terminated after review passed.
    ctx.stage = Stage::Pr;
    ctx.iteration = 2;
    ctx.merge(&StageResult::new(StageEvent::ImplDone, "done"));
    store.save(&ctx).unwrap();

    let registry =
        KernelRegistry::new().register(ScriptKernel::repeating(Stage::Pr, StageEvent::PrPass));
    let orch = Orchestrator::new(registry, store, ConvergenceGuards::default());

    let resumed = orch.resume().unwrap();
    assert_eq!(resumed.stage, Stage::Pr);
    assert_eq!(resumed.iteration, 2);

    let final_ctx = orch.run(resumed, 100).await.unwrap();
    assert_eq!(final_ctx.stage, Stage::Finish);
    // No implementation stage re-ran; the PR stage picked up directly.
    assert_eq!(*outcomes(&final_ctx).last().unwrap(), "pr_pass");
    assert_eq!(final_ctx.iteration, 2);
}

#[tokio::test]
async fn pre_step_hook_sees_every_dispatch() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let worktree = TempDir::new().unwrap();
    let (ctx, store) = setup(&worktree);

    let registry = KernelRegistry::new()
        .register(ScriptKernel::repeating(Stage::Impl, StageEvent::ImplDone))
        .register(ScriptKernel::repeating(
            Stage::Review,
            StageEvent::ReviewPassed,
        ))
        .register(ScriptKernel::repeating(Stage::Pr, StageEvent::PrPass));

    let count = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&count);
    let orch = Orchestrator::new(registry, store, ConvergenceGuards::default()).with_pre_step(
        Box::new(move |_ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    orch.run(ctx, 100).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 3);
}
