//! Stage kernels: one handler per non-terminal stage.
//!
//! A kernel executes its stage's logic and gate, then resolves to exactly
//! one canonical event. Contract violations (malformed titles, missing
//! finalize records, absent change summaries) propagate as errors instead
//! of being absorbed into the event taxonomy.

mod implement;
mod pr;
mod rebase;
mod review;

pub use implement::ImplementKernel;
pub use pr::PrKernel;
pub use rebase::RebaseKernel;
pub use review::ReviewKernel;

use async_trait::async_trait;
use forge_core::types::{Stage, StageResult, WorkflowContext};
use std::collections::HashMap;

/// Handler for one stage. Kernels never mutate the context; the loop owns
/// all merging.
#[async_trait]
pub trait StageKernel: Send + Sync {
    fn stage(&self) -> Stage;
    async fn execute(&self, ctx: &WorkflowContext) -> eyre::Result<StageResult>;
}

/// Explicit stage-to-handler registry. A stage with no entry is routed to
/// fatal by the loop, observable in the audit trail, rather than panicking.
#[derive(Default)]
pub struct KernelRegistry {
    handlers: HashMap<Stage, Box<dyn StageKernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kernel: Box<dyn StageKernel>) -> Self {
        self.handlers.insert(kernel.stage(), kernel);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<&dyn StageKernel> {
        self.handlers.get(&stage).map(Box::as_ref)
    }

    /// Stages with a registered handler, sorted.
    pub fn registered(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.handlers.keys().copied().collect();
        stages.sort();
        stages
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("stages", &self.registered())
            .finish()
    }
}
