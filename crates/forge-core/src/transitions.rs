//! The transition table: immutable routing from (stage, event) to the next
//! stage.
//!
//! The table is pure data. Budget-exceeded edges from the routing spec are
//! enforced by the orchestrator's convergence guards, which synthesize a
//! `Fatal` event; every stage therefore carries a defensive `fatal` edge.

use crate::types::{Stage, StageEvent};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("no transition for stage {stage} on event {event}")]
    Unrouted { stage: Stage, event: StageEvent },
    #[error("stage {stage} cannot emit event {event}")]
    InvalidEvent { stage: Stage, event: StageEvent },
    #[error("transition table is missing edges: {0:?}")]
    MissingEdges(Vec<(Stage, StageEvent)>),
}

pub type Result<T> = std::result::Result<T, TransitionError>;

/// Immutable mapping from (stage, event) to the next stage.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    edges: HashMap<(Stage, StageEvent), Stage>,
}

impl TransitionTable {
    /// Build the canonical routing table.
    pub fn canonical() -> Self {
        let mut edges = HashMap::new();

        edges.insert((Stage::Impl, StageEvent::ImplNotDone), Stage::Impl);
        edges.insert((Stage::Impl, StageEvent::ParseFail), Stage::Impl);
        edges.insert((Stage::Impl, StageEvent::ImplDone), Stage::Review);

        edges.insert((Stage::Review, StageEvent::ReviewPassed), Stage::Pr);
        edges.insert((Stage::Review, StageEvent::ReviewFailed), Stage::Impl);

        edges.insert((Stage::Pr, StageEvent::PrPass), Stage::Finish);
        edges.insert((Stage::Pr, StageEvent::PrFailFixable), Stage::Impl);
        edges.insert((Stage::Pr, StageEvent::PrFailNeedRebase), Stage::Rebase);

        edges.insert((Stage::Rebase, StageEvent::RebaseOk), Stage::Impl);
        edges.insert((Stage::Rebase, StageEvent::RebaseConflict), Stage::Fatal);

        // Defensive fatal edge on every stage, terminal stages included.
        for stage in Stage::all() {
            edges.insert((*stage, StageEvent::Fatal), Stage::Fatal);
        }

        Self { edges }
    }

    /// Resolve the next stage for (stage, event).
    ///
    /// Fails with `InvalidEvent` when the stage has not declared the event,
    /// and `Unrouted` when the declared event has no edge (a wiring bug
    /// that `validate` should have caught at startup).
    pub fn next_stage(&self, stage: Stage, event: StageEvent) -> Result<Stage> {
        if event != StageEvent::Fatal && !stage.emitted_events().contains(&event) {
            return Err(TransitionError::InvalidEvent { stage, event });
        }
        self.edges
            .get(&(stage, event))
            .copied()
            .ok_or(TransitionError::Unrouted { stage, event })
    }

    /// Startup validation: every non-terminal stage must have an edge for
    /// every event it can emit, plus the defensive fatal edge; terminal
    /// stages accept only the fatal edge.
    ///
    /// Returns the sorted list of missing edges on failure, so repeated
    /// runs report identically.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        for stage in Stage::all() {
            for event in stage.emitted_events() {
                if !self.edges.contains_key(&(*stage, *event)) {
                    missing.push((*stage, *event));
                }
            }
            if !self.edges.contains_key(&(*stage, StageEvent::Fatal)) {
                missing.push((*stage, StageEvent::Fatal));
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            missing.sort();
            Err(TransitionError::MissingEdges(missing))
        }
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::canonical()
    }
}
