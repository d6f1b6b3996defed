//! Core types for the workflow orchestrator.
//!
//! The stage and event vocabularies are closed sets: every kernel emits
//! exactly one event per invocation, and the router only accepts events a
//! stage has declared it can emit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for workflow instances and artifacts.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Stage and event vocabularies ---

/// Workflow stage. `Finish` and `Fatal` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Impl,
    Review,
    Pr,
    Rebase,
    Finish,
    Fatal,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Impl => "impl",
            Self::Review => "review",
            Self::Pr => "pr",
            Self::Rebase => "rebase",
            Self::Finish => "finish",
            Self::Fatal => "fatal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish | Self::Fatal)
    }

    /// The closed set of events a kernel for this stage may emit.
    ///
    /// Drives startup validation of the transition table: every listed
    /// event must have an outgoing edge. Terminal stages emit nothing.
    pub fn emitted_events(&self) -> &'static [StageEvent] {
        match self {
            Self::Impl => &[
                StageEvent::ImplDone,
                StageEvent::ImplNotDone,
                StageEvent::ParseFail,
            ],
            Self::Review => &[StageEvent::ReviewPassed, StageEvent::ReviewFailed],
            Self::Pr => &[
                StageEvent::PrPass,
                StageEvent::PrFailFixable,
                StageEvent::PrFailNeedRebase,
            ],
            Self::Rebase => &[StageEvent::RebaseOk, StageEvent::RebaseConflict],
            Self::Finish | Self::Fatal => &[],
        }
    }

    /// All stages, non-terminal first.
    pub fn all() -> &'static [Stage] {
        &[
            Self::Impl,
            Self::Review,
            Self::Pr,
            Self::Rebase,
            Self::Finish,
            Self::Fatal,
        ]
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing event emitted by exactly one kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEvent {
    ImplDone,
    ImplNotDone,
    ParseFail,
    ReviewPassed,
    ReviewFailed,
    PrPass,
    PrFailFixable,
    PrFailNeedRebase,
    RebaseOk,
    RebaseConflict,
    Fatal,
}

impl StageEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImplDone => "impl_done",
            Self::ImplNotDone => "impl_not_done",
            Self::ParseFail => "parse_fail",
            Self::ReviewPassed => "review_passed",
            Self::ReviewFailed => "review_failed",
            Self::PrPass => "pr_pass",
            Self::PrFailFixable => "pr_fail_fixable",
            Self::PrFailNeedRebase => "pr_fail_need_rebase",
            Self::RebaseOk => "rebase_ok",
            Self::RebaseConflict => "rebase_conflict",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for StageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Context and results ---

/// Payload keys the loop mirrors onto dedicated context fields on merge.
pub const PAYLOAD_REVIEW_FEEDBACK: &str = "review_feedback";
pub const PAYLOAD_PARSE_FEEDBACK: &str = "parse_feedback";
pub const PAYLOAD_CI_FEEDBACK: &str = "ci_feedback";
/// Payload key carrying the overall review score, used for stall tracking.
pub const PAYLOAD_REVIEW_SCORE: &str = "review_score";

/// Reference to a structured diagnostic artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: Id,
    /// Kind of artifact (e.g., `parse_report`, `review_report`).
    pub kind: String,
    /// Absolute path to the artifact file.
    pub path: String,
    /// SHA-256 checksum of the file contents.
    pub checksum: String,
}

/// One row in the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub stage: Stage,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    /// The event the stage resolved to, as its wire name.
    pub outcome: String,
    /// Overall review score at the time, if any.
    pub score: Option<u32>,
}

/// The mutable record threaded through every stage of one workflow
/// instance. Owned exclusively by the orchestrator loop and mutated only
/// via kernel-result merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    // Identity
    pub issue_id: String,
    /// Absolute path to the working tree this instance owns.
    pub worktree: String,
    /// Path to the upstream plan document, if one exists.
    pub plan_path: Option<String>,

    // Progression
    pub stage: Stage,
    /// Implementation iteration counter (1-indexed once the loop starts).
    pub iteration: u32,
    /// Review attempts within the current iteration.
    pub review_attempts: u32,
    /// PR submission attempts across the whole run.
    pub pr_attempts: u32,
    /// Rebase attempts across the whole run.
    pub rebase_attempts: u32,
    /// Consecutive parse-gate failures; resets when the gate passes.
    pub consecutive_parse_failures: u32,
    /// Consecutive failed reviews whose score did not improve.
    pub review_stalls: u32,

    // Feedback carried into the next backend request
    pub last_feedback: Option<String>,
    pub last_score: Option<u32>,
    pub review_feedback: Option<String>,
    pub parse_feedback: Option<String>,
    pub ci_feedback: Option<String>,

    /// Stage-specific key-value data, read by convention.
    pub payload: BTreeMap<String, String>,
    /// Append-only references to diagnostic artifacts.
    pub artifacts: Vec<ArtifactRef>,
    /// Append-only audit trail.
    pub history: Vec<HistoryEntry>,
}

impl WorkflowContext {
    /// Create a fresh context at the implementation stage.
    pub fn new(issue_id: impl Into<String>, worktree: impl Into<String>) -> Self {
        Self {
            issue_id: issue_id.into(),
            worktree: worktree.into(),
            plan_path: None,
            stage: Stage::Impl,
            iteration: 0,
            review_attempts: 0,
            pr_attempts: 0,
            rebase_attempts: 0,
            consecutive_parse_failures: 0,
            review_stalls: 0,
            last_feedback: None,
            last_score: None,
            review_feedback: None,
            parse_feedback: None,
            ci_feedback: None,
            payload: BTreeMap::new(),
            artifacts: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn with_plan(mut self, plan_path: impl Into<String>) -> Self {
        self.plan_path = Some(plan_path.into());
        self
    }

    /// Merge a kernel result into the context.
    ///
    /// Payload keys are merged into the map; the feedback keys additionally
    /// mirror onto their dedicated fields. Artifacts append. Attempt counters
    /// update according to the current stage and the emitted event. A history
    /// row is recorded with the event as outcome.
    pub fn merge(&mut self, result: &StageResult) {
        for (key, value) in &result.payload {
            match key.as_str() {
                PAYLOAD_REVIEW_FEEDBACK => self.review_feedback = Some(value.clone()),
                PAYLOAD_PARSE_FEEDBACK => self.parse_feedback = Some(value.clone()),
                PAYLOAD_CI_FEEDBACK => self.ci_feedback = Some(value.clone()),
                _ => {}
            }
            self.payload.insert(key.clone(), value.clone());
        }

        self.artifacts.extend(result.artifacts.iter().cloned());

        match self.stage {
            Stage::Review => self.review_attempts += 1,
            Stage::Pr => self.pr_attempts += 1,
            Stage::Rebase => self.rebase_attempts += 1,
            _ => {}
        }

        match result.event {
            StageEvent::ParseFail => {
                self.consecutive_parse_failures += 1;
            }
            StageEvent::ImplDone => {
                self.consecutive_parse_failures = 0;
                // A fresh increment gets a fresh review budget.
                self.review_attempts = 0;
            }
            StageEvent::ImplNotDone => {
                self.consecutive_parse_failures = 0;
            }
            StageEvent::ReviewPassed => {
                self.review_stalls = 0;
                if let Some(score) = parse_score(&result.payload) {
                    self.last_score = Some(score);
                }
            }
            StageEvent::ReviewFailed => {
                // A failed review stalls unless the score improved. An
                // unscored failure (unparseable output) always stalls.
                match parse_score(&result.payload) {
                    Some(score) => {
                        if self.last_score.is_some_and(|prev| score <= prev) {
                            self.review_stalls += 1;
                        } else {
                            self.review_stalls = 0;
                        }
                        self.last_score = Some(score);
                    }
                    None => self.review_stalls += 1,
                }
            }
            _ => {}
        }

        self.last_feedback = Some(result.reason.clone());

        self.history.push(HistoryEntry {
            stage: self.stage,
            iteration: self.iteration,
            timestamp: Utc::now(),
            outcome: result.event.as_str().to_string(),
            score: self.last_score,
        });
    }
}

fn parse_score(payload: &BTreeMap<String, String>) -> Option<u32> {
    payload.get(PAYLOAD_REVIEW_SCORE)?.parse().ok()
}

/// Optional per-attempt metrics attached to a kernel result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub duration_ms: u64,
    /// Bytes of backend output consumed, if the stage called the backend.
    pub output_bytes: Option<u64>,
}

/// Output of one kernel invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Exactly one canonical event for the stage.
    pub event: StageEvent,
    /// Short human-readable reason, logged and recorded in history.
    pub reason: String,
    /// Key-value data merged into the context payload.
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    /// New artifact references, appended to the context.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StageMetrics>,
}

impl StageResult {
    pub fn new(event: StageEvent, reason: impl Into<String>) -> Self {
        Self {
            event,
            reason: reason.into(),
            payload: BTreeMap::new(),
            artifacts: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn stage_serializes_correctly() {
        assert_eq!(serde_json::to_string(&Stage::Impl).unwrap(), "\"impl\"");
        assert_eq!(serde_json::to_string(&Stage::Pr).unwrap(), "\"pr\"");
        assert_eq!(serde_json::to_string(&Stage::Fatal).unwrap(), "\"fatal\"");
    }

    #[test]
    fn event_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&StageEvent::PrFailNeedRebase).unwrap(),
            "\"pr_fail_need_rebase\""
        );
        assert_eq!(
            serde_json::to_string(&StageEvent::ImplNotDone).unwrap(),
            "\"impl_not_done\""
        );
    }

    #[test]
    fn terminal_stages_emit_nothing() {
        assert!(Stage::Finish.emitted_events().is_empty());
        assert!(Stage::Fatal.emitted_events().is_empty());
        assert!(Stage::Finish.is_terminal());
        assert!(Stage::Fatal.is_terminal());
        assert!(!Stage::Impl.is_terminal());
    }

    #[test]
    fn merge_mirrors_feedback_keys() {
        let mut ctx = WorkflowContext::new("issue-7", "/tmp/wt");
        let result = StageResult::new(StageEvent::ReviewFailed, "below threshold")
            .with_payload(PAYLOAD_REVIEW_FEEDBACK, "tighten corner cases")
            .with_payload("raw_output", "iter-01-review.log");
        ctx.merge(&result);

        assert_eq!(ctx.review_feedback.as_deref(), Some("tighten corner cases"));
        assert_eq!(
            ctx.payload.get("raw_output").map(String::as_str),
            Some("iter-01-review.log")
        );
        assert_eq!(ctx.history.len(), 1);
        assert_eq!(ctx.history[0].outcome, "review_failed");
    }

    #[test]
    fn merge_tracks_parse_failure_streak() {
        let mut ctx = WorkflowContext::new("issue-7", "/tmp/wt");
        ctx.merge(&StageResult::new(StageEvent::ParseFail, "syntax error"));
        ctx.merge(&StageResult::new(StageEvent::ParseFail, "syntax error"));
        assert_eq!(ctx.consecutive_parse_failures, 2);

        ctx.merge(&StageResult::new(StageEvent::ImplNotDone, "more to do"));
        assert_eq!(ctx.consecutive_parse_failures, 0);
    }

    #[test]
    fn merge_resets_review_attempts_on_impl_done() {
        let mut ctx = WorkflowContext::new("issue-7", "/tmp/wt");
        ctx.review_attempts = 2;
        ctx.merge(&StageResult::new(StageEvent::ImplDone, "marker present"));
        assert_eq!(ctx.review_attempts, 0);
    }

    #[test]
    fn merge_counts_attempts_by_stage() {
        let mut ctx = WorkflowContext::new("issue-7", "/tmp/wt");

        ctx.stage = Stage::Pr;
        ctx.merge(&StageResult::new(StageEvent::PrFailFixable, "checks red"));
        ctx.merge(&StageResult::new(StageEvent::PrFailNeedRebase, "diverged"));
        assert_eq!(ctx.pr_attempts, 2);

        ctx.stage = Stage::Rebase;
        ctx.merge(&StageResult::new(StageEvent::RebaseOk, "rebased"));
        assert_eq!(ctx.rebase_attempts, 1);
        assert_eq!(ctx.pr_attempts, 2);
    }

    #[test]
    fn merge_tracks_review_stalls_by_score() {
        let mut ctx = WorkflowContext::new("issue-7", "/tmp/wt");
        ctx.stage = Stage::Review;

        let failed = |score: u32| {
            StageResult::new(StageEvent::ReviewFailed, "below bar")
                .with_payload(PAYLOAD_REVIEW_SCORE, score.to_string())
        };

        ctx.merge(&failed(70));
        assert_eq!(ctx.review_stalls, 0);
        assert_eq!(ctx.last_score, Some(70));

        // Same score: a stall.
        ctx.merge(&failed(70));
        assert_eq!(ctx.review_stalls, 1);

        // Improvement resets the streak.
        ctx.merge(&failed(80));
        assert_eq!(ctx.review_stalls, 0);

        // Regression stalls again; an unscored failure also stalls.
        ctx.merge(&failed(75));
        ctx.merge(&StageResult::new(StageEvent::ReviewFailed, "unparseable"));
        assert_eq!(ctx.review_stalls, 2);

        ctx.merge(
            &StageResult::new(StageEvent::ReviewPassed, "all bars met")
                .with_payload(PAYLOAD_REVIEW_SCORE, "92"),
        );
        assert_eq!(ctx.review_stalls, 0);
        assert_eq!(ctx.last_score, Some(92));
    }
}
