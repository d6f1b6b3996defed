//! Checkpoint persistence for workflow contexts.
//!
//! A checkpoint is a versioned, timestamped snapshot of the full context,
//! written atomically (temp file + rename) around each loop step so a
//! terminated process can resume at stage granularity. Loading a mismatched
//! version is a hard error, never a silent migration.

use crate::types::WorkflowContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current checkpoint format version. Bump on any incompatible change to
/// `WorkflowContext` serialization.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("checkpoint version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Versioned on-disk snapshot of one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub context: WorkflowContext,
}

impl Checkpoint {
    pub fn of(context: &WorkflowContext) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            context: context.clone(),
        }
    }
}

/// File-backed checkpoint store. One store per workflow instance; two
/// instances sharing a path is unsupported.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically persist a snapshot of the context.
    ///
    /// Writes to a temp file in the same directory and renames over the
    /// target, so a crash mid-write never leaves a torn checkpoint.
    pub fn save(&self, context: &WorkflowContext) -> Result<()> {
        let checkpoint = Checkpoint::of(context);
        let json = serde_json::to_vec_pretty(&checkpoint)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load the persisted context, failing hard on a version mismatch.
    pub fn load(&self) -> Result<WorkflowContext> {
        let content = std::fs::read_to_string(&self.path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }

        Ok(checkpoint.context)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArtifactRef, Id, Stage, StageEvent, StageResult};
    use tempfile::TempDir;

    fn populated_context() -> WorkflowContext {
        let mut ctx = WorkflowContext::new("issue-42", "/work/issue-42").with_plan("plans/42.md");
        ctx.stage = Stage::Review;
        ctx.iteration = 3;
        ctx.pr_attempts = 1;
        ctx.last_score = Some(82);
        ctx.merge(
            &StageResult::new(StageEvent::ReviewFailed, "corner cases below bar")
                .with_payload("review_feedback", "add tests for empty input")
                .with_artifact(ArtifactRef {
                    id: Id::from_string("art-1"),
                    kind: "review_report".to_string(),
                    path: "/work/issue-42/logs/forge/iter-03-review.json".to_string(),
                    checksum: "deadbeef".to_string(),
                }),
        );
        ctx.merge(&StageResult::new(StageEvent::ReviewFailed, "still short"));
        ctx
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let ctx = populated_context();

        store.save(&ctx).unwrap();
        let restored = store.load().unwrap();

        assert_eq!(restored, ctx);
        // History order is part of equality, but make it explicit.
        assert_eq!(
            restored
                .history
                .iter()
                .map(|h| h.outcome.clone())
                .collect::<Vec<_>>(),
            vec!["review_failed".to_string(), "review_failed".to_string()]
        );
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path);
        store.save(&populated_context()).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn version_mismatch_is_a_hard_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path);
        store.save(&populated_context()).unwrap();

        // Rewrite with a bumped version tag.
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        value["version"] = serde_json::json!(CHECKPOINT_VERSION + 1);
        std::fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::VersionMismatch { found, expected }
                if found == CHECKPOINT_VERSION + 1 && expected == CHECKPOINT_VERSION
        ));
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/forge/issue-42/checkpoint.json");
        let store = CheckpointStore::new(&path);
        store.save(&populated_context()).unwrap();
        assert!(path.exists());
    }
}
