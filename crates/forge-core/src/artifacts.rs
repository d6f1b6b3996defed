//! Structured diagnostic artifacts, one per stage attempt.
//!
//! Reports are JSON files keyed by stage and iteration
//! (`iter-NN-<stage>.json`) under the run directory, with a SHA-256
//! checksum recorded in the returned `ArtifactRef`. They are read by human
//! operators and by the next kernel invocation's feedback convention.

use crate::types::{ArtifactRef, HistoryEntry, Id, Stage};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Parse-gate report: which files failed, with traces and a retry hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseGateReport {
    pub issue_id: String,
    pub iteration: u32,
    pub failing_files: Vec<ParseFailure>,
    /// Suggestion folded into the next implementation prompt.
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseFailure {
    pub file: String,
    pub trace: String,
}

/// How the review scores were recovered from backend output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewParseMode {
    Structured,
    Freeform,
}

/// Review report: per-dimension scores, verdict, findings, suggestions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewReport {
    pub issue_id: String,
    pub iteration: u32,
    pub attempt: u32,
    pub fidelity: u32,
    pub style: u32,
    pub docs: u32,
    pub corner_cases: u32,
    pub passed: bool,
    pub failing_dimensions: Vec<String>,
    pub findings: Vec<String>,
    pub suggestions: Vec<String>,
    pub parse_mode: ReviewParseMode,
    /// Path to the raw backend output for this attempt.
    pub raw_output_path: String,
}

/// PR-stage report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrReport {
    pub issue_id: String,
    pub iteration: u32,
    pub attempt: u32,
    pub event: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

/// Rebase-stage report with attempted commands and any conflict summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebaseReport {
    pub issue_id: String,
    pub iteration: u32,
    pub attempt: u32,
    pub event: String,
    pub message: String,
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_summary: Option<String>,
}

/// Terminal diagnostic written on any fatal transition, carrying the full
/// history for manual resumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatalReport {
    pub issue_id: String,
    pub iteration: u32,
    pub stage: Stage,
    pub reason: String,
    pub history: Vec<HistoryEntry>,
}

/// Run directory for one workflow instance:
/// `<worktree>/logs/forge/issue-<issue_id>/`.
pub fn run_dir(worktree: &Path, issue_id: &str) -> PathBuf {
    worktree.join("logs/forge").join(format!("issue-{issue_id}"))
}

/// Create the run directory for an instance.
///
/// Drops a `.gitignore` covering the whole directory so diagnostics never
/// show up in `git status` or get swept into increment commits.
pub fn ensure_run_dir(worktree: &Path, issue_id: &str) -> Result<PathBuf> {
    let dir = run_dir(worktree, issue_id);
    std::fs::create_dir_all(&dir)?;
    let ignore = dir.join(".gitignore");
    if !ignore.exists() {
        std::fs::write(&ignore, "*\n")?;
    }
    Ok(dir)
}

/// Report path keyed by stage and iteration: `iter-NN-<stage>.json`.
pub fn report_path(run_dir: &Path, iteration: u32, stage: Stage) -> PathBuf {
    run_dir.join(format!("iter-{iteration:02}-{}.json", stage.as_str()))
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Serialize a report to its keyed path and return a checksummed reference.
pub fn write_report<T: Serialize>(
    run_dir: &Path,
    iteration: u32,
    stage: Stage,
    kind: &str,
    report: &T,
) -> Result<ArtifactRef> {
    std::fs::create_dir_all(run_dir)?;
    let path = report_path(run_dir, iteration, stage);
    let json = serde_json::to_vec_pretty(report)?;
    std::fs::write(&path, &json)?;

    Ok(ArtifactRef {
        id: Id::new(),
        kind: kind.to_string(),
        path: path.to_string_lossy().to_string(),
        checksum: checksum(&json),
    })
}

/// Read a report back from an artifact reference.
pub fn read_report<T: DeserializeOwned>(artifact: &ArtifactRef) -> Result<T> {
    let content = std::fs::read_to_string(&artifact.path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write raw backend output beside the reports: `iter-NN-<stage>.out.txt`.
pub fn write_raw_output(
    run_dir: &Path,
    iteration: u32,
    stage: Stage,
    output: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(run_dir)?;
    let path = run_dir.join(format!("iter-{iteration:02}-{}.out.txt", stage.as_str()));
    std::fs::write(&path, output.as_bytes())?;
    Ok(path)
}
