//! The deterministic parse gate run over changed source files.
//!
//! Executes configured check commands (with `{file}` substituted) against
//! each file from the latest committed change set. Every failing file is
//! collected with its trace so the retry prompt can name the exact
//! breakage.

use forge_core::artifacts::{ParseFailure, ParseGateReport};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ParseGateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ParseGateError>;

/// Outcome of running the gate over one change set.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub passed: bool,
    pub failures: Vec<ParseFailure>,
}

impl GateOutcome {
    /// Build the diagnostic report for a failed gate.
    pub fn into_report(self, issue_id: &str, iteration: u32) -> ParseGateReport {
        let files: Vec<&str> = self.failures.iter().map(|f| f.file.as_str()).collect();
        let suggestion = format!(
            "fix the parse failures in: {}. Re-read each trace below before editing.",
            files.join(", ")
        );
        ParseGateReport {
            issue_id: issue_id.to_string(),
            iteration,
            failing_files: self.failures,
            suggestion,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseGate {
    /// Shell commands with `{file}` substituted per changed file.
    cmds: Vec<String>,
    /// Timeout per command in seconds (0 = no timeout).
    timeout_sec: u32,
}

impl ParseGate {
    pub fn new(cmds: Vec<String>, timeout_sec: u32) -> Self {
        Self { cmds, timeout_sec }
    }

    pub fn from_workflow(config: &forge_core::WorkflowConfig) -> Self {
        Self::new(config.parse_cmds.clone(), config.parse_timeout_sec)
    }

    pub fn has_commands(&self) -> bool {
        !self.cmds.is_empty()
    }

    /// Run every configured command against every changed file.
    ///
    /// Files that no longer exist (deleted in the change set) are skipped.
    /// An unconfigured gate always passes.
    pub async fn run(&self, worktree: &Path, files: &[String]) -> Result<GateOutcome> {
        if !self.has_commands() {
            return Ok(GateOutcome {
                passed: true,
                failures: Vec::new(),
            });
        }

        info!(
            cmd_count = self.cmds.len(),
            file_count = files.len(),
            "running parse gate"
        );

        let mut failures = Vec::new();
        for file in files {
            if !worktree.join(file).exists() {
                debug!(file = %file, "skipping deleted file");
                continue;
            }
            for cmd in &self.cmds {
                let rendered = cmd.replace("{file}", file);
                if let Some(trace) = self.run_command(&rendered, worktree).await? {
                    failures.push(ParseFailure {
                        file: file.clone(),
                        trace,
                    });
                    // One failure per file is enough context for the retry.
                    break;
                }
            }
        }

        let passed = failures.is_empty();
        info!(passed, failing = failures.len(), "parse gate complete");
        Ok(GateOutcome { passed, failures })
    }

    /// Run one rendered command, returning the failure trace if it failed.
    async fn run_command(&self, cmd: &str, worktree: &Path) -> Result<Option<String>> {
        debug!(cmd = %cmd, "executing parse command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = if self.timeout_sec > 0 {
            let limit = Duration::from_secs(u64::from(self.timeout_sec));
            match timeout(limit, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(cmd = %cmd, timeout_sec = self.timeout_sec, "parse command timed out");
                    return Ok(Some(format!(
                        "`{cmd}` timed out after {} seconds",
                        self.timeout_sec
                    )));
                }
            }
        } else {
            child.wait_with_output().await?
        };

        if output.status.success() {
            return Ok(None);
        }

        let trace = format!(
            "`{cmd}` exited with {}\n{}\n{}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(Some(trace.trim().to_string()))
    }
}
