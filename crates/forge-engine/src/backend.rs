//! The AI backend boundary: submit a rendered request, get text back.
//!
//! Kernels own prompt rendering and response parsing; this module only
//! executes the backend CLI with a bounded timeout and bounded output
//! capture. A timed-out process is killed and reaped before returning.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages during long executions.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for capturing stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes to capture from stdout/stderr. Prevents OOM if the
/// backend produces runaway output.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend binary not found: {0}")]
    NotFound(String),
    #[error("backend timed out after {0} seconds")]
    Timeout(u32),
    #[error("backend exited with code {0}")]
    ExitCode(i32),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Text response from one backend call.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub output: String,
    pub duration_ms: u64,
}

/// One opaque operation: submit a request, receive text within a timeout.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn submit(&self, prompt: &str, working_dir: &Path) -> Result<BackendResponse>;
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub bin: String,
    /// Model name passed via `--model`.
    pub model: String,
    /// Timeout per invocation in seconds (0 = no timeout).
    pub timeout_sec: u32,
}

impl BackendConfig {
    pub fn from_workflow(config: &forge_core::WorkflowConfig) -> Self {
        Self {
            bin: config.backend_bin.clone(),
            model: config.model.clone(),
            timeout_sec: config.backend_timeout_sec,
        }
    }

    /// Config for review calls, which may use a different model.
    pub fn from_workflow_for_review(config: &forge_core::WorkflowConfig) -> Self {
        Self {
            bin: config.backend_bin.clone(),
            model: config.review_model().to_string(),
            timeout_sec: config.backend_timeout_sec,
        }
    }
}

/// CLI-backed implementation: spawns `<bin> -p --model <model> <prompt>`
/// in the working tree and captures stdout/stderr.
#[derive(Debug)]
pub struct CliBackend {
    config: BackendConfig,
}

impl CliBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
}

/// Read from an async reader with a maximum byte limit, draining the rest.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "backend output exceeded limit, truncating");
            // Keep reading to drain the pipe but discard.
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

async fn capture(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    label: &str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(error = %err, "{label} capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(error = %err, "{label} task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!("{label} capture timed out");
            Vec::new()
        }
    }
}

#[async_trait]
impl Backend for CliBackend {
    async fn submit(&self, prompt: &str, working_dir: &Path) -> Result<BackendResponse> {
        let mut cmd = Command::new(&self.config.bin);
        cmd.arg("-p")
            .arg("--model")
            .arg(&self.config.model)
            .arg(prompt)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            bin = %self.config.bin,
            model = %self.config.model,
            working_dir = %working_dir.display(),
            "spawning backend process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::NotFound(self.config.bin.clone())
            } else {
                BackendError::Io(e)
            }
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let timeout_duration = Duration::from_secs(u64::from(self.config.timeout_sec));

        let outcome = loop {
            let elapsed = started.elapsed();

            if self.config.timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(
                    timeout_sec = self.config.timeout_sec,
                    "backend timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed-out backend");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }

            let remaining = if self.config.timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };
            let sleep_duration = HEARTBEAT_INTERVAL.min(remaining);

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessOutcome::Completed(status),
                        Err(e) => return Err(BackendError::Io(e)),
                    }
                }
                () = tokio::time::sleep(sleep_duration) => {
                    info!(
                        elapsed_sec = started.elapsed().as_secs(),
                        timeout_sec = self.config.timeout_sec,
                        "backend still running"
                    );
                }
            }
        };

        // Pipe closes after exit or kill, so the capture tasks finish fast.
        let stdout = capture(stdout_task, "stdout").await;
        let stderr = capture(stderr_task, "stderr").await;

        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            ProcessOutcome::TimedOut => Err(BackendError::Timeout(self.config.timeout_sec)),
            ProcessOutcome::Completed(status) => {
                let exit_code = status.code().unwrap_or(-1);
                let stdout_text = String::from_utf8_lossy(&stdout);
                let output = if stderr.is_empty() {
                    stdout_text.to_string()
                } else {
                    format!(
                        "{stdout_text}\n\n--- STDERR ---\n{}",
                        String::from_utf8_lossy(&stderr)
                    )
                };

                info!(
                    exit_code,
                    duration_ms,
                    output_bytes = output.len(),
                    "backend call complete"
                );

                if exit_code != 0 {
                    return Err(BackendError::ExitCode(exit_code));
                }

                Ok(BackendResponse {
                    output,
                    duration_ms,
                })
            }
        }
    }
}
