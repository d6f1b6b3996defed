//! VCS host operations via the `gh` CLI: pull-request creation, reuse,
//! and check status.

use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("gh CLI not available")]
    Unavailable,
    #[error("gh command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute gh: {0}")]
    Execution(#[from] std::io::Error),
    #[error("unexpected gh output: {0}")]
    BadOutput(String),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// An open pull request on the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Check if the gh CLI is available.
pub fn is_available() -> bool {
    Command::new("gh")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn run_gh(worktree: &Path, args: &[&str]) -> Result<std::process::Output> {
    Ok(Command::new("gh").args(args).current_dir(worktree).output()?)
}

/// Find an existing open PR for the head branch, if any.
pub fn find_open_pr(worktree: &Path, head_branch: &str) -> Result<Option<PullRequest>> {
    let output = run_gh(
        worktree,
        &[
            "pr",
            "list",
            "--head",
            head_branch,
            "--state",
            "open",
            "--json",
            "number,url",
        ],
    )?;
    if !output.status.success() {
        return Err(HostError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    parse_pr_list(&String::from_utf8_lossy(&output.stdout))
}

fn parse_pr_list(json: &str) -> Result<Option<PullRequest>> {
    let prs: Vec<PullRequest> =
        serde_json::from_str(json.trim()).map_err(|e| HostError::BadOutput(e.to_string()))?;
    Ok(prs.into_iter().next())
}

/// Create a pull request, returning its URL.
pub fn create_pr(
    worktree: &Path,
    head_branch: &str,
    base_branch: &str,
    title: &str,
    body: &str,
) -> Result<String> {
    let output = run_gh(
        worktree,
        &[
            "pr",
            "create",
            "--head",
            head_branch,
            "--base",
            base_branch,
            "--title",
            title,
            "--body",
            body,
        ],
    )?;
    if !output.status.success() {
        return Err(HostError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if url.is_empty() {
        return Err(HostError::BadOutput(
            "gh pr create returned empty output".to_string(),
        ));
    }
    Ok(url)
}

/// Status of the checks on a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksOutcome {
    Pass,
    Pending,
    Fail(String),
}

/// Query the CI checks on a pull request.
///
/// `gh pr checks` exits 0 when all checks pass and 8 while checks are
/// still pending; any other failure carries the check summary.
pub fn pr_checks(worktree: &Path, number: u64) -> Result<ChecksOutcome> {
    let output = run_gh(worktree, &["pr", "checks", &number.to_string()])?;
    match output.status.code() {
        Some(0) => Ok(ChecksOutcome::Pass),
        Some(8) => Ok(ChecksOutcome::Pending),
        _ => {
            let summary = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout).trim(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Ok(ChecksOutcome::Fail(summary.trim().to_string()))
        }
    }
}

/// Append a closing reference to the tracked issue when the body lacks one.
pub fn ensure_closing_reference(body: &str, issue_id: &str) -> String {
    let reference = format!("Closes #{issue_id}");
    if body.contains(&reference) {
        return body.to_string();
    }
    if body.trim().is_empty() {
        reference
    } else {
        format!("{}\n\n{reference}", body.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_reference_appended_when_absent() {
        let body = ensure_closing_reference("Adds the retry budget.", "42");
        assert_eq!(body, "Adds the retry budget.\n\nCloses #42");
    }

    #[test]
    fn closing_reference_not_duplicated() {
        let body = "Adds the retry budget.\n\nCloses #42";
        assert_eq!(ensure_closing_reference(body, "42"), body);
    }

    #[test]
    fn closing_reference_alone_for_empty_body() {
        assert_eq!(ensure_closing_reference("  ", "7"), "Closes #7");
    }

    #[test]
    fn pr_list_parses_first_entry() {
        let json = r#"[{"number": 12, "url": "https://example.com/pull/12"}]"#;
        let pr = parse_pr_list(json).unwrap().unwrap();
        assert_eq!(pr.number, 12);
        assert_eq!(pr.url, "https://example.com/pull/12");
    }

    #[test]
    fn pr_list_empty_is_none() {
        assert_eq!(parse_pr_list("[]").unwrap(), None);
    }

    #[test]
    fn pr_list_garbage_is_bad_output() {
        assert!(matches!(
            parse_pr_list("not json"),
            Err(HostError::BadOutput(_))
        ));
    }
}
