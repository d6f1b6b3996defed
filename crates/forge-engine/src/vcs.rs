//! Git operations for the workflow engine.
//!
//! All calls run against the instance's working tree. Remote failures are
//! returned as data (push/rebase outcomes) so kernels can classify them
//! into the event taxonomy instead of retrying blindly here.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run_git(worktree: &Path, args: &[&str]) -> Result<std::process::Output> {
    Ok(Command::new("git")
        .args(args)
        .current_dir(worktree)
        .output()?)
}

fn run_git_checked(worktree: &Path, args: &[&str]) -> Result<String> {
    let output = run_git(worktree, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Detect the base branch for a repository.
///
/// Tries the remote HEAD reference first, then falls back to `main`, then
/// `master`, then defaults to `main`.
pub fn detect_base_branch(worktree: &Path, remote: &str) -> Result<String> {
    let output = run_git(
        worktree,
        &["symbolic-ref", &format!("refs/remotes/{remote}/HEAD")],
    )?;
    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| GitError::InvalidUtf8)?
            .trim()
            .to_string();
        let prefix = format!("refs/remotes/{remote}/");
        if let Some(branch) = full_ref.strip_prefix(prefix.as_str()) {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = run_git(
            worktree,
            &["rev-parse", "--verify", &format!("refs/heads/{candidate}")],
        )?;
        if check.status.success() {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

/// Name of the currently checked-out branch.
pub fn current_branch(worktree: &Path) -> Result<String> {
    run_git_checked(worktree, &["branch", "--show-current"])
}

/// Whether the working tree has uncommitted changes (staged, unstaged, or
/// untracked).
pub fn has_uncommitted_changes(worktree: &Path) -> Result<bool> {
    let stdout = run_git_checked(worktree, &["status", "--porcelain"])?;
    Ok(!stdout.is_empty())
}

/// Stage everything and commit. Returns false when there was nothing to
/// commit.
pub fn commit_all(worktree: &Path, message: &str) -> Result<bool> {
    run_git_checked(worktree, &["add", "-A"])?;

    let staged = run_git(worktree, &["diff", "--cached", "--quiet"])?;
    if staged.status.success() {
        return Ok(false);
    }

    run_git_checked(worktree, &["commit", "-m", message])?;
    Ok(true)
}

/// Files touched by the latest commit.
pub fn changed_files_in_head(worktree: &Path) -> Result<Vec<String>> {
    let stdout = run_git_checked(
        worktree,
        &["diff-tree", "--no-commit-id", "--name-only", "-r", "HEAD"],
    )?;
    Ok(stdout.lines().map(str::to_string).collect())
}

/// Aggregate diff of the branch against its merge base with `base`.
pub fn diff_against(worktree: &Path, base: &str) -> Result<String> {
    run_git_checked(worktree, &["diff", &format!("{base}...HEAD")])
}

pub fn fetch(worktree: &Path, remote: &str) -> Result<()> {
    run_git_checked(worktree, &["fetch", remote])?;
    Ok(())
}

/// Outcome of a push attempt. Rejection for divergent history is data, not
/// an error, so the PR kernel can route it to the rebase stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    NonFastForward(String),
}

/// Push the branch to the remote.
pub fn push(worktree: &Path, remote: &str, branch: &str) -> Result<PushOutcome> {
    let output = run_git(worktree, &["push", remote, branch])?;
    if output.status.success() {
        return Ok(PushOutcome::Pushed);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
        || stderr.contains("[rejected]")
    {
        return Ok(PushOutcome::NonFastForward(stderr.trim().to_string()));
    }

    Err(GitError::CommandFailed(format!(
        "git push {remote} {branch}: {}",
        stderr.trim()
    )))
}

/// Outcome of a rebase attempt. On conflict the rebase is aborted before
/// returning, so the working tree is restored exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Rebased,
    Conflict(String),
}

/// Rebase the current branch onto `upstream`, aborting cleanly on conflict.
pub fn rebase_onto(worktree: &Path, upstream: &str) -> Result<RebaseOutcome> {
    let output = run_git(worktree, &["rebase", upstream])?;
    if output.status.success() {
        return Ok(RebaseOutcome::Rebased);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let combined = format!("{stdout}\n{stderr}");

    if combined.contains("CONFLICT") || rebase_in_progress(worktree)? {
        let abort = run_git(worktree, &["rebase", "--abort"])?;
        if !abort.status.success() {
            return Err(GitError::CommandFailed(format!(
                "git rebase --abort: {}",
                String::from_utf8_lossy(&abort.stderr).trim()
            )));
        }
        return Ok(RebaseOutcome::Conflict(combined.trim().to_string()));
    }

    Err(GitError::CommandFailed(format!(
        "git rebase {upstream}: {}",
        stderr.trim()
    )))
}

/// Whether a rebase is currently in progress in this working tree.
pub fn rebase_in_progress(worktree: &Path) -> Result<bool> {
    for dir in ["rebase-merge", "rebase-apply"] {
        let path = run_git_checked(worktree, &["rev-parse", "--git-path", dir])?;
        if worktree.join(&path).exists() || Path::new(&path).exists() {
            return Ok(true);
        }
    }
    Ok(false)
}
