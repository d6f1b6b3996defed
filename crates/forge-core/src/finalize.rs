//! The finalize record: agreed title/body content used verbatim for
//! pull-request submission.
//!
//! The implementation stage instructs the backend to write
//! `finalize.yaml` into the run directory once the issue is resolved. A
//! malformed title is a contract violation, a hard error rather than a
//! routed event.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Filename of the finalize record inside the run directory.
pub const FINALIZE_FILENAME: &str = "finalize.yaml";

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("finalize record not found at {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("finalize record is not valid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("malformed PR title {title:?}: {reason}")]
    MalformedTitle { title: String, reason: String },
    #[error("finalize title references issue #{found}, expected #{expected}")]
    WrongIssue { found: String, expected: String },
}

pub type Result<T> = std::result::Result<T, FinalizeError>;

/// Title and body used verbatim when the PR is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeRecord {
    pub title: String,
    pub body: String,
}

impl FinalizeRecord {
    /// Load the record from a run directory.
    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(FINALIZE_FILENAME);
        if !path.exists() {
            return Err(FinalizeError::NotFound(path.to_string_lossy().to_string()));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Validate the title against the fixed `[tag] #issue: description`
    /// format and the tracked issue id.
    pub fn validate(&self, issue_id: &str) -> Result<ParsedTitle> {
        let parsed = parse_title(&self.title)?;
        if parsed.issue != issue_id {
            return Err(FinalizeError::WrongIssue {
                found: parsed.issue,
                expected: issue_id.to_string(),
            });
        }
        Ok(parsed)
    }
}

/// The components of a well-formed PR title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTitle {
    pub tag: String,
    pub issue: String,
    pub description: String,
}

/// Parse `[<tag>] #<issue>: <description>`.
///
/// Tag: lowercase alphanumerics and hyphens. Issue: digits only.
/// Description: non-empty after trimming.
pub fn parse_title(title: &str) -> Result<ParsedTitle> {
    let malformed = |reason: &str| FinalizeError::MalformedTitle {
        title: title.to_string(),
        reason: reason.to_string(),
    };

    let rest = title
        .strip_prefix('[')
        .ok_or_else(|| malformed("missing leading [tag]"))?;
    let (tag, rest) = rest
        .split_once(']')
        .ok_or_else(|| malformed("unterminated [tag]"))?;

    if tag.is_empty()
        || !tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(malformed("tag must be lowercase alphanumerics or hyphens"));
    }

    let rest = rest
        .strip_prefix(" #")
        .ok_or_else(|| malformed("expected ` #<issue>` after tag"))?;
    let (issue, description) = rest
        .split_once(':')
        .ok_or_else(|| malformed("expected `:` after issue number"))?;

    if issue.is_empty() || !issue.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed("issue reference must be digits"));
    }

    let description = description.trim();
    if description.is_empty() {
        return Err(malformed("description must not be empty"));
    }

    Ok(ParsedTitle {
        tag: tag.to_string(),
        issue: issue.to_string(),
        description: description.to_string(),
    })
}
