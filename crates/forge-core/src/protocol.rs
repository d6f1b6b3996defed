//! The output protocol between the orchestrator and the backend.
//!
//! Implementation responses carry two machine-readable fragments:
//! - a completion marker, accepted only as the last non-empty line, that
//!   signals the issue is fully resolved;
//! - a change summary block, used verbatim as the commit message for the
//!   increment.

/// The completion marker that signals the issue is resolved.
pub const COMPLETION_MARKER: &str = "<resolution>COMPLETE</resolution>";

/// Opening/closing tags of the change summary block.
pub const SUMMARY_OPEN: &str = "<summary>";
pub const SUMMARY_CLOSE: &str = "</summary>";

/// Result of completion-marker detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerResult {
    /// Marker accepted: it is the last non-empty line of the output.
    pub is_complete: bool,
    /// Marker found anywhere in the output.
    pub marker_found: bool,
    /// Marker found but not accepted (embedded mid-output).
    pub is_malformed: bool,
}

/// Check whether the output signals completion.
///
/// The marker is accepted only as the trimmed last non-empty line, so a
/// backend musing about the marker mid-response does not end the run.
pub fn check_completion(output: &str) -> MarkerResult {
    let marker_found = output.contains(COMPLETION_MARKER);

    let last_nonempty_line = output
        .lines()
        .rfind(|line| !line.trim().is_empty())
        .unwrap_or("");
    let is_complete = last_nonempty_line.trim() == COMPLETION_MARKER;

    MarkerResult {
        is_complete,
        marker_found,
        is_malformed: marker_found && !is_complete,
    }
}

/// Extract the change summary block, trimmed, if present and non-empty.
pub fn extract_change_summary(output: &str) -> Option<String> {
    let start = output.find(SUMMARY_OPEN)? + SUMMARY_OPEN.len();
    let end = output[start..].find(SUMMARY_CLOSE)? + start;
    let summary = output[start..end].trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}
