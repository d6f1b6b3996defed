//! Review scoring: the four-dimension model, drift-tolerant parsing, and
//! the threshold gate.
//!
//! The backend is asked for a structured JSON block. Backends drift, so a
//! deterministic free-text fallback scans for `dimension: score` lines when
//! the JSON cannot be recovered. The fallback is recorded, not punished; an
//! attempt only fails outright when not even the fallback can recover all
//! four dimensions.

use crate::artifacts::ReviewParseMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Names of the four scored dimensions, in canonical order.
pub const DIMENSIONS: [&str; 4] = ["fidelity", "style", "docs", "corner_cases"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReviewParseError {
    #[error("review output is missing dimensions: {0:?}")]
    MissingDimensions(Vec<String>),
    #[error("review score out of range for {dimension}: {value}")]
    ScoreOutOfRange { dimension: String, value: u64 },
}

/// Per-dimension scores, each 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewScores {
    pub fidelity: u32,
    pub style: u32,
    pub docs: u32,
    pub corner_cases: u32,
}

impl ReviewScores {
    /// Overall score used for stall detection: arithmetic mean.
    pub fn overall(&self) -> u32 {
        (self.fidelity + self.style + self.docs + self.corner_cases) / 4
    }

    fn get(&self, dimension: &str) -> u32 {
        match dimension {
            "fidelity" => self.fidelity,
            "style" => self.style,
            "docs" => self.docs,
            _ => self.corner_cases,
        }
    }
}

/// Gate thresholds. Fidelity carries the highest bar; the other three
/// dimensions share a common bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewThresholds {
    pub fidelity: u32,
    pub others: u32,
}

impl Default for ReviewThresholds {
    fn default() -> Self {
        Self {
            fidelity: 90,
            others: 85,
        }
    }
}

impl ReviewThresholds {
    pub fn for_dimension(&self, dimension: &str) -> u32 {
        if dimension == "fidelity" {
            self.fidelity
        } else {
            self.others
        }
    }
}

/// Gate verdict: pass requires every dimension independently above its own
/// threshold; a single failing dimension fails the whole gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewVerdict {
    pub passed: bool,
    pub failing_dimensions: Vec<String>,
}

pub fn gate(scores: &ReviewScores, thresholds: &ReviewThresholds) -> ReviewVerdict {
    let failing: Vec<String> = DIMENSIONS
        .iter()
        .filter(|dim| scores.get(dim) < thresholds.for_dimension(dim))
        .map(|dim| (*dim).to_string())
        .collect();

    ReviewVerdict {
        passed: failing.is_empty(),
        failing_dimensions: failing,
    }
}

/// A parsed review: scores plus findings and suggestions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReview {
    pub scores: ReviewScores,
    pub findings: Vec<String>,
    pub suggestions: Vec<String>,
    pub parse_mode: ReviewParseMode,
}

/// Wire shape of the structured block the review prompt requests.
#[derive(Debug, Deserialize)]
struct StructuredReview {
    fidelity: u64,
    style: u64,
    docs: u64,
    corner_cases: u64,
    #[serde(default)]
    findings: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Parse review output: structured JSON first, free-text fallback second.
pub fn parse_review_output(output: &str) -> Result<ParsedReview, ReviewParseError> {
    if let Some(parsed) = parse_structured(output)? {
        return Ok(parsed);
    }

    warn!("structured review block not found, falling back to free-text scan");
    parse_freeform(output)
}

/// Try to recover the structured JSON block from the output.
///
/// The block may be wrapped in prose or a code fence; scan for the first
/// `{` and try successively longer candidates ending at each `}`.
fn parse_structured(output: &str) -> Result<Option<ParsedReview>, ReviewParseError> {
    let Some(start) = output.find('{') else {
        return Ok(None);
    };

    let tail = &output[start..];
    for (offset, _) in tail.match_indices('}') {
        let candidate = &tail[..=offset];
        if let Ok(review) = serde_json::from_str::<StructuredReview>(candidate) {
            let scores = validate_scores(
                review.fidelity,
                review.style,
                review.docs,
                review.corner_cases,
            )?;
            return Ok(Some(ParsedReview {
                scores,
                findings: review.findings,
                suggestions: review.suggestions,
                parse_mode: ReviewParseMode::Structured,
            }));
        }
    }

    Ok(None)
}

/// Deterministic free-text scan: for each dimension, find the first line
/// mentioning its name and take the first integer after the name.
fn parse_freeform(output: &str) -> Result<ParsedReview, ReviewParseError> {
    let lower = output.to_lowercase();
    let mut values: [Option<u32>; 4] = [None; 4];

    for (slot, dimension) in values.iter_mut().zip(DIMENSIONS.iter()) {
        // Accept the underscore form and the drifted space-separated form.
        let spaced = dimension.replace('_', " ");
        'lines: for line in lower.lines() {
            for needle in [*dimension, spaced.as_str()] {
                let Some(pos) = line.find(needle) else {
                    continue;
                };
                if let Some(value) = first_integer(&line[pos + needle.len()..]) {
                    *slot = Some(value);
                    break 'lines;
                }
            }
        }
    }

    let missing: Vec<String> = DIMENSIONS
        .iter()
        .zip(values.iter())
        .filter(|(_, v)| v.is_none())
        .map(|(d, _)| (*d).to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ReviewParseError::MissingDimensions(missing));
    }

    let scores = validate_scores(
        u64::from(values[0].unwrap_or(0)),
        u64::from(values[1].unwrap_or(0)),
        u64::from(values[2].unwrap_or(0)),
        u64::from(values[3].unwrap_or(0)),
    )?;

    Ok(ParsedReview {
        scores,
        findings: Vec::new(),
        suggestions: Vec::new(),
        parse_mode: ReviewParseMode::Freeform,
    })
}

fn validate_scores(
    fidelity: u64,
    style: u64,
    docs: u64,
    corner_cases: u64,
) -> Result<ReviewScores, ReviewParseError> {
    for (dimension, value) in DIMENSIONS
        .iter()
        .zip([fidelity, style, docs, corner_cases])
    {
        if value > 100 {
            return Err(ReviewParseError::ScoreOutOfRange {
                dimension: (*dimension).to_string(),
                value,
            });
        }
    }
    Ok(ReviewScores {
        fidelity: fidelity as u32,
        style: style as u32,
        docs: docs as u32,
        corner_cases: corner_cases as u32,
    })
}

/// First run of ASCII digits in the string, skipping punctuation like
/// `: 95/100` down to `95`.
fn first_integer(s: &str) -> Option<u32> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let digits: String = s[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
