//! Workflow configuration.
//!
//! Parses the `key=value` format from `.forge/config`. Every retryable
//! path's hard ceiling lives here, so termination is a configuration
//! property rather than scattered magic numbers.

use crate::review::ReviewThresholds;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Workflow and collaborator configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    // Backend CLI settings
    pub backend_bin: String,
    pub model: String,
    /// Model for review steps; falls back to `model` when unset.
    pub review_model: Option<String>,
    pub backend_timeout_sec: u32,

    // Convergence guards (hard ceilings)
    pub max_iterations: u32,
    pub max_parse_failures: u32,
    pub max_review_stalls: u32,
    pub max_pr_attempts: u32,
    pub max_rebase_attempts: u32,

    // Review gate
    pub fidelity_threshold: u32,
    pub dimension_threshold: u32,

    // Parse gate: shell commands run per changed file, `{file}` substituted.
    pub parse_cmds: Vec<String>,
    pub parse_timeout_sec: u32,

    // VCS
    pub remote: String,
    /// Base branch override; detected from the remote when unset.
    pub base_branch: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            backend_bin: "claude".to_string(),
            model: "opus".to_string(),
            review_model: None,
            backend_timeout_sec: 600,
            max_iterations: 50,
            max_parse_failures: 5,
            max_review_stalls: 4,
            max_pr_attempts: 6,
            max_rebase_attempts: 3,
            fidelity_threshold: 90,
            dimension_threshold: 85,
            parse_cmds: Vec::new(),
            parse_timeout_sec: 120,
            remote: "origin".to_string(),
            base_branch: None,
        }
    }
}

impl WorkflowConfig {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Review thresholds derived from the configured bars.
    pub fn review_thresholds(&self) -> ReviewThresholds {
        ReviewThresholds {
            fidelity: self.fidelity_threshold,
            others: self.dimension_threshold,
        }
    }

    /// Model used for review steps.
    pub fn review_model(&self) -> &str {
        self.review_model.as_deref().unwrap_or(&self.model)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            match key {
                "backend_bin" => self.backend_bin = value.to_string(),
                "model" => self.model = value.to_string(),
                "review_model" => self.review_model = Some(value.to_string()),
                "backend_timeout_sec" => self.backend_timeout_sec = Self::parse_u32(key, value)?,
                "max_iterations" => self.max_iterations = Self::parse_u32(key, value)?,
                "max_parse_failures" => self.max_parse_failures = Self::parse_u32(key, value)?,
                "max_review_stalls" => self.max_review_stalls = Self::parse_u32(key, value)?,
                "max_pr_attempts" => self.max_pr_attempts = Self::parse_u32(key, value)?,
                "max_rebase_attempts" => self.max_rebase_attempts = Self::parse_u32(key, value)?,
                "fidelity_threshold" => self.fidelity_threshold = Self::parse_u32(key, value)?,
                "dimension_threshold" => self.dimension_threshold = Self::parse_u32(key, value)?,
                "parse_cmds" => {
                    self.parse_cmds = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                "parse_timeout_sec" => self.parse_timeout_sec = Self::parse_u32(key, value)?,
                "remote" => self.remote = value.to_string(),
                "base_branch" => self.base_branch = Some(value.to_string()),
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }
        Ok(())
    }

    fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Strip one layer of matching quotes.
    fn unquote(value: &str) -> &str {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            &value[1..value.len() - 1]
        } else {
            value
        }
    }
}
