//! Configuration for the cadence engine.
//!
//! Every field has a serde default, so a partial (or empty) JSON object is a
//! valid configuration file.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration shared by every workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consecutive CI failures on one story that block the sprint.
    #[serde(default = "default_ci_failure_threshold")]
    pub ci_failure_threshold: u32,

    /// Fire "all tasks done" when the last live cycle retires during an
    /// active sprint.
    #[serde(default = "default_auto_review")]
    pub auto_review_on_completion: bool,

    /// Number of transitions listed in a recovery report.
    #[serde(default = "default_recent_transitions_limit")]
    pub recent_transitions_limit: usize,

    /// Maximum number of recovery suggestions.
    #[serde(default = "default_recovery_options_limit")]
    pub recovery_options_limit: usize,
}

fn default_ci_failure_threshold() -> u32 {
    3
}

fn default_auto_review() -> bool {
    true
}

fn default_recent_transitions_limit() -> usize {
    10
}

fn default_recovery_options_limit() -> usize {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ci_failure_threshold: default_ci_failure_threshold(),
            auto_review_on_completion: default_auto_review(),
            recent_transitions_limit: default_recent_transitions_limit(),
            recovery_options_limit: default_recovery_options_limit(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Self = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        std::fs::write(path, content).map_err(ConfigError::Io)
    }

    /// Reject values no workflow could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ci_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "ci_failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur when working with configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading or writing config.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing config JSON.
    #[error("Parse error: {0}")]
    Parse(#[source] serde_json::Error),

    /// Error serializing config to JSON.
    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
