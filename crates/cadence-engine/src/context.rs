//! Caller-supplied facts consulted by guards.
//!
//! Recognized keys are typed fields with closed value domains. Anything else
//! lands in [`CommandContext::extensions`], is kept in the audit snapshot, and
//! is never read by a guard.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::AgentType;

/// Continuous-integration status reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    /// Latest build is green.
    Passing,
    /// Latest build is red.
    Failing,
    /// No CI signal available.
    #[default]
    Unknown,
}

/// Context attached to a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// CI status of the working branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_status: Option<CiStatus>,

    /// Whether the working tree has uncommitted changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncommitted_changes: Option<bool>,

    /// Agent that produced or will act on a TDD transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,

    /// Extension point: keys no guard recognizes yet.
    ///
    /// Must not hold a recognized key; use [`CommandContext::with_extension`].
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl CommandContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a context from a JSON object.
    ///
    /// Recognized keys must carry a value from their domain; unknown keys are
    /// accepted as extensions.
    pub fn from_json(json: &str) -> Result<Self, ContextError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(ContextError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Set the CI status.
    pub fn with_ci_status(mut self, status: CiStatus) -> Self {
        self.ci_status = Some(status);
        self
    }

    /// Set the uncommitted-changes flag.
    pub fn with_uncommitted_changes(mut self, dirty: bool) -> Self {
        self.uncommitted_changes = Some(dirty);
        self
    }

    /// Set the agent type.
    pub fn with_agent_type(mut self, agent: AgentType) -> Self {
        self.agent_type = Some(agent);
        self
    }

    /// Add a key by name.
    ///
    /// Recognized keys are parsed into their typed field and must carry a
    /// value from their domain; anything else becomes an extension.
    pub fn with_extension(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Self, ContextError> {
        let key = key.into();
        match key.as_str() {
            "ci_status" => self.ci_status = serde_json::from_value(value)?,
            "uncommitted_changes" => self.uncommitted_changes = serde_json::from_value(value)?,
            "agent_type" => self.agent_type = serde_json::from_value(value)?,
            _ => {
                self.extensions.insert(key, value);
            }
        }
        Ok(self)
    }

    /// True when CI is explicitly reported as failing.
    pub fn ci_failing(&self) -> bool {
        self.ci_status == Some(CiStatus::Failing)
    }

    /// True when uncommitted changes are explicitly reported.
    pub fn has_uncommitted_changes(&self) -> bool {
        self.uncommitted_changes == Some(true)
    }
}

/// Errors from parsing a context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Malformed JSON or a recognized key with a value outside its domain.
    #[error("Invalid context: {0}")]
    Invalid(#[from] serde_json::Error),

    /// Top-level JSON value was not an object.
    #[error("Invalid context: expected a JSON object")]
    NotAnObject,
}
