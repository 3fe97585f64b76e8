//! Results of transition requests.
//!
//! A request either commits (`Allowed`) or is refused with a structured
//! [`Denial`]. Denials are values, never panics or `Err`s; only storage
//! faults travel on the `Err` path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::{StateRef, TddState, WorkflowState};

/// Machine-readable denial code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialCode {
    /// Command matches neither command table.
    UnknownCommand,
    /// Known command, wrong current state.
    InvalidState,
    /// A context or cross-machine guard failed.
    GuardViolation,
    /// A cycle already exists for the story.
    DuplicateCycle,
    /// No live cycle for the story.
    CycleNotFound,
}

impl fmt::Display for DenialCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand => write!(f, "UNKNOWN_COMMAND"),
            Self::InvalidState => write!(f, "INVALID_STATE"),
            Self::GuardViolation => write!(f, "GUARD_VIOLATION"),
            Self::DuplicateCycle => write!(f, "DUPLICATE_CYCLE"),
            Self::CycleNotFound => write!(f, "CYCLE_NOT_FOUND"),
        }
    }
}

/// The specific guard that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardViolation {
    /// CI reported as failing.
    CiFailing,
    /// Working tree has uncommitted changes.
    UncommittedChanges,
    /// Cycles that are not DONE block the target state.
    ActiveCycles {
        /// Blocking story ids, sorted.
        stories: Vec<String>,
    },
    /// Consecutive CI failures are below the blocking threshold.
    CiThresholdNotReached {
        /// Reported consecutive failures.
        consecutive: u32,
        /// Configured threshold.
        threshold: u32,
    },
    /// The command needs a reason and none was given.
    MissingReason,
    /// A story id is empty or contains disallowed characters.
    InvalidStoryId {
        /// The rejected id.
        story_id: String,
    },
}

impl GuardViolation {
    /// Human-readable reason.
    pub fn describe(&self) -> String {
        match self {
            Self::CiFailing => {
                "CI is failing; fix the build before starting the sprint".to_string()
            }
            Self::UncommittedChanges => {
                "uncommitted changes present; commit or stash them first".to_string()
            }
            Self::ActiveCycles { stories } => {
                format!("TDD cycles still active for: {}", stories.join(", "))
            }
            Self::CiThresholdNotReached {
                consecutive,
                threshold,
            } => format!("{consecutive} consecutive CI failure(s); blocking needs {threshold}"),
            Self::MissingReason => "a reason is required".to_string(),
            Self::InvalidStoryId { story_id } => format!("invalid story id: {story_id:?}"),
        }
    }
}

/// Structured refusal of a transition request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", rename = "error")]
#[error("{code}: {reason}")]
pub struct Denial {
    /// Denial code.
    pub code: DenialCode,
    /// State of the machine that refused.
    pub current_state: StateRef,
    /// Command text as received.
    pub command: String,
    /// States in which the command is legal.
    pub allowed_in: Vec<StateRef>,
    /// Why the request was refused.
    pub reason: String,
    /// Suggested legal next command.
    pub hint: String,
    /// Failed guard, for `GUARD_VIOLATION`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<GuardViolation>,
}

impl Denial {
    /// Create a denial without a guard detail.
    pub fn new(
        code: DenialCode,
        current_state: impl Into<StateRef>,
        command: impl Into<String>,
        reason: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            code,
            current_state: current_state.into(),
            command: command.into(),
            allowed_in: Vec::new(),
            reason: reason.into(),
            hint: hint.into(),
            violation: None,
        }
    }

    /// Create a guard-violation denial.
    pub fn guard(
        current_state: impl Into<StateRef>,
        command: impl Into<String>,
        violation: GuardViolation,
        hint: impl Into<String>,
    ) -> Self {
        let mut denial = Self::new(
            DenialCode::GuardViolation,
            current_state,
            command,
            violation.describe(),
            hint,
        );
        denial.violation = Some(violation);
        denial
    }

    /// Set the legal states.
    pub fn with_allowed_in<S: Into<StateRef>>(
        mut self,
        states: impl IntoIterator<Item = S>,
    ) -> Self {
        self.allowed_in = states.into_iter().map(Into::into).collect();
        self
    }

    /// Story ids named by an active-cycles guard, if that is what failed.
    pub fn blocking_stories(&self) -> &[String] {
        match &self.violation {
            Some(GuardViolation::ActiveCycles { stories }) => stories,
            _ => &[],
        }
    }
}

/// A committed workflow transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    /// Command text or trigger name.
    pub command: String,
    /// State before the transition.
    pub from: WorkflowState,
    /// State after the transition; equal to `from` for read-only commands.
    pub to: WorkflowState,
    /// Whether guards were bypassed.
    pub forced: bool,
    /// Sequence number of the history record; `None` for queries, which
    /// are not recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Stories whose cycles were created by this transition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cycles_started: Vec<String>,
    /// Stories whose cycles were retired by this transition.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cycles_retired: Vec<String>,
}

impl WorkflowTransition {
    /// Whether the state changed.
    pub fn changed_state(&self) -> bool {
        self.from != self.to
    }
}

/// A committed TDD transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TddTransition {
    /// Story id.
    pub story_id: String,
    /// Cycle id.
    pub cycle_id: uuid::Uuid,
    /// Command text.
    pub command: String,
    /// State before.
    pub from: TddState,
    /// State after.
    pub to: TddState,
    /// Sequence number of the history record.
    pub sequence: u64,
}

/// Result of a workflow request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Transition committed.
    Allowed(T),
    /// Transition refused; nothing changed.
    Denied(Denial),
}

impl<T> Outcome<T> {
    /// Check if the request was allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// Check if the request was denied.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    /// The committed transition, if allowed.
    pub fn allowed(self) -> Option<T> {
        match self {
            Self::Allowed(value) => Some(value),
            Self::Denied(_) => None,
        }
    }

    /// The denial, if denied.
    pub fn denial(self) -> Option<Denial> {
        match self {
            Self::Allowed(_) => None,
            Self::Denied(denial) => Some(denial),
        }
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> Result<T, Denial> {
        match self {
            Self::Allowed(value) => Ok(value),
            Self::Denied(denial) => Err(denial),
        }
    }

    /// Map the allowed value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Allowed(value) => Outcome::Allowed(f(value)),
            Self::Denied(denial) => Outcome::Denied(denial),
        }
    }
}

/// Outcome of a workflow command or trigger.
pub type WorkflowOutcome = Outcome<WorkflowTransition>;

/// Outcome of a TDD command.
pub type TddOutcome = Outcome<TddTransition>;
