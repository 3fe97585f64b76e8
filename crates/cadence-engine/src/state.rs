//! State definitions for the workflow and TDD machines.
//!
//! Both enums serialize as SCREAMING_SNAKE_CASE strings (`"SPRINT_ACTIVE"`,
//! `"TEST_RED"`), which is also their `Display` form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Primary workflow state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// No epic defined yet.
    #[default]
    Idle,
    /// Epic decomposed, backlog awaiting planning.
    BacklogReady,
    /// Sprint scope chosen, not yet started.
    SprintPlanned,
    /// Sprint executing; one TDD cycle per story in scope.
    SprintActive,
    /// Sprint paused by a human.
    SprintPaused,
    /// Sprint finished, awaiting review feedback.
    SprintReview,
    /// Sprint halted on a failing task.
    Blocked,
}

impl WorkflowState {
    /// Every workflow state, in lifecycle order.
    pub const ALL: [WorkflowState; 7] = [
        Self::Idle,
        Self::BacklogReady,
        Self::SprintPlanned,
        Self::SprintActive,
        Self::SprintPaused,
        Self::SprintReview,
        Self::Blocked,
    ];

    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::BacklogReady => "BACKLOG_READY",
            Self::SprintPlanned => "SPRINT_PLANNED",
            Self::SprintActive => "SPRINT_ACTIVE",
            Self::SprintPaused => "SPRINT_PAUSED",
            Self::SprintReview => "SPRINT_REVIEW",
            Self::Blocked => "BLOCKED",
        }
    }

    /// Whether entering this state requires every TDD cycle to be terminal.
    pub fn requires_quiescent_registry(self) -> bool {
        matches!(self, Self::SprintReview | Self::Idle)
    }

    /// Whether a direct move from `self` to `target` respects the BLOCKED
    /// adjacency rule: BLOCKED is entered only from SPRINT_ACTIVE and left
    /// only for SPRINT_ACTIVE.
    pub fn respects_blocked_adjacency(self, target: WorkflowState) -> bool {
        match (self, target) {
            (Self::Blocked, Self::Blocked) => true,
            (Self::Blocked, other) => other == Self::SprintActive,
            (from, Self::Blocked) => from == Self::SprintActive,
            _ => true,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| UnknownStateError(s.trim().to_string()))
    }
}

/// State of a single story's TDD cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TddState {
    /// Shaping the design and acceptance criteria.
    #[default]
    Design,
    /// Writing tests that fail.
    TestRed,
    /// Writing code until the tests pass.
    CodeGreen,
    /// Cleaning up with the tests kept green.
    Refactor,
    /// Committing the finished work.
    Commit,
    /// Suspended; the cycle remembers the state it paused from.
    Paused,
    /// Cycle complete. Terminal.
    Done,
}

impl TddState {
    /// Every TDD state.
    pub const ALL: [TddState; 7] = [
        Self::Design,
        Self::TestRed,
        Self::CodeGreen,
        Self::Refactor,
        Self::Commit,
        Self::Paused,
        Self::Done,
    ];

    /// States a cycle can actively work in (neither paused nor done).
    pub const WORKING: [TddState; 5] = [
        Self::Design,
        Self::TestRed,
        Self::CodeGreen,
        Self::Refactor,
        Self::Commit,
    ];

    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Design => "DESIGN",
            Self::TestRed => "TEST_RED",
            Self::CodeGreen => "CODE_GREEN",
            Self::Refactor => "REFACTOR",
            Self::Commit => "COMMIT",
            Self::Paused => "PAUSED",
            Self::Done => "DONE",
        }
    }

    /// Next state on the happy path. `None` for `Paused` and `Done`.
    pub fn next_forward(self) -> Option<TddState> {
        match self {
            Self::Design => Some(Self::TestRed),
            Self::TestRed => Some(Self::CodeGreen),
            Self::CodeGreen => Some(Self::Refactor),
            Self::Refactor => Some(Self::Commit),
            Self::Commit => Some(Self::Done),
            Self::Paused | Self::Done => None,
        }
    }

    /// Check if this is the terminal state.
    pub fn is_terminal(self) -> bool {
        self == Self::Done
    }
}

impl fmt::Display for TddState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TddState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| UnknownStateError(s.trim().to_string()))
    }
}

/// Kind of agent that does the work of a TDD state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Design and specification work.
    Design,
    /// Test authoring.
    Qa,
    /// Implementation, refactoring and commits.
    Code,
}

impl AgentType {
    /// The agent responsible for work in `state`, if any.
    pub fn for_state(state: TddState) -> Option<AgentType> {
        match state {
            TddState::Design => Some(Self::Design),
            TddState::TestRed => Some(Self::Qa),
            TddState::CodeGreen | TddState::Refactor | TddState::Commit => Some(Self::Code),
            TddState::Paused | TddState::Done => None,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Design => write!(f, "design"),
            Self::Qa => write!(f, "qa"),
            Self::Code => write!(f, "code"),
        }
    }
}

/// A state of either machine.
///
/// Serializes as the bare state name; workflow and TDD names are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateRef {
    /// Workflow machine state.
    Workflow(WorkflowState),
    /// TDD machine state.
    Tdd(TddState),
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow(state) => fmt::Display::fmt(state, f),
            Self::Tdd(state) => fmt::Display::fmt(state, f),
        }
    }
}

impl StateRef {
    /// The workflow state, if this is one.
    pub fn as_workflow(self) -> Option<WorkflowState> {
        match self {
            Self::Workflow(state) => Some(state),
            Self::Tdd(_) => None,
        }
    }

    /// The TDD state, if this is one.
    pub fn as_tdd(self) -> Option<TddState> {
        match self {
            Self::Tdd(state) => Some(state),
            Self::Workflow(_) => None,
        }
    }
}

impl From<WorkflowState> for StateRef {
    fn from(state: WorkflowState) -> Self {
        Self::Workflow(state)
    }
}

impl From<TddState> for StateRef {
    fn from(state: TddState) -> Self {
        Self::Tdd(state)
    }
}

/// A state name that matches no known state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown state: {0}")]
pub struct UnknownStateError(pub String);
