//! Per-story TDD state machine.
//!
//! Happy path: DESIGN → TEST_RED → CODE_GREEN → REFACTOR → COMMIT → DONE.
//! Three backward edges carry quality feedback, PAUSED wraps any working
//! state, and DONE is terminal. There are no context guards at this level:
//! a command is refused only if it is illegal from the current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::TddAction;
use crate::outcome::{Denial, DenialCode, GuardViolation};
use crate::state::TddState;

/// Who paused a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseOrigin {
    /// Paused with `/tdd pause`.
    Manual,
    /// Paused as part of a sprint pause.
    Sprint,
}

/// Where a legal action leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// State unchanged.
    Same,
    /// Move to this state.
    To(TddState),
    /// Restore the paused-from state.
    Prior,
}

/// The static TDD command → state table.
fn rule(action: TddAction, state: TddState) -> Option<Target> {
    use TddAction as A;
    use TddState as S;

    let working = TddState::WORKING.contains(&state);
    match (action, state) {
        (A::Status, _) => Some(Target::Same),
        (A::Start, _) if working => Some(Target::To(S::Design)),
        (A::DesignComplete, S::Design) => Some(Target::To(S::TestRed)),
        (A::TestsReady, S::TestRed) => Some(Target::To(S::CodeGreen)),
        (A::CodeGreen, S::CodeGreen) => Some(Target::To(S::Refactor)),
        (A::RefactorDone, S::Refactor) => Some(Target::To(S::Commit)),
        (A::Commit, S::Commit) => Some(Target::To(S::Done)),
        (A::TestsBroken, S::Refactor) => Some(Target::To(S::CodeGreen)),
        (A::NeedMoreTests, S::CodeGreen) => Some(Target::To(S::TestRed)),
        (A::RequirementsUnclear, S::TestRed) => Some(Target::To(S::Design)),
        (A::ReviewCycle, _) if working => Some(Target::Same),
        (A::SkipPhase, _) if working => state.next_forward().map(Target::To),
        (A::Pause, _) if working => Some(Target::To(S::Paused)),
        (A::Resume, S::Paused) => Some(Target::Prior),
        _ => None,
    }
}

/// States in which `action` is legal.
pub fn legal_states(action: TddAction) -> Vec<TddState> {
    TddState::ALL
        .into_iter()
        .filter(|state| rule(action, *state).is_some())
        .collect()
}

/// Actions legal from `state`, excluding `/tdd status`.
pub fn legal_actions(state: TddState) -> Vec<TddAction> {
    TddAction::ALL
        .into_iter()
        .filter(|action| !action.is_read_only() && rule(*action, state).is_some())
        .collect()
}

/// A TDD cycle for one story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TddCycle {
    /// Story identifier.
    pub story_id: String,
    /// Cycle identifier, fixed at creation.
    pub cycle_id: Uuid,
    /// Current state.
    pub state: TddState,
    /// State to restore on resume; set exactly when `state` is PAUSED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<TddState>,
    /// Who paused the cycle; set exactly when `state` is PAUSED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_origin: Option<PauseOrigin>,
    /// Set by `/tdd review_cycle`, cleared by the next state change.
    #[serde(default)]
    pub review_requested: bool,
    /// When the cycle was created.
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TddStatus {
    /// Story identifier.
    pub story_id: String,
    /// Cycle identifier.
    pub cycle_id: Uuid,
    /// Current state.
    pub state: TddState,
    /// Paused-from state, when paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<TddState>,
    /// Whether a human review was requested.
    pub review_requested: bool,
}

/// A state change applied to a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TddStep {
    /// Action that caused the change.
    pub action: TddAction,
    /// State before.
    pub from: TddState,
    /// State after.
    pub to: TddState,
}

impl TddCycle {
    /// Create a cycle at DESIGN with a fresh cycle id.
    pub fn new(story_id: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            cycle_id: Uuid::new_v4(),
            state: TddState::Design,
            paused_from: None,
            pause_origin: None,
            review_requested: false,
            created_at: Utc::now(),
        }
    }

    /// Current state plus paused-from.
    pub fn status(&self) -> TddStatus {
        TddStatus {
            story_id: self.story_id.clone(),
            cycle_id: self.cycle_id,
            state: self.state,
            paused_from: self.paused_from,
            review_requested: self.review_requested,
        }
    }

    /// Check if the cycle reached DONE.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check if the cycle is paused.
    pub fn is_paused(&self) -> bool {
        self.state == TddState::Paused
    }

    /// Apply a TDD action.
    ///
    /// `note` is the free text after the story id; `/tdd skip_phase` refuses
    /// to run without it.
    pub fn transition(&mut self, action: TddAction, note: Option<&str>) -> Result<TddStep, Denial> {
        self.apply(action, note, PauseOrigin::Manual)
    }

    /// Pause on behalf of `origin`.
    pub fn pause(&mut self, origin: PauseOrigin) -> Result<TddStep, Denial> {
        self.apply(TddAction::Pause, None, origin)
    }

    /// Resume to the paused-from state.
    pub fn resume(&mut self) -> Result<TddStep, Denial> {
        self.apply(TddAction::Resume, None, PauseOrigin::Manual)
    }

    /// Whether `action` is legal from the current state.
    pub fn permits(&self, action: TddAction) -> bool {
        rule(action, self.state).is_some()
    }

    fn apply(
        &mut self,
        action: TddAction,
        note: Option<&str>,
        origin: PauseOrigin,
    ) -> Result<TddStep, Denial> {
        let command = self.command_text(action);
        let Some(target) = rule(action, self.state) else {
            return Err(self.invalid_state(action, command));
        };

        if action == TddAction::SkipPhase && note.is_none_or(|n| n.trim().is_empty()) {
            return Err(Denial::guard(
                self.state,
                command,
                GuardViolation::MissingReason,
                format!("Give a reason: /tdd skip_phase {} <reason>", self.story_id),
            ));
        }

        let from = self.state;
        let to = match target {
            Target::Same => from,
            Target::To(state) => state,
            // `paused_from` is always set while PAUSED.
            Target::Prior => self.paused_from.unwrap_or(TddState::Design),
        };

        match action {
            TddAction::Pause => {
                self.paused_from = Some(from);
                self.pause_origin = Some(origin);
            }
            TddAction::Resume => {
                self.paused_from = None;
                self.pause_origin = None;
            }
            TddAction::ReviewCycle => self.review_requested = true,
            _ => {}
        }
        if to != from && !matches!(action, TddAction::Pause | TddAction::Resume) {
            self.review_requested = false;
        }
        self.state = to;

        Ok(TddStep { action, from, to })
    }

    fn command_text(&self, action: TddAction) -> String {
        format!("{} {}", action.name(), self.story_id)
    }

    fn invalid_state(&self, action: TddAction, command: String) -> Denial {
        let allowed_in = legal_states(action);
        let reason = if self.is_terminal() {
            format!("cycle for {} is DONE; no further transitions", self.story_id)
        } else {
            format!("'{}' is not legal in {}", action.name(), self.state)
        };
        Denial::new(
            DenialCode::InvalidState,
            self.state,
            command,
            reason,
            self.hint(),
        )
        .with_allowed_in(allowed_in)
    }

    fn hint(&self) -> String {
        let actions = legal_actions(self.state);
        if actions.is_empty() {
            return format!("Check progress: /tdd status {}", self.story_id);
        }
        let suggestions: Vec<String> = actions
            .iter()
            .map(|action| format!("{} {}", action.name(), self.story_id))
            .collect();
        format!("Try: {}", suggestions.join(", "))
    }
}
