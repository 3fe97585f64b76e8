//! Guard evaluation for the workflow machine.
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. the command is recognized,
//! 2. it is legal from the current state,
//! 3. context and registry guards for the target state hold.
//!
//! Everything here is a pure function of its arguments.

use std::fmt;

use crate::command::{legal_commands, Command, TddAction, TddCommand, WorkflowCommand};
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::outcome::{Denial, DenialCode, GuardViolation};
use crate::registry::{CycleRegistry, RegistrySummary};
use crate::state::WorkflowState;

/// A transition the engine fires on its own observation rather than on a
/// typed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Every cycle in the sprint reached DONE.
    AllTasksDone,
    /// CI failed repeatedly for one story's task.
    CiFailures {
        /// Story whose task keeps failing.
        story_id: String,
        /// Consecutive failures reported by CI.
        consecutive: u32,
    },
}

impl Trigger {
    /// State the trigger moves the workflow to.
    pub fn target(&self) -> WorkflowState {
        match self {
            Self::AllTasksDone => WorkflowState::SprintReview,
            Self::CiFailures { .. } => WorkflowState::Blocked,
        }
    }

    /// States the trigger can fire in.
    pub fn legal_in(&self) -> &'static [WorkflowState] {
        match self {
            Self::AllTasksDone | Self::CiFailures { .. } => &[WorkflowState::SprintActive],
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllTasksDone => write!(f, "all tasks done"),
            Self::CiFailures {
                story_id,
                consecutive,
            } => write!(f, "ci failures {story_id} x{consecutive}"),
        }
    }
}

/// Decides whether a request may proceed.
#[derive(Debug, Clone)]
pub struct GuardEvaluator {
    ci_failure_threshold: u32,
}

impl Default for GuardEvaluator {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl GuardEvaluator {
    /// Create an evaluator from engine configuration.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ci_failure_threshold: config.ci_failure_threshold,
        }
    }

    /// Evaluate any parsed command routed to the workflow level.
    ///
    /// Returns the target workflow state. TDD commands never change the
    /// workflow state; they are only checked for routing legality here.
    pub fn evaluate(
        &self,
        state: WorkflowState,
        command: &Command,
        context: &CommandContext,
        summary: &RegistrySummary,
    ) -> Result<WorkflowState, Denial> {
        match command {
            Command::Unknown(text) => Err(unknown_command(state, text)),
            Command::Workflow(cmd) => self.evaluate_workflow(state, cmd, context, summary),
            Command::Tdd(cmd) => check_tdd_routing(state, cmd).map(|()| state),
        }
    }

    /// Evaluate a workflow command with every guard.
    pub fn evaluate_workflow(
        &self,
        state: WorkflowState,
        command: &WorkflowCommand,
        context: &CommandContext,
        summary: &RegistrySummary,
    ) -> Result<WorkflowState, Denial> {
        let target = check_table(state, command)?;
        check_story_ids(state, command)?;
        check_context(state, target, &command.to_string(), context, summary)?;
        Ok(target)
    }

    /// Evaluate a workflow command without the context and registry guards.
    ///
    /// Recognition and state legality still apply: forcing never makes an
    /// illegal command legal.
    pub fn evaluate_unguarded(
        &self,
        state: WorkflowState,
        command: &WorkflowCommand,
    ) -> Result<WorkflowState, Denial> {
        let target = check_table(state, command)?;
        check_story_ids(state, command)?;
        Ok(target)
    }

    /// Evaluate an implicit trigger.
    pub fn evaluate_trigger(
        &self,
        state: WorkflowState,
        trigger: &Trigger,
        context: &CommandContext,
        summary: &RegistrySummary,
    ) -> Result<WorkflowState, Denial> {
        let command = trigger.to_string();
        if !trigger.legal_in().contains(&state) {
            return Err(invalid_state(state, &command, trigger.legal_in()));
        }

        if let Trigger::CiFailures {
            story_id,
            consecutive,
        } = trigger
        {
            if !summary.ids.contains(story_id) {
                return Err(Denial::new(
                    DenialCode::CycleNotFound,
                    state,
                    command,
                    format!("no live cycle for story {story_id}"),
                    "Check live cycles: /tdd status",
                ));
            }
            if *consecutive < self.ci_failure_threshold {
                return Err(Denial::guard(
                    state,
                    command,
                    GuardViolation::CiThresholdNotReached {
                        consecutive: *consecutive,
                        threshold: self.ci_failure_threshold,
                    },
                    format!(
                        "Retry the task; blocking needs {} failures",
                        self.ci_failure_threshold
                    ),
                ));
            }
        }

        let target = trigger.target();
        check_context(state, target, &command, context, summary)?;
        Ok(target)
    }

    /// Check a forced move to `target`.
    ///
    /// Only structural rules apply: a reason is mandatory and BLOCKED keeps
    /// its adjacency to SPRINT_ACTIVE.
    pub fn evaluate_force(
        &self,
        state: WorkflowState,
        target: WorkflowState,
        reason: &str,
    ) -> Result<WorkflowState, Denial> {
        let command = force_command(target);
        check_reason(state, &command, reason)?;
        if !state.respects_blocked_adjacency(target) {
            let allowed: Vec<WorkflowState> = WorkflowState::ALL
                .into_iter()
                .filter(|from| from.respects_blocked_adjacency(target))
                .collect();
            return Err(Denial::new(
                DenialCode::InvalidState,
                state,
                command,
                format!(
                    "cannot force {state} → {target}: BLOCKED connects only to SPRINT_ACTIVE"
                ),
                hint(state),
            )
            .with_allowed_in(allowed));
        }
        Ok(target)
    }
}

/// Command text recorded for a forced move.
pub fn force_command(target: WorkflowState) -> String {
    format!("force {target}")
}

/// Deny a forced request that lacks a reason.
pub fn check_reason(state: WorkflowState, command: &str, reason: &str) -> Result<(), Denial> {
    if reason.trim().is_empty() {
        return Err(Denial::guard(
            state,
            command,
            GuardViolation::MissingReason,
            "Forced transitions need a reason",
        ));
    }
    Ok(())
}

/// Mutating TDD commands run only while the sprint is active.
pub fn check_tdd_routing(state: WorkflowState, command: &TddCommand) -> Result<(), Denial> {
    if command.action.is_read_only() || state == WorkflowState::SprintActive {
        return Ok(());
    }
    let reason = format!("'{}' needs an active sprint; workflow is {state}", command.action.name());
    let mut denial = Denial::new(
        DenialCode::InvalidState,
        state,
        command.to_string(),
        reason,
        hint(state),
    )
    .with_allowed_in([WorkflowState::SprintActive]);
    if command.action == TddAction::Resume && state == WorkflowState::SprintPaused {
        denial.hint = "Resume the sprint first: /sprint resume".to_string();
    }
    Err(denial)
}

/// Suggest legal next commands from `state`.
pub fn hint(state: WorkflowState) -> String {
    let commands: Vec<&str> = legal_commands(state)
        .into_iter()
        .filter(|name| !name.starts_with("/backlog") && *name != "/state")
        .collect();
    if commands.is_empty() {
        return "Try: /state".to_string();
    }
    format!("Try: {}", commands.join(", "))
}

/// Denial for input that names no command.
pub fn unknown_command(state: WorkflowState, text: &str) -> Denial {
    Denial::new(
        DenialCode::UnknownCommand,
        state,
        text,
        format!("unknown command: {text}"),
        hint(state),
    )
}

fn invalid_state(state: WorkflowState, command: &str, legal_in: &[WorkflowState]) -> Denial {
    let allowed: Vec<String> = legal_in.iter().map(ToString::to_string).collect();
    Denial::new(
        DenialCode::InvalidState,
        state,
        command,
        format!("'{command}' is not legal in {state}; allowed in {}", allowed.join(", ")),
        hint(state),
    )
    .with_allowed_in(legal_in.iter().copied())
}

fn check_table(state: WorkflowState, command: &WorkflowCommand) -> Result<WorkflowState, Denial> {
    let info = command.info();
    if !info.is_legal_in(state) {
        return Err(invalid_state(state, &command.to_string(), info.legal_in));
    }
    Ok(info.target.unwrap_or(state))
}

fn check_story_ids(state: WorkflowState, command: &WorkflowCommand) -> Result<(), Denial> {
    let WorkflowCommand::SprintPlan(ids) = command else {
        return Ok(());
    };
    for story_id in ids {
        if CycleRegistry::validate_story_id(story_id).is_err() {
            return Err(Denial::guard(
                state,
                command.to_string(),
                GuardViolation::InvalidStoryId {
                    story_id: story_id.clone(),
                },
                "Story ids are letters, digits, '.', '_' or '-'",
            ));
        }
    }
    Ok(())
}

fn check_context(
    state: WorkflowState,
    target: WorkflowState,
    command: &str,
    context: &CommandContext,
    summary: &RegistrySummary,
) -> Result<(), Denial> {
    if target == state {
        return Ok(());
    }

    if target == WorkflowState::SprintActive {
        // CI before working-tree cleanliness when both fail.
        if context.ci_failing() {
            return Err(Denial::guard(
                state,
                command,
                GuardViolation::CiFailing,
                format!("Fix CI, then retry {command}"),
            ));
        }
        if context.has_uncommitted_changes() {
            return Err(Denial::guard(
                state,
                command,
                GuardViolation::UncommittedChanges,
                format!("Commit or stash changes, then retry {command}"),
            ));
        }
    }

    if target.requires_quiescent_registry() && !summary.all_terminal {
        return Err(Denial::guard(
            state,
            command,
            GuardViolation::ActiveCycles {
                stories: summary.active.clone(),
            },
            "Finish the remaining cycles; check them with /tdd status",
        ));
    }

    Ok(())
}
