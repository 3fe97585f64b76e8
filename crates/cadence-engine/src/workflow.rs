//! Workflow instance: one project's primary machine, its cycle registry and
//! its transition history.
//!
//! # Commit protocol
//!
//! Every workflow request runs under the instance's write lock:
//!
//! 1. guards decide; a denial is recorded and returned,
//! 2. registry effects are applied (cycle creation, aborts, pause fan-out),
//! 3. the history records are appended as one batch and one event per
//!    committed record is emitted, under the history lock,
//! 4. the new primary state is stored.
//!
//! A storage fault in step 3 undoes step 2 and propagates as `Err`; nothing
//! is committed or emitted.
//!
//! TDD commands hold the instance lock in shared mode plus the one cycle's
//! mutex, so commands for different stories run concurrently while the
//! primary state cannot change underneath them.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::{parse_command, Command, TddAction, TddCommand, WorkflowCommand};
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::events::{EventEmitter, NullEmitter, TransitionEvent};
use crate::guard::{
    check_reason, check_tdd_routing, force_command, hint, unknown_command, GuardEvaluator, Trigger,
};
use crate::history::{
    Journal, PendingRecord, RecoveryReport, Subject, TransitionHistory, TransitionRecord,
};
use crate::outcome::{
    Denial, DenialCode, GuardViolation, Outcome, TddOutcome, TddTransition, WorkflowOutcome,
    WorkflowTransition,
};
use crate::persistence::{Snapshot, StorageError, CURRENT_SCHEMA_VERSION};
use crate::registry::{CycleRegistry, RegistryError, RegistrySummary};
use crate::state::{StateRef, TddState, WorkflowState};
use crate::tdd::{PauseOrigin, TddCycle, TddStatus};

/// What a command routed through [`WorkflowInstance::apply`] produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    /// A workflow command committed (or was answered, for queries).
    Workflow(WorkflowTransition),
    /// A TDD command committed.
    Tdd(TddTransition),
    /// Answer to `/tdd status`.
    Cycles(Vec<TddStatus>),
}

/// Outcome of [`WorkflowInstance::apply`].
pub type ApplyOutcome = Outcome<Applied>;

#[derive(Debug, Clone, Default)]
struct Primary {
    state: WorkflowState,
    planned_scope: Vec<String>,
    blocked_story: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanOut {
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum Abort {
    #[default]
    Nothing,
    Story(String),
    All,
}

/// Side effects of a transition beyond the state change.
#[derive(Debug, Default)]
struct Effects {
    scope: Option<Vec<String>>,
    blocked: Option<Option<String>>,
    register: Vec<String>,
    abort: Abort,
    fan_out: Option<FanOut>,
}

struct Plan<'a> {
    command: String,
    from: WorkflowState,
    to: WorkflowState,
    context: &'a CommandContext,
    reason: String,
    forced: bool,
    effects: Effects,
}

/// The workflow of one project.
pub struct WorkflowInstance {
    project: String,
    config: EngineConfig,
    guards: GuardEvaluator,
    primary: RwLock<Primary>,
    registry: CycleRegistry,
    history: Mutex<TransitionHistory>,
    emitter: Arc<dyn EventEmitter>,
}

impl fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("project", &self.project)
            .field("state", &self.state())
            .field("cycles", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowInstance {
    /// Create an instance in IDLE.
    pub fn new(
        project: impl Into<String>,
        config: EngineConfig,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self::from_parts(
            project.into(),
            config,
            emitter,
            Primary::default(),
            TransitionHistory::new(),
        )
    }

    /// Create an instance with default configuration that emits nothing.
    pub fn with_defaults(project: impl Into<String>) -> Self {
        Self::new(project, EngineConfig::default(), Arc::new(NullEmitter))
    }

    fn from_parts(
        project: String,
        config: EngineConfig,
        emitter: Arc<dyn EventEmitter>,
        primary: Primary,
        history: TransitionHistory,
    ) -> Self {
        Self {
            project,
            guards: GuardEvaluator::new(&config),
            config,
            primary: RwLock::new(primary),
            registry: CycleRegistry::new(),
            history: Mutex::new(history),
            emitter,
        }
    }

    /// Project id.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current workflow state.
    pub fn state(&self) -> WorkflowState {
        self.read_primary().state
    }

    /// Stories planned for the current sprint.
    pub fn planned_scope(&self) -> Vec<String> {
        self.read_primary().planned_scope.clone()
    }

    /// Story that blocked the sprint, while BLOCKED.
    pub fn blocked_story(&self) -> Option<String> {
        self.read_primary().blocked_story.clone()
    }

    /// The live cycle registry.
    pub fn registry(&self) -> &CycleRegistry {
        &self.registry
    }

    /// Aggregate facts about live cycles.
    pub fn summary(&self) -> RegistrySummary {
        self.registry.summary()
    }

    /// Every history record, oldest first.
    pub fn records(&self) -> Vec<TransitionRecord> {
        self.lock_history().records().to_vec()
    }

    /// The last `limit` records, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<TransitionRecord> {
        self.lock_history().recent(limit)
    }

    /// Send every future history record to `journal` as well.
    pub fn set_journal(&self, journal: Box<dyn Journal>) {
        self.lock_history().set_journal(journal);
    }

    /// Current state, recent transitions and recovery suggestions.
    pub fn recovery_report(&self) -> RecoveryReport {
        let primary = self.read_primary();
        let history = self.lock_history();
        RecoveryReport::build(
            primary.state,
            &history,
            self.config.recent_transitions_limit,
            self.config.recovery_options_limit,
        )
    }

    /// Parse and apply a command.
    pub fn apply(
        &self,
        input: &str,
        context: &CommandContext,
    ) -> Result<ApplyOutcome, StorageError> {
        match parse_command(input) {
            Command::Unknown(text) => Ok(Outcome::Denied(self.deny_unknown(&text, context)?)),
            Command::Workflow(cmd) => Ok(self.workflow(&cmd, context)?.map(Applied::Workflow)),
            Command::Tdd(cmd) => self.tdd(&cmd, context),
        }
    }

    /// Parse and apply a workflow command with context guards bypassed.
    ///
    /// The command must still be recognized and legal in the current state.
    pub fn apply_forced(
        &self,
        input: &str,
        context: &CommandContext,
        reason: &str,
    ) -> Result<ApplyOutcome, StorageError> {
        let cmd = match parse_command(input) {
            Command::Unknown(text) => {
                return Ok(Outcome::Denied(self.deny_unknown(&text, context)?));
            }
            Command::Tdd(cmd) => {
                let primary = self.write_primary();
                let denial = Denial::new(
                    DenialCode::InvalidState,
                    primary.state,
                    cmd.to_string(),
                    "TDD commands cannot be forced",
                    hint(primary.state),
                );
                self.record_denial(
                    Subject::Workflow,
                    primary.state.into(),
                    &cmd.to_string(),
                    context,
                    &denial,
                )?;
                return Ok(Outcome::Denied(denial));
            }
            Command::Workflow(cmd) => cmd,
        };

        let mut primary = self.write_primary();
        let from = primary.state;
        let command = cmd.to_string();
        let checked = check_reason(from, &command, reason)
            .and_then(|()| self.guards.evaluate_unguarded(from, &cmd));
        let to = match checked {
            Ok(to) => to,
            Err(denial) => {
                return self
                    .deny_workflow(from, &command, context, denial)
                    .map(Outcome::Denied);
            }
        };
        if cmd.is_query() {
            return Ok(Outcome::Allowed(Applied::Workflow(query_transition(command, from))));
        }

        let mut effects = self.command_effects(&primary, &cmd);
        if to != from && to.requires_quiescent_registry() {
            effects.abort = Abort::All;
        }
        let plan = Plan {
            command,
            from,
            to,
            context,
            reason: reason.trim().to_string(),
            forced: true,
            effects,
        };
        let outcome = self.commit(&mut primary, plan)?;
        Ok(outcome.map(Applied::Workflow))
    }

    /// Apply a workflow command.
    pub fn workflow(
        &self,
        cmd: &WorkflowCommand,
        context: &CommandContext,
    ) -> Result<WorkflowOutcome, StorageError> {
        let mut primary = self.write_primary();
        let from = primary.state;
        let command = cmd.to_string();
        let summary = self.registry.summary();

        let to = match self.guards.evaluate_workflow(from, cmd, context, &summary) {
            Ok(to) => to,
            Err(denial) => {
                return self
                    .deny_workflow(from, &command, context, denial)
                    .map(Outcome::Denied);
            }
        };
        if cmd.is_query() {
            return Ok(Outcome::Allowed(query_transition(command, from)));
        }

        let plan = Plan {
            command,
            from,
            to,
            context,
            reason: command_reason(cmd),
            forced: false,
            effects: self.command_effects(&primary, cmd),
        };
        let outcome = self.commit(&mut primary, plan)?;
        drop(primary);

        if let Outcome::Allowed(transition) = &outcome {
            if !transition.cycles_retired.is_empty() {
                self.auto_review(context)?;
            }
        }
        Ok(outcome)
    }

    /// Force the workflow into `target`, bypassing context and registry
    /// guards.
    ///
    /// Entering SPRINT_REVIEW or IDLE this way aborts every live cycle.
    pub fn force(
        &self,
        target: WorkflowState,
        reason: &str,
    ) -> Result<WorkflowOutcome, StorageError> {
        let context = CommandContext::new();
        let mut primary = self.write_primary();
        let from = primary.state;
        let command = force_command(target);

        if let Err(denial) = self.guards.evaluate_force(from, target, reason) {
            return self.deny_workflow(from, &command, &context, denial).map(Outcome::Denied);
        }

        let plan = Plan {
            command,
            from,
            to: target,
            context: &context,
            reason: reason.trim().to_string(),
            forced: true,
            effects: self.forced_effects(&primary, from, target),
        };
        self.commit(&mut primary, plan)
    }

    /// Force by state name; an unknown name is denied.
    pub fn force_by_name(
        &self,
        target: &str,
        reason: &str,
    ) -> Result<WorkflowOutcome, StorageError> {
        match target.parse::<WorkflowState>() {
            Ok(state) => self.force(state, reason),
            Err(err) => {
                let primary = self.write_primary();
                let command = format!("force {}", target.trim());
                let denial = Denial::new(
                    DenialCode::InvalidState,
                    primary.state,
                    command.clone(),
                    err.to_string(),
                    "Force to one of the listed states",
                )
                .with_allowed_in(WorkflowState::ALL);
                self.deny_workflow(primary.state, &command, &CommandContext::new(), denial)
                    .map(Outcome::Denied)
            }
        }
    }

    /// Fire an implicit trigger.
    pub fn fire(
        &self,
        trigger: &Trigger,
        context: &CommandContext,
    ) -> Result<WorkflowOutcome, StorageError> {
        let mut primary = self.write_primary();
        let from = primary.state;
        let command = trigger.to_string();
        let summary = self.registry.summary();

        let to = match self.guards.evaluate_trigger(from, trigger, context, &summary) {
            Ok(to) => to,
            Err(denial) => {
                return self
                    .deny_workflow(from, &command, context, denial)
                    .map(Outcome::Denied);
            }
        };

        let mut effects = Effects::default();
        let reason = match trigger {
            Trigger::AllTasksDone => "every cycle is DONE".to_string(),
            Trigger::CiFailures {
                story_id,
                consecutive,
            } => {
                effects.blocked = Some(Some(story_id.clone()));
                format!("{consecutive} consecutive CI failures on {story_id}")
            }
        };
        let plan = Plan {
            command,
            from,
            to,
            context,
            reason,
            forced: false,
            effects,
        };
        self.commit(&mut primary, plan)
    }

    /// Apply a TDD command.
    pub fn tdd(
        &self,
        cmd: &TddCommand,
        context: &CommandContext,
    ) -> Result<ApplyOutcome, StorageError> {
        let primary = self.read_primary();
        let state = primary.state;
        let command = cmd.to_string();

        if cmd.action.is_read_only() {
            return self.tdd_status(state, cmd, &command, context);
        }
        if let Err(denial) = check_tdd_routing(state, cmd) {
            let subject = story_subject(cmd.story_id.as_deref());
            self.record_denial(subject, state.into(), &command, context, &denial)?;
            return Ok(Outcome::Denied(denial));
        }
        let Some(story_id) = cmd.story_id.as_deref() else {
            let denial = Denial::new(
                DenialCode::CycleNotFound,
                state,
                command.clone(),
                format!("'{}' needs a story id", cmd.action.name()),
                format!("Try: {} <STORY-ID>", cmd.action.name()),
            );
            self.record_denial(Subject::Workflow, state.into(), &command, context, &denial)?;
            return Ok(Outcome::Denied(denial));
        };

        // `None` means another caller registered the story first; restart theirs.
        if cmd.action == TddAction::Start && !self.registry.contains(story_id) {
            if let Some(outcome) = self.start_cycle(state, story_id, &command, context)? {
                return Ok(outcome.map(Applied::Tdd));
            }
        }

        let stepped = self
            .registry
            .with_cycle(story_id, |cycle| self.step_cycle(cycle, cmd, &command, context));
        let (outcome, completed) = match stepped {
            Ok(result) => result?,
            Err(err) => {
                let denial = registry_denial(state, &command, &err);
                self.record_denial(
                    story_subject(Some(story_id)),
                    state.into(),
                    &command,
                    context,
                    &denial,
                )?;
                return Ok(Outcome::Denied(denial));
            }
        };

        if completed {
            if self.registry.unregister(story_id).is_ok() {
                info!(project = %self.project, story_id, "Retired completed TDD cycle");
            }
            drop(primary);
            self.auto_review(context)?;
        }
        Ok(outcome.map(Applied::Tdd))
    }

    /// Abort a story's cycle and remove it from the registry.
    pub fn abort(&self, story_id: &str, reason: &str) -> Result<Outcome<TddCycle>, StorageError> {
        let context = CommandContext::new();
        let primary = self.read_primary();
        let state = primary.state;
        let command = format!("abort {story_id}");

        if let Err(denial) = check_reason(state, &command, reason) {
            self.record_denial(
                story_subject(Some(story_id)),
                state.into(),
                &command,
                &context,
                &denial,
            )?;
            return Ok(Outcome::Denied(denial));
        }
        let cycle = match self.registry.unregister(story_id) {
            Ok(cycle) => cycle,
            Err(err) => {
                let denial = registry_denial(state, &command, &err);
                self.record_denial(
                    story_subject(Some(story_id)),
                    state.into(),
                    &command,
                    &context,
                    &denial,
                )?;
                return Ok(Outcome::Denied(denial));
            }
        };

        let pending = abort_record(&cycle, &command, reason.trim(), &context);
        if let Err(err) = self.append(vec![pending]) {
            self.reinsert(vec![cycle]);
            return Err(err);
        }
        info!(project = %self.project, story_id, "Aborted TDD cycle");
        drop(primary);
        self.auto_review(&context)?;
        Ok(Outcome::Allowed(cycle))
    }

    /// Capture the instance for persistence.
    pub fn snapshot(&self) -> Snapshot {
        // Exclusive access keeps cycles and history consistent.
        let primary = self.write_primary();
        let cycles = self.registry.cycles();
        let history = self.lock_history().records().to_vec();
        Snapshot {
            schema_version: CURRENT_SCHEMA_VERSION,
            project: self.project.clone(),
            state: primary.state,
            planned_scope: primary.planned_scope.clone(),
            blocked_story: primary.blocked_story.clone(),
            cycles,
            history,
        }
    }

    /// Rebuild an instance from a snapshot.
    ///
    /// The history chain is verified and every cycle checked; any
    /// inconsistency is a storage fault.
    pub fn restore(
        snapshot: Snapshot,
        config: EngineConfig,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<Self, StorageError> {
        if snapshot.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchema(
                snapshot.schema_version,
                CURRENT_SCHEMA_VERSION,
            ));
        }
        if snapshot.project.trim().is_empty() {
            return Err(StorageError::InvalidData("snapshot has no project id".to_string()));
        }
        if snapshot.blocked_story.is_some() && snapshot.state != WorkflowState::Blocked {
            return Err(StorageError::InvalidData(format!(
                "blocked story recorded while {}",
                snapshot.state
            )));
        }

        let history = TransitionHistory::from_records(snapshot.history)?;
        let primary = Primary {
            state: snapshot.state,
            planned_scope: snapshot.planned_scope,
            blocked_story: snapshot.blocked_story,
        };
        let instance = Self::from_parts(snapshot.project, config, emitter, primary, history);

        for cycle in snapshot.cycles {
            validate_cycle(&cycle)?;
            instance
                .registry
                .insert(cycle)
                .map_err(|err| StorageError::InvalidData(err.to_string()))?;
        }
        debug!(
            project = %instance.project,
            state = %instance.state(),
            "Restored workflow instance"
        );
        Ok(instance)
    }

    // ---- commit path ----

    fn commit(
        &self,
        primary: &mut Primary,
        plan: Plan<'_>,
    ) -> Result<WorkflowOutcome, StorageError> {
        let started = if plan.effects.register.is_empty() {
            Vec::new()
        } else {
            match self.registry.register_all(&plan.effects.register) {
                Ok(started) => started,
                Err(err) => {
                    let denial = registry_denial(plan.from, &plan.command, &err);
                    return self
                        .deny_workflow(plan.from, &plan.command, plan.context, denial)
                        .map(Outcome::Denied);
                }
            }
        };
        let aborted = match &plan.effects.abort {
            Abort::Nothing => Vec::new(),
            Abort::Story(story_id) => self.registry.unregister(story_id).into_iter().collect(),
            Abort::All => self.registry.unregister_where(|_| true),
        };

        let mut pending = vec![self.workflow_record(&plan)];
        for (story_id, cycle_id) in &started {
            pending.push(
                PendingRecord::cycle(
                    story_id.clone(),
                    Some(*cycle_id),
                    TddState::Design,
                    TddState::Design,
                    plan.command.clone(),
                    plan.context,
                )
                .with_reason("cycle created"),
            );
        }
        for cycle in &aborted {
            let mut record = abort_record(cycle, &plan.command, &plan.reason, plan.context);
            record.forced = plan.forced;
            pending.push(record);
        }

        let appended = match plan.effects.fan_out {
            Some(kind) => self
                .registry
                .with_all(|cycles| self.fan_out(kind, cycles, &plan, pending)),
            None => self.append(pending).map(Ok),
        };
        let records = match appended {
            Ok(Ok(records)) => records,
            Ok(Err(denial)) => {
                self.undo_registry_effects(&started, aborted);
                return self
                    .deny_workflow(plan.from, &plan.command, plan.context, denial)
                    .map(Outcome::Denied);
            }
            Err(err) => {
                self.undo_registry_effects(&started, aborted);
                return Err(err);
            }
        };

        primary.state = plan.to;
        if let Some(scope) = plan.effects.scope {
            primary.planned_scope = scope;
        }
        if let Some(blocked) = plan.effects.blocked {
            primary.blocked_story = blocked;
        }

        if plan.forced {
            warn!(
                project = %self.project,
                from = %plan.from,
                to = %plan.to,
                reason = %plan.reason,
                "Forced workflow transition"
            );
        } else {
            info!(
                project = %self.project,
                from = %plan.from,
                to = %plan.to,
                command = %plan.command,
                "Workflow transition"
            );
        }

        Ok(Outcome::Allowed(WorkflowTransition {
            command: plan.command,
            from: plan.from,
            to: plan.to,
            forced: plan.forced,
            sequence: records.first().map(|record| record.sequence),
            cycles_started: started.into_iter().map(|(story_id, _)| story_id).collect(),
            cycles_retired: aborted.into_iter().map(|cycle| cycle.story_id).collect(),
        }))
    }

    /// Pause or resume every affected cycle, then append; all or nothing.
    fn fan_out(
        &self,
        kind: FanOut,
        cycles: &mut [MutexGuard<'_, TddCycle>],
        plan: &Plan<'_>,
        mut pending: Vec<PendingRecord>,
    ) -> Result<Result<Vec<TransitionRecord>, Denial>, StorageError> {
        let saved: Vec<TddCycle> = cycles.iter().map(|cycle| (**cycle).clone()).collect();
        let mut refused = None;

        for cycle in cycles.iter_mut() {
            let step = match kind {
                FanOut::Pause if cycle.is_paused() || cycle.is_terminal() => continue,
                FanOut::Pause => cycle.pause(PauseOrigin::Sprint),
                FanOut::Resume if cycle.pause_origin != Some(PauseOrigin::Sprint) => continue,
                FanOut::Resume => cycle.resume(),
            };
            match step {
                Ok(step) => pending.push(PendingRecord::cycle(
                    cycle.story_id.clone(),
                    Some(cycle.cycle_id),
                    step.from,
                    step.to,
                    plan.command.clone(),
                    plan.context,
                )),
                Err(refusal) => {
                    refused = Some(Denial::new(
                        DenialCode::InvalidState,
                        plan.from,
                        plan.command.clone(),
                        format!("cycle {} refused: {}", cycle.story_id, refusal.reason),
                        hint(plan.from),
                    ));
                    break;
                }
            }
        }
        if let Some(denial) = refused {
            restore_cycles(cycles, saved);
            return Ok(Err(denial));
        }

        match self.append(pending) {
            Ok(records) => Ok(Ok(records)),
            Err(err) => {
                restore_cycles(cycles, saved);
                Err(err)
            }
        }
    }

    fn undo_registry_effects(&self, started: &[(String, uuid::Uuid)], aborted: Vec<TddCycle>) {
        for (story_id, _) in started {
            self.discard(story_id);
        }
        self.reinsert(aborted);
    }

    fn discard(&self, story_id: &str) {
        if let Err(err) = self.registry.unregister(story_id) {
            warn!(
                project = %self.project,
                story_id,
                error = %err,
                "Could not discard started cycle"
            );
        }
    }

    fn reinsert(&self, cycles: Vec<TddCycle>) {
        for cycle in cycles {
            if let Err(err) = self.registry.insert(cycle) {
                warn!(project = %self.project, error = %err, "Could not restore aborted cycle");
            }
        }
    }

    fn workflow_record(&self, plan: &Plan<'_>) -> PendingRecord {
        let record = PendingRecord::workflow(plan.from, plan.to, plan.command.clone(), plan.context)
            .with_reason(plan.reason.clone());
        if plan.forced {
            record.forced()
        } else {
            record
        }
    }

    fn command_effects(&self, primary: &Primary, cmd: &WorkflowCommand) -> Effects {
        let mut effects = Effects::default();
        match cmd {
            WorkflowCommand::SprintPlan(ids) => effects.scope = Some(dedup(ids)),
            WorkflowCommand::SprintStart => {
                effects.register = self.unregistered(&primary.planned_scope);
            }
            WorkflowCommand::SprintPause => effects.fan_out = Some(FanOut::Pause),
            WorkflowCommand::SprintResume => effects.fan_out = Some(FanOut::Resume),
            WorkflowCommand::RequestChanges(_) | WorkflowCommand::Feedback(_) => {
                effects.scope = Some(Vec::new());
            }
            WorkflowCommand::SuggestFix(_) => effects.blocked = Some(None),
            WorkflowCommand::SkipTask(_) => {
                effects.blocked = Some(None);
                if let Some(story_id) = &primary.blocked_story {
                    effects.abort = Abort::Story(story_id.clone());
                }
            }
            _ => {}
        }
        effects
    }

    fn forced_effects(&self, primary: &Primary, from: WorkflowState, to: WorkflowState) -> Effects {
        use WorkflowState::{Blocked, Idle, SprintActive, SprintPaused, SprintPlanned};

        let mut effects = Effects::default();
        if from == to {
            return effects;
        }
        match (from, to) {
            (SprintPlanned, SprintActive) => {
                effects.register = self.unregistered(&primary.planned_scope);
            }
            (SprintPaused, SprintActive) => effects.fan_out = Some(FanOut::Resume),
            (SprintActive, SprintPaused) => effects.fan_out = Some(FanOut::Pause),
            _ => {}
        }
        if to.requires_quiescent_registry() {
            effects.abort = Abort::All;
        }
        if to == Idle {
            effects.scope = Some(Vec::new());
        }
        if from == Blocked {
            effects.blocked = Some(None);
        }
        effects
    }

    /// Planned stories that have no live cycle yet.
    fn unregistered(&self, scope: &[String]) -> Vec<String> {
        dedup(scope)
            .into_iter()
            .filter(|story_id| !self.registry.contains(story_id))
            .collect()
    }

    /// Move to SPRINT_REVIEW once the last cycle has retired, if enabled.
    fn auto_review(&self, context: &CommandContext) -> Result<(), StorageError> {
        if !self.config.auto_review_on_completion {
            return Ok(());
        }
        let mut primary = self.write_primary();
        if primary.state != WorkflowState::SprintActive {
            return Ok(());
        }
        let summary = self.registry.summary();
        let trigger = Trigger::AllTasksDone;
        let Ok(to) = self.guards.evaluate_trigger(primary.state, &trigger, context, &summary) else {
            return Ok(());
        };
        let plan = Plan {
            command: trigger.to_string(),
            from: primary.state,
            to,
            context,
            reason: "last cycle retired".to_string(),
            forced: false,
            effects: Effects::default(),
        };
        self.commit(&mut primary, plan).map(|_| ())
    }

    // ---- TDD path ----

    fn tdd_status(
        &self,
        state: WorkflowState,
        cmd: &TddCommand,
        command: &str,
        context: &CommandContext,
    ) -> Result<ApplyOutcome, StorageError> {
        let Some(story_id) = cmd.story_id.as_deref() else {
            let statuses = self.registry.cycles().iter().map(TddCycle::status).collect();
            return Ok(Outcome::Allowed(Applied::Cycles(statuses)));
        };
        match self.registry.status(story_id) {
            Ok(status) => Ok(Outcome::Allowed(Applied::Cycles(vec![status]))),
            Err(err) => {
                let denial = registry_denial(state, command, &err);
                self.record_denial(
                    story_subject(Some(story_id)),
                    state.into(),
                    command,
                    context,
                    &denial,
                )?;
                Ok(Outcome::Denied(denial))
            }
        }
    }

    /// Register a cycle for a story joining the active sprint.
    ///
    /// `Ok(None)` means the story was registered concurrently.
    fn start_cycle(
        &self,
        state: WorkflowState,
        story_id: &str,
        command: &str,
        context: &CommandContext,
    ) -> Result<Option<TddOutcome>, StorageError> {
        let cycle_id = match self.registry.register(story_id) {
            Ok(cycle_id) => cycle_id,
            Err(RegistryError::DuplicateCycle(_)) => return Ok(None),
            Err(err) => {
                let denial = registry_denial(state, command, &err);
                self.record_denial(
                    story_subject(Some(story_id)),
                    state.into(),
                    command,
                    context,
                    &denial,
                )?;
                return Ok(Some(Outcome::Denied(denial)));
            }
        };

        let pending = PendingRecord::cycle(
            story_id,
            Some(cycle_id),
            TddState::Design,
            TddState::Design,
            command,
            context,
        )
        .with_reason("cycle created");
        let records = match self.append(vec![pending]) {
            Ok(records) => records,
            Err(err) => {
                self.discard(story_id);
                return Err(err);
            }
        };
        info!(project = %self.project, story_id, %cycle_id, "Story joined the sprint");

        Ok(Some(Outcome::Allowed(TddTransition {
            story_id: story_id.to_string(),
            cycle_id,
            command: command.to_string(),
            from: TddState::Design,
            to: TddState::Design,
            sequence: records.first().map_or(0, |record| record.sequence),
        })))
    }

    /// Apply one TDD action to a locked cycle. The flag reports completion.
    fn step_cycle(
        &self,
        cycle: &mut TddCycle,
        cmd: &TddCommand,
        command: &str,
        context: &CommandContext,
    ) -> Result<(TddOutcome, bool), StorageError> {
        let saved = cycle.clone();
        let subject = Subject::Cycle {
            story_id: cycle.story_id.clone(),
            cycle_id: Some(cycle.cycle_id),
        };

        let step = match cycle.transition(cmd.action, cmd.note.as_deref()) {
            Ok(step) => step,
            Err(denial) => {
                self.record_denial(subject, cycle.state.into(), command, context, &denial)?;
                return Ok((Outcome::Denied(denial), false));
            }
        };

        let mut pending = PendingRecord::cycle(
            cycle.story_id.clone(),
            Some(cycle.cycle_id),
            step.from,
            step.to,
            command,
            context,
        );
        if let Some(note) = &cmd.note {
            pending = pending.with_reason(note.clone());
        }
        let records = match self.append(vec![pending]) {
            Ok(records) => records,
            Err(err) => {
                *cycle = saved;
                return Err(err);
            }
        };
        debug!(story_id = %cycle.story_id, from = %step.from, to = %step.to, "TDD transition");

        let transition = TddTransition {
            story_id: cycle.story_id.clone(),
            cycle_id: cycle.cycle_id,
            command: command.to_string(),
            from: step.from,
            to: step.to,
            sequence: records.first().map_or(0, |record| record.sequence),
        };
        Ok((Outcome::Allowed(transition), step.to.is_terminal()))
    }

    // ---- shared helpers ----

    fn deny_unknown(&self, text: &str, context: &CommandContext) -> Result<Denial, StorageError> {
        let primary = self.write_primary();
        let denial = unknown_command(primary.state, text);
        self.record_denial(Subject::Workflow, primary.state.into(), text, context, &denial)?;
        Ok(denial)
    }

    fn deny_workflow(
        &self,
        state: WorkflowState,
        command: &str,
        context: &CommandContext,
        denial: Denial,
    ) -> Result<Denial, StorageError> {
        self.record_denial(Subject::Workflow, state.into(), command, context, &denial)?;
        Ok(denial)
    }

    fn record_denial(
        &self,
        subject: Subject,
        state: StateRef,
        command: &str,
        context: &CommandContext,
        denial: &Denial,
    ) -> Result<(), StorageError> {
        debug!(
            project = %self.project,
            %state,
            command,
            code = %denial.code,
            reason = %denial.reason,
            "Transition denied"
        );
        let pending = PendingRecord {
            subject,
            from: state,
            to: state,
            command: command.to_string(),
            context: context.clone(),
            success: true,
            reason: None,
            forced: false,
        }
        .denied(denial.reason.clone());
        self.append(vec![pending]).map(|_| ())
    }

    /// Append records and emit their events under one history lock, so
    /// events leave in sequence order.
    fn append(&self, pending: Vec<PendingRecord>) -> Result<Vec<TransitionRecord>, StorageError> {
        let mut history = self.lock_history();
        let records = history.append_all(pending)?;
        for record in &records {
            if let Some(event) = TransitionEvent::from_record(&self.project, record) {
                self.emitter.emit(&event);
            }
        }
        Ok(records)
    }

    fn read_primary(&self) -> RwLockReadGuard<'_, Primary> {
        self.primary.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_primary(&self) -> RwLockWriteGuard<'_, Primary> {
        self.primary.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_history(&self) -> MutexGuard<'_, TransitionHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn query_transition(command: String, state: WorkflowState) -> WorkflowTransition {
    WorkflowTransition {
        command,
        from: state,
        to: state,
        forced: false,
        sequence: None,
        cycles_started: Vec::new(),
        cycles_retired: Vec::new(),
    }
}

fn command_reason(cmd: &WorkflowCommand) -> String {
    cmd.argument()
        .map_or_else(|| cmd.info().description.to_string(), str::to_string)
}

fn story_subject(story_id: Option<&str>) -> Subject {
    match story_id {
        Some(story_id) => Subject::Cycle {
            story_id: story_id.to_string(),
            cycle_id: None,
        },
        None => Subject::Workflow,
    }
}

fn abort_record(
    cycle: &TddCycle,
    command: &str,
    reason: &str,
    context: &CommandContext,
) -> PendingRecord {
    PendingRecord::cycle(
        cycle.story_id.clone(),
        Some(cycle.cycle_id),
        cycle.state,
        cycle.state,
        command,
        context,
    )
    .with_reason(format!("cycle aborted: {reason}"))
}

fn registry_denial(state: impl Into<StateRef>, command: &str, err: &RegistryError) -> Denial {
    match err {
        RegistryError::DuplicateCycle(story_id) => Denial::new(
            DenialCode::DuplicateCycle,
            state,
            command,
            err.to_string(),
            format!("Check the existing cycle: /tdd status {story_id}"),
        ),
        RegistryError::CycleNotFound(_) => Denial::new(
            DenialCode::CycleNotFound,
            state,
            command,
            err.to_string(),
            "List live cycles: /tdd status",
        ),
        RegistryError::InvalidStoryId(story_id) => Denial::guard(
            state,
            command,
            GuardViolation::InvalidStoryId {
                story_id: story_id.clone(),
            },
            "Story ids are letters, digits, '.', '_' or '-'",
        ),
    }
}

fn restore_cycles(cycles: &mut [MutexGuard<'_, TddCycle>], saved: Vec<TddCycle>) {
    for (cycle, saved) in cycles.iter_mut().zip(saved) {
        **cycle = saved;
    }
}

fn validate_cycle(cycle: &TddCycle) -> Result<(), StorageError> {
    let paused = cycle.state == TddState::Paused;
    let consistent = cycle.state != TddState::Done
        && paused == cycle.paused_from.is_some()
        && paused == cycle.pause_origin.is_some()
        && cycle
            .paused_from
            .is_none_or(|state| TddState::WORKING.contains(&state));
    if consistent {
        Ok(())
    } else {
        Err(StorageError::InvalidData(format!(
            "inconsistent cycle data for {}",
            cycle.story_id
        )))
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(id) {
            unique.push(id.clone());
        }
    }
    unique
}
