//! Command parser and the static command → state table.
//!
//! Commands are slash-prefixed words, matched case-insensitively. Free text
//! after the command words is kept verbatim as the command's argument.

use std::fmt;

use crate::state::WorkflowState;

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Command addressed to the workflow machine.
    Workflow(WorkflowCommand),
    /// Command addressed to one story's TDD machine.
    Tdd(TddCommand),
    /// Input that matches no known command.
    Unknown(String),
}

/// Commands for the primary workflow machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCommand {
    /// Define an epic.
    Epic(Option<String>),
    /// Approve proposed stories.
    Approve(Option<String>),
    /// Inspect or edit the backlog.
    Backlog(BacklogAction),
    /// Plan a sprint over the listed story ids.
    SprintPlan(Vec<String>),
    /// Start the planned sprint.
    SprintStart,
    /// Report sprint progress.
    SprintStatus,
    /// Pause the sprint and every live cycle.
    SprintPause,
    /// Resume the sprint and the cycles it paused.
    SprintResume,
    /// Send the reviewed sprint back to the backlog.
    RequestChanges(Option<String>),
    /// Unblock with a suggested fix.
    SuggestFix(Option<String>),
    /// Unblock by dropping the blocked task.
    SkipTask(Option<String>),
    /// Close the review with feedback.
    Feedback(Option<String>),
    /// Show the current workflow state.
    State,
}

/// `/backlog` variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BacklogAction {
    /// `/backlog` or `/backlog view`.
    View,
    /// `/backlog add_story <text>`.
    AddStory(Option<String>),
    /// `/backlog prioritize <text>`.
    Prioritize(Option<String>),
}

/// A command for one story's TDD cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TddCommand {
    /// What to do.
    pub action: TddAction,
    /// Story the command targets.
    pub story_id: Option<String>,
    /// Free text after the story id.
    pub note: Option<String>,
}

/// TDD actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TddAction {
    /// Start (or restart) the cycle at DESIGN.
    Start,
    /// Report cycle state.
    Status,
    /// DESIGN → TEST_RED.
    DesignComplete,
    /// TEST_RED → CODE_GREEN.
    TestsReady,
    /// CODE_GREEN → REFACTOR.
    CodeGreen,
    /// REFACTOR → COMMIT.
    RefactorDone,
    /// COMMIT → DONE.
    Commit,
    /// REFACTOR → CODE_GREEN.
    TestsBroken,
    /// CODE_GREEN → TEST_RED.
    NeedMoreTests,
    /// TEST_RED → DESIGN.
    RequirementsUnclear,
    /// Flag the current state for human review.
    ReviewCycle,
    /// Advance to the next forward state unconditionally.
    SkipPhase,
    /// Suspend the cycle.
    Pause,
    /// Restore the state the cycle paused from.
    Resume,
}

impl TddAction {
    /// Every TDD action.
    pub const ALL: [TddAction; 14] = [
        Self::Start,
        Self::Status,
        Self::DesignComplete,
        Self::TestsReady,
        Self::CodeGreen,
        Self::RefactorDone,
        Self::Commit,
        Self::TestsBroken,
        Self::NeedMoreTests,
        Self::RequirementsUnclear,
        Self::ReviewCycle,
        Self::SkipPhase,
        Self::Pause,
        Self::Resume,
    ];

    /// Sub-command word after `/tdd`.
    pub fn word(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Status => "status",
            Self::DesignComplete => "design_complete",
            Self::TestsReady => "tests_ready",
            Self::CodeGreen => "code_green",
            Self::RefactorDone => "refactor_done",
            Self::Commit => "commit",
            Self::TestsBroken => "tests_broken",
            Self::NeedMoreTests => "need_more_tests",
            Self::RequirementsUnclear => "requirements_unclear",
            Self::ReviewCycle => "review_cycle",
            Self::SkipPhase => "skip_phase",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }

    /// Full command name, e.g. `/tdd code_green`.
    pub fn name(self) -> String {
        format!("/tdd {}", self.word())
    }

    /// Whether the action leaves the cycle state unchanged.
    pub fn is_read_only(self) -> bool {
        self == Self::Status
    }

    fn from_word(word: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.word() == word)
    }
}

impl WorkflowCommand {
    /// Table key of the command, e.g. `/sprint plan`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Epic(_) => "/epic",
            Self::Approve(_) => "/approve",
            Self::Backlog(BacklogAction::View) => "/backlog view",
            Self::Backlog(BacklogAction::AddStory(_)) => "/backlog add_story",
            Self::Backlog(BacklogAction::Prioritize(_)) => "/backlog prioritize",
            Self::SprintPlan(_) => "/sprint plan",
            Self::SprintStart => "/sprint start",
            Self::SprintStatus => "/sprint status",
            Self::SprintPause => "/sprint pause",
            Self::SprintResume => "/sprint resume",
            Self::RequestChanges(_) => "/request_changes",
            Self::SuggestFix(_) => "/suggest_fix",
            Self::SkipTask(_) => "/skip_task",
            Self::Feedback(_) => "/feedback",
            Self::State => "/state",
        }
    }

    /// Free-text argument, if the command carries one.
    pub fn argument(&self) -> Option<&str> {
        match self {
            Self::Epic(arg)
            | Self::Approve(arg)
            | Self::Backlog(BacklogAction::AddStory(arg) | BacklogAction::Prioritize(arg))
            | Self::RequestChanges(arg)
            | Self::SuggestFix(arg)
            | Self::SkipTask(arg)
            | Self::Feedback(arg) => arg.as_deref(),
            _ => None,
        }
    }

    /// Static table entry for the command.
    pub fn info(&self) -> &'static CommandInfo {
        let name = self.name();
        // Every variant has a row; the fallback is unreachable by construction.
        COMMANDS
            .iter()
            .find(|info| info.name == name)
            .unwrap_or(&COMMANDS[0])
    }

    /// Whether the command only reads state and is never recorded.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Self::State | Self::SprintStatus | Self::Backlog(BacklogAction::View)
        )
    }
}

impl fmt::Display for WorkflowCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Self::SprintPlan(ids) if !ids.is_empty() => write!(f, " {}", ids.join(" ")),
            _ => match self.argument() {
                Some(arg) => write!(f, " {arg}"),
                None => Ok(()),
            },
        }
    }
}

impl fmt::Display for TddCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.action.name())?;
        if let Some(story_id) = &self.story_id {
            write!(f, " {story_id}")?;
        }
        if let Some(note) = &self.note {
            write!(f, " {note}")?;
        }
        Ok(())
    }
}

/// A row of the static command → state table.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Command name including the slash.
    pub name: &'static str,
    /// Brief description; also the default audit reason.
    pub description: &'static str,
    /// States the command is legal in.
    pub legal_in: &'static [WorkflowState],
    /// Target state, `None` when the command does not change state.
    pub target: Option<WorkflowState>,
}

impl CommandInfo {
    /// Whether the command is legal in `state`.
    pub fn is_legal_in(&self, state: WorkflowState) -> bool {
        self.legal_in.contains(&state)
    }
}

const ALL_STATES: &[WorkflowState] = &WorkflowState::ALL;

const BACKLOG_STATES: &[WorkflowState] = &[
    WorkflowState::Idle,
    WorkflowState::BacklogReady,
    WorkflowState::SprintPlanned,
    WorkflowState::SprintActive,
    WorkflowState::SprintPaused,
    WorkflowState::Blocked,
];

/// Static registry of workflow commands.
pub static COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        name: "/epic",
        description: "Define a new epic",
        legal_in: &[WorkflowState::Idle, WorkflowState::BacklogReady],
        target: Some(WorkflowState::BacklogReady),
    },
    CommandInfo {
        name: "/approve",
        description: "Approve proposed stories",
        legal_in: &[WorkflowState::BacklogReady],
        target: None,
    },
    CommandInfo {
        name: "/backlog view",
        description: "View the backlog",
        legal_in: BACKLOG_STATES,
        target: None,
    },
    CommandInfo {
        name: "/backlog add_story",
        description: "Add a story to the backlog",
        legal_in: BACKLOG_STATES,
        target: None,
    },
    CommandInfo {
        name: "/backlog prioritize",
        description: "Reprioritize a backlog story",
        legal_in: BACKLOG_STATES,
        target: None,
    },
    CommandInfo {
        name: "/sprint plan",
        description: "Plan a sprint from backlog stories",
        legal_in: &[WorkflowState::BacklogReady],
        target: Some(WorkflowState::SprintPlanned),
    },
    CommandInfo {
        name: "/sprint start",
        description: "Start the planned sprint",
        legal_in: &[WorkflowState::SprintPlanned],
        target: Some(WorkflowState::SprintActive),
    },
    CommandInfo {
        name: "/sprint status",
        description: "Show sprint progress",
        legal_in: &[
            WorkflowState::SprintActive,
            WorkflowState::SprintPaused,
            WorkflowState::Blocked,
        ],
        target: None,
    },
    CommandInfo {
        name: "/sprint pause",
        description: "Pause the active sprint",
        legal_in: &[WorkflowState::SprintActive],
        target: Some(WorkflowState::SprintPaused),
    },
    CommandInfo {
        name: "/sprint resume",
        description: "Resume the paused sprint",
        legal_in: &[WorkflowState::SprintPaused],
        target: Some(WorkflowState::SprintActive),
    },
    CommandInfo {
        name: "/request_changes",
        description: "Send the sprint back for changes",
        legal_in: &[WorkflowState::SprintReview],
        target: Some(WorkflowState::BacklogReady),
    },
    CommandInfo {
        name: "/suggest_fix",
        description: "Unblock with a suggested fix",
        legal_in: &[WorkflowState::Blocked],
        target: Some(WorkflowState::SprintActive),
    },
    CommandInfo {
        name: "/skip_task",
        description: "Unblock by skipping the failing task",
        legal_in: &[WorkflowState::Blocked],
        target: Some(WorkflowState::SprintActive),
    },
    CommandInfo {
        name: "/feedback",
        description: "Close the sprint review with feedback",
        legal_in: &[WorkflowState::SprintReview],
        target: Some(WorkflowState::Idle),
    },
    CommandInfo {
        name: "/state",
        description: "Show the current workflow state",
        legal_in: ALL_STATES,
        target: None,
    },
];

/// Names of the workflow commands legal in `state`, in table order.
pub fn legal_commands(state: WorkflowState) -> Vec<&'static str> {
    COMMANDS
        .iter()
        .filter(|info| info.is_legal_in(state))
        .map(|info| info.name)
        .collect()
}

/// Check if input starts with '/' (is a command).
pub fn is_command(input: &str) -> bool {
    input.trim().starts_with('/')
}

/// Parse user input into a [`Command`].
///
/// Input that is not slash-prefixed, or that names no known command, parses
/// to `Command::Unknown` carrying the trimmed input.
///
/// # Examples
///
/// ```
/// use cadence_engine::command::{parse_command, Command, WorkflowCommand};
///
/// assert!(matches!(
///     parse_command("/sprint start"),
///     Command::Workflow(WorkflowCommand::SprintStart)
/// ));
/// assert!(matches!(parse_command("/dance"), Command::Unknown(_)));
/// ```
pub fn parse_command(input: &str) -> Command {
    let input = input.trim();
    let unknown = || Command::Unknown(input.to_string());

    let Some(content) = input.strip_prefix('/') else {
        return unknown();
    };

    let (head, rest) = split_word(content);
    let head = head.to_lowercase();

    let workflow = |cmd: WorkflowCommand| Command::Workflow(cmd);

    match head.as_str() {
        "epic" => workflow(WorkflowCommand::Epic(rest)),
        "approve" => workflow(WorkflowCommand::Approve(rest)),
        "request_changes" => workflow(WorkflowCommand::RequestChanges(rest)),
        "suggest_fix" => workflow(WorkflowCommand::SuggestFix(rest)),
        "skip_task" => workflow(WorkflowCommand::SkipTask(rest)),
        "feedback" => workflow(WorkflowCommand::Feedback(rest)),
        "state" if rest.is_none() => workflow(WorkflowCommand::State),
        "backlog" => parse_backlog(rest.as_deref()).map_or_else(unknown, workflow),
        "sprint" => parse_sprint(rest.as_deref()).map_or_else(unknown, workflow),
        "tdd" => parse_tdd(rest.as_deref()).map_or_else(unknown, Command::Tdd),
        _ => unknown(),
    }
}

fn parse_backlog(rest: Option<&str>) -> Option<WorkflowCommand> {
    let Some(rest) = rest else {
        return Some(WorkflowCommand::Backlog(BacklogAction::View));
    };
    let (sub, arg) = split_word(rest);
    let action = match sub.to_lowercase().as_str() {
        "view" => BacklogAction::View,
        "add_story" => BacklogAction::AddStory(arg),
        "prioritize" => BacklogAction::Prioritize(arg),
        _ => return None,
    };
    Some(WorkflowCommand::Backlog(action))
}

fn parse_sprint(rest: Option<&str>) -> Option<WorkflowCommand> {
    let (sub, arg) = split_word(rest?);
    match (sub.to_lowercase().as_str(), arg) {
        ("plan", arg) => Some(WorkflowCommand::SprintPlan(
            arg.map(|ids| ids.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        )),
        ("start", None) => Some(WorkflowCommand::SprintStart),
        ("status", None) => Some(WorkflowCommand::SprintStatus),
        ("pause", None) => Some(WorkflowCommand::SprintPause),
        ("resume", None) => Some(WorkflowCommand::SprintResume),
        _ => None,
    }
}

fn parse_tdd(rest: Option<&str>) -> Option<TddCommand> {
    let (sub, arg) = split_word(rest?);
    let action = TddAction::from_word(&sub.to_lowercase())?;
    let (story_id, note) = match arg {
        Some(arg) => {
            let (story, note) = split_word(&arg);
            (Some(story.to_string()), note)
        }
        None => (None, None),
    };
    Some(TddCommand {
        action,
        story_id,
        note,
    })
}

/// Split off the first whitespace-delimited word; the remainder is trimmed
/// and `None` when empty.
fn split_word(input: &str) -> (&str, Option<String>) {
    let input = input.trim();
    match input.find(char::is_whitespace) {
        Some(idx) => {
            let (word, rest) = input.split_at(idx);
            let rest = rest.trim();
            (word, (!rest.is_empty()).then(|| rest.to_string()))
        }
        None => (input, None),
    }
}
