//! cadence CLI: line-oriented driver for the sprint and TDD state machines

mod logging;

use cadence_engine::{
    Applied, ApplyOutcome, ChannelEmitter, CommandContext, EngineConfig, FanoutEmitter, FileStore,
    JsonlJournal, SnapshotStore, StorageError, TracingEmitter, TransitionEvent, WorkflowInstance,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Sprint workflow and TDD cycle orchestrator
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding project snapshots and journals
    #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Engine configuration file (default: <state-dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also print transition events as JSON lines
    #[arg(long, global = true)]
    events: bool,

    /// Debug-level engine logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a project and save its initial snapshot
    Init {
        /// Project id
        project: String,
    },

    /// Apply a command; with no command, apply one per line from stdin
    Apply {
        /// Command context as a JSON object
        #[arg(long)]
        context: Option<String>,

        /// Bypass context guards, recording this reason
        #[arg(long)]
        force: Option<String>,

        /// Project id
        project: String,

        /// Command text, e.g. `/sprint start`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print current state and live cycles
    Status {
        /// Project id
        project: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print recent transitions and recovery options
    Recover {
        /// Project id
        project: String,
    },

    /// Force the workflow into a state
    Force {
        /// Project id
        project: String,

        /// Target state, e.g. SPRINT_PLANNED
        state: String,

        /// Why the force is needed
        #[arg(required = true, trailing_var_arg = true)]
        reason: Vec<String>,
    },
}

const DEFAULT_STATE_DIR: &str = ".cadence";

/// Exit code when at least one request was denied.
const EXIT_DENIED: u8 = 2;

#[derive(Serialize)]
struct StatusReport<'a> {
    project: &'a str,
    state: cadence_engine::WorkflowState,
    planned_scope: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_story: Option<String>,
    cycles: Vec<cadence_engine::TddStatus>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let store = match FileStore::new(&cli.state_dir) {
        Ok(store) => store,
        Err(e) => fatal(format!("Failed to open {}: {e}", cli.state_dir.display())),
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.state_dir.join("config.json"));
    let config = match EngineConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => fatal(format!("Error loading config: {e}")),
    };

    let (channel, rx) = ChannelEmitter::channel();
    let emitter = Arc::new(FanoutEmitter::new().with(TracingEmitter).with(channel));
    let session = Session {
        store,
        config,
        config_path,
        emitter,
    };

    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => fatal(format!("Failed to create tokio runtime: {e}")),
    };
    let print_events = cli.events;
    rt.block_on(async move {
        let drain = tokio::spawn(drain_events(rx, print_events));
        let code = run(cli.command, session);
        // `session` is gone, so the channel closes once queued events are read.
        if let Err(e) = drain.await {
            tracing::warn!(error = %e, "Event drain task failed");
        }
        code
    })
}

/// Everything a subcommand needs.
struct Session {
    store: FileStore,
    config: EngineConfig,
    config_path: PathBuf,
    emitter: Arc<FanoutEmitter>,
}

fn run(command: Commands, session: Session) -> ExitCode {
    match command {
        Commands::Init { project } => cmd_init(&session, &project),
        Commands::Apply {
            context,
            force,
            project,
            command,
        } => cmd_apply(&session, &project, &command, context.as_deref(), force.as_deref()),
        Commands::Status { project, json } => cmd_status(&session, &project, json),
        Commands::Recover { project } => cmd_recover(&session, &project),
        Commands::Force {
            project,
            state,
            reason,
        } => cmd_force(&session, &project, &state, &reason.join(" ")),
    }
}

async fn drain_events(mut rx: UnboundedReceiver<TransitionEvent>, print: bool) {
    while let Some(event) = rx.recv().await {
        if print {
            println!("{}", to_json(&event));
        }
    }
}

fn cmd_init(session: &Session, project: &str) -> ExitCode {
    if let Err(e) = FileStore::validate_id(project) {
        fatal(e);
    }
    match project_exists(&session.store, project) {
        Ok(true) => {
            println!("Project {project} already exists");
            return ExitCode::SUCCESS;
        }
        Ok(false) => {}
        Err(e) => fatal(format!("Refusing to re-initialize {project}: {e}")),
    }

    if !session.config_path.exists() {
        match session.config.save(&session.config_path) {
            Ok(()) => println!("Created {}", session.config_path.display()),
            Err(e) => fatal(format!("Failed to write config: {e}")),
        }
    }

    let instance = WorkflowInstance::new(project, session.config.clone(), session.emitter.clone());
    if let Err(e) = JsonlJournal::open(journal_path(&session.store, project)) {
        fatal(format!("Failed to create journal: {e}"));
    }
    save(session, &instance);
    println!("Initialized project {project} in {}", session.store.base_path().display());
    ExitCode::SUCCESS
}

fn cmd_apply(
    session: &Session,
    project: &str,
    command: &[String],
    context: Option<&str>,
    force: Option<&str>,
) -> ExitCode {
    let context = match context.map(CommandContext::from_json).transpose() {
        Ok(context) => context.unwrap_or_default(),
        Err(e) => fatal(e),
    };
    let inputs = if command.is_empty() {
        read_stdin_commands()
    } else {
        vec![command.join(" ")]
    };

    let instance = load(session, project);
    let mut denied = false;
    let mut fault = None;
    for input in &inputs {
        let result = match force {
            Some(reason) => instance.apply_forced(input, &context, reason),
            None => instance.apply(input, &context),
        };
        match result {
            Ok(outcome) => denied |= print_outcome(&outcome),
            Err(e) => {
                fault = Some(e);
                break;
            }
        }
    }

    // Committed records (denials included) are kept even if a later command failed.
    save(session, &instance);
    if let Some(e) = fault {
        fatal(format!("Storage fault: {e}"));
    }
    exit_code(denied)
}

fn cmd_status(session: &Session, project: &str, json: bool) -> ExitCode {
    let instance = load(session, project);
    let report = StatusReport {
        project,
        state: instance.state(),
        planned_scope: instance.planned_scope(),
        blocked_story: instance.blocked_story(),
        cycles: instance.registry().cycles().iter().map(cadence_engine::TddCycle::status).collect(),
    };

    if json {
        println!("{}", to_json_pretty(&report));
        return ExitCode::SUCCESS;
    }

    println!("Project: {project}");
    println!("State: {}", report.state);
    if !report.planned_scope.is_empty() {
        println!("Scope: {}", report.planned_scope.join(", "));
    }
    if let Some(story) = &report.blocked_story {
        println!("Blocked on: {story}");
    }

    println!();
    if report.cycles.is_empty() {
        println!("No live cycles");
    } else {
        println!("Cycles:");
        for cycle in &report.cycles {
            match cycle.paused_from {
                Some(from) => println!("  {} - {} (from {from})", cycle.story_id, cycle.state),
                None => println!("  {} - {}", cycle.story_id, cycle.state),
            }
        }
    }
    ExitCode::SUCCESS
}

fn cmd_recover(session: &Session, project: &str) -> ExitCode {
    let instance = load(session, project);
    println!("{}", to_json_pretty(&instance.recovery_report()));
    ExitCode::SUCCESS
}

fn cmd_force(session: &Session, project: &str, state: &str, reason: &str) -> ExitCode {
    let instance = load(session, project);
    let result = instance.force_by_name(state, reason);
    save(session, &instance);
    match result {
        Ok(outcome) => exit_code(print_outcome(&outcome.map(Applied::Workflow))),
        Err(e) => fatal(format!("Storage fault: {e}")),
    }
}

/// Whether `project` has a loadable snapshot. A snapshot that exists but
/// cannot be loaded is an error, never a fresh start.
fn project_exists(store: &FileStore, project: &str) -> Result<bool, StorageError> {
    match store.load(project) {
        Ok(_) => Ok(true),
        Err(StorageError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Load a project and attach its journal.
fn load(session: &Session, project: &str) -> WorkflowInstance {
    let snapshot = match session.store.load(project) {
        Ok(snapshot) => snapshot,
        Err(StorageError::NotFound(_)) => {
            fatal(format!("Project {project} not found. Run `cadence init {project}` first."))
        }
        Err(e) => fatal(format!("Failed to load {project}: {e}")),
    };
    let instance =
        match WorkflowInstance::restore(snapshot, session.config.clone(), session.emitter.clone()) {
            Ok(instance) => instance,
            Err(e) => fatal(format!("Failed to restore {project}: {e}")),
        };
    match JsonlJournal::open(journal_path(&session.store, project)) {
        Ok(journal) => instance.set_journal(Box::new(journal)),
        Err(e) => fatal(format!("Failed to open journal: {e}")),
    }
    instance
}

fn save(session: &Session, instance: &WorkflowInstance) {
    if let Err(e) = session.store.save(&instance.snapshot()) {
        fatal(format!("Failed to save {}: {e}", instance.project()));
    }
}

fn journal_path(store: &FileStore, project: &str) -> PathBuf {
    store.project_dir(project).join("history.jsonl")
}

/// Print an outcome as one JSON line; returns whether it was a denial.
fn print_outcome(outcome: &ApplyOutcome) -> bool {
    match outcome {
        ApplyOutcome::Allowed(applied) => {
            println!("{}", to_json(applied));
            false
        }
        ApplyOutcome::Denied(denial) => {
            println!("{}", to_json(denial));
            true
        }
    }
}

fn read_stdin_commands() -> Vec<String> {
    let mut commands = Vec::new();
    for line in std::io::stdin().lock().lines() {
        match line {
            Ok(line) => {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    commands.push(line.to_string());
                }
            }
            Err(e) => fatal(format!("Failed to read stdin: {e}")),
        }
    }
    commands
}

fn exit_code(denied: bool) -> ExitCode {
    if denied {
        ExitCode::from(EXIT_DENIED)
    } else {
        ExitCode::SUCCESS
    }
}

fn to_json(value: &impl Serialize) -> String {
    serde_json::to_string(value).expect("failed to serialize")
}

fn to_json_pretty(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).expect("failed to serialize")
}

fn fatal(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(1);
}
