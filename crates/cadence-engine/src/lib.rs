//! cadence-engine: Headless engine for the sprint workflow and TDD state machines
//!
//! This crate provides the core decision logic for cadence, including:
//! - Command parsing and the guard pipeline
//! - The workflow and per-story TDD state machines
//! - The cycle registry and transition history
//! - Transition events and snapshot persistence

pub mod command;
pub mod config;
pub mod context;
pub mod events;
pub mod guard;
pub mod history;
pub mod outcome;
pub mod persistence;
pub mod projects;
mod property_tests;
pub mod registry;
pub mod state;
pub mod tdd;
pub mod workflow;

// Re-export commonly used types
pub use command::{parse_command, BacklogAction, Command, TddAction, TddCommand, WorkflowCommand};
pub use config::{ConfigError, EngineConfig};
pub use context::{CiStatus, CommandContext, ContextError};
pub use events::{
    ChannelEmitter, EventEmitter, FanoutEmitter, MemoryEmitter, NullEmitter, TracingEmitter,
    TransitionEvent,
};
pub use guard::{GuardEvaluator, Trigger};
pub use history::{
    JsonlJournal, Journal, RecoveryReport, Subject, TransitionHistory, TransitionRecord,
};
pub use outcome::{
    Denial, DenialCode, GuardViolation, Outcome, TddOutcome, TddTransition, WorkflowOutcome,
    WorkflowTransition,
};
pub use persistence::{FileStore, Snapshot, SnapshotStore, StorageError};
pub use projects::{ProjectError, Projects};
pub use registry::{CycleRegistry, RegistryError, RegistrySummary};
pub use state::{AgentType, StateRef, TddState, WorkflowState};
pub use tdd::{PauseOrigin, TddCycle, TddStatus};
pub use workflow::{Applied, ApplyOutcome, WorkflowInstance};

/// Returns the engine version.
pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
