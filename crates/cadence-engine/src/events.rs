//! Transition events for external observers.
//!
//! The engine calls [`EventEmitter::emit`] once per committed history record,
//! while the history lock is still held, so observers see events in sequence
//! order. Emitters must not block; delivery is their own concern.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::history::{Subject, TransitionRecord};
use crate::state::{AgentType, TddState, WorkflowState};

/// The primary workflow moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTransitionEvent {
    /// State before.
    pub old_state: WorkflowState,
    /// State after.
    pub new_state: WorkflowState,
    /// Project the workflow belongs to.
    pub project: String,
    /// Command that caused the move.
    pub command: String,
    /// Sequence of the history record.
    pub sequence: u64,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
}

/// A story's TDD cycle moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TddTransitionEvent {
    /// Cycle id.
    pub cycle_id: Uuid,
    /// Story id.
    pub story_id: String,
    /// State before.
    pub old_state: TddState,
    /// State after.
    pub new_state: TddState,
    /// Agent that picks up the work in the new state.
    pub agent_type: Option<AgentType>,
    /// Command that caused the move.
    pub command: String,
    /// Record reason, e.g. `cycle created` or `cycle aborted: descoped`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Sequence of the history record.
    pub sequence: u64,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
}

/// An event published after a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransitionEvent {
    /// Workflow transition.
    Workflow(WorkflowTransitionEvent),
    /// TDD transition.
    Tdd(TddTransitionEvent),
}

impl TransitionEvent {
    /// Build the event for a committed record. Denied records have none.
    pub fn from_record(project: &str, record: &TransitionRecord) -> Option<Self> {
        if !record.success {
            return None;
        }
        match &record.subject {
            Subject::Workflow => Some(Self::Workflow(WorkflowTransitionEvent {
                old_state: record.from.as_workflow()?,
                new_state: record.to.as_workflow()?,
                project: project.to_string(),
                command: record.command.clone(),
                sequence: record.sequence,
                timestamp: record.timestamp,
            })),
            Subject::Cycle { story_id, cycle_id } => {
                let new_state = record.to.as_tdd()?;
                Some(Self::Tdd(TddTransitionEvent {
                    cycle_id: (*cycle_id)?,
                    story_id: story_id.clone(),
                    old_state: record.from.as_tdd()?,
                    new_state,
                    agent_type: record
                        .context
                        .agent_type
                        .or_else(|| AgentType::for_state(new_state)),
                    command: record.command.clone(),
                    reason: record.reason.clone(),
                    sequence: record.sequence,
                    timestamp: record.timestamp,
                }))
            }
        }
    }
}

/// Receives transition events.
pub trait EventEmitter: Send + Sync {
    /// Publish one event. Must not block.
    fn emit(&self, event: &TransitionEvent);
}

impl<T: EventEmitter + ?Sized> EventEmitter for Arc<T> {
    fn emit(&self, event: &TransitionEvent) {
        (**self).emit(event);
    }
}

/// Emitter that discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: &TransitionEvent) {}
}

/// Emitter that forwards events into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<TransitionEvent>,
}

impl ChannelEmitter {
    /// Create an emitter and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: &TransitionEvent) {
        // A dropped receiver means nobody is listening; the engine carries on.
        let _ = self.tx.send(event.clone());
    }
}

/// Emitter that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl EventEmitter for TracingEmitter {
    fn emit(&self, event: &TransitionEvent) {
        match event {
            TransitionEvent::Workflow(e) => info!(
                project = %e.project,
                old_state = %e.old_state,
                new_state = %e.new_state,
                "Workflow transition"
            ),
            TransitionEvent::Tdd(e) => info!(
                story_id = %e.story_id,
                cycle_id = %e.cycle_id,
                old_state = %e.old_state,
                new_state = %e.new_state,
                "TDD transition"
            ),
        }
    }
}

/// Emitter that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    events: Mutex<Vec<TransitionEvent>>,
}

impl MemoryEmitter {
    /// Create an empty emitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event so far.
    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Remove and return every event so far.
    pub fn take(&self) -> Vec<TransitionEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventEmitter for MemoryEmitter {
    fn emit(&self, event: &TransitionEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// Emitter that forwards to several others in order.
#[derive(Default)]
pub struct FanoutEmitter {
    emitters: Vec<Box<dyn EventEmitter>>,
}

impl FanoutEmitter {
    /// Create an emitter with no targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target.
    #[must_use]
    pub fn with(mut self, emitter: impl EventEmitter + 'static) -> Self {
        self.emitters.push(Box::new(emitter));
        self
    }
}

impl EventEmitter for FanoutEmitter {
    fn emit(&self, event: &TransitionEvent) {
        for emitter in &self.emitters {
            emitter.emit(event);
        }
    }
}
