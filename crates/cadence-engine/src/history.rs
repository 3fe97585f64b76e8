//! Append-only transition history and recovery index.
//!
//! Every attempted transition, committed or denied, becomes one
//! [`TransitionRecord`]. Records carry a strictly increasing sequence number
//! and a SHA-256 digest chained to the previous record, so a reloaded history
//! can be checked for tampering or truncation in the middle.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::persistence::StorageError;
use crate::state::{StateRef, WorkflowState};

/// `prev_digest` of the first record.
pub const GENESIS_DIGEST: &str = "genesis";

/// Which machine a record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "machine", rename_all = "snake_case")]
pub enum Subject {
    /// The primary workflow machine.
    Workflow,
    /// One story's TDD cycle.
    Cycle {
        /// Story id.
        story_id: String,
        /// Cycle id; absent when the command named a story with no cycle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cycle_id: Option<Uuid>,
    },
}

/// An immutable history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Position in the history, starting at 1.
    pub sequence: u64,
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    /// Machine the record describes.
    pub subject: Subject,
    /// State before.
    pub from: StateRef,
    /// State after; equal to `from` for denials and read-only commands.
    pub to: StateRef,
    /// Command text or trigger name.
    pub command: String,
    /// Context the decision was made with.
    #[serde(default)]
    pub context: CommandContext,
    /// Whether the transition committed.
    pub success: bool,
    /// Denial reason, or the audit reason of a committed transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether guards were bypassed.
    #[serde(default)]
    pub forced: bool,
    /// Digest of the previous record, or [`GENESIS_DIGEST`].
    pub prev_digest: String,
    /// Digest of this record.
    pub digest: String,
}

impl TransitionRecord {
    /// Whether this record committed a workflow state change.
    pub fn is_workflow_change(&self) -> bool {
        self.success && self.subject == Subject::Workflow && self.from != self.to
    }

    fn compute_digest(&self) -> Result<String, StorageError> {
        let input = DigestInput {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            subject: &self.subject,
            from: &self.from,
            to: &self.to,
            command: &self.command,
            context: &self.context,
            success: self.success,
            reason: self.reason.as_deref(),
            forced: self.forced,
            prev_digest: &self.prev_digest,
        };
        let bytes = serde_json::to_vec(&input)?;
        let mut hasher = Sha256::new();
        hasher.update(b"cadence-transition-v1");
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

#[derive(Serialize)]
struct DigestInput<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    subject: &'a Subject,
    from: &'a StateRef,
    to: &'a StateRef,
    command: &'a str,
    context: &'a CommandContext,
    success: bool,
    reason: Option<&'a str>,
    forced: bool,
    prev_digest: &'a str,
}

/// A record waiting to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    /// Machine the record describes.
    pub subject: Subject,
    /// State before.
    pub from: StateRef,
    /// State after.
    pub to: StateRef,
    /// Command text or trigger name.
    pub command: String,
    /// Decision context.
    pub context: CommandContext,
    /// Whether the transition committed.
    pub success: bool,
    /// Denial or audit reason.
    pub reason: Option<String>,
    /// Whether guards were bypassed.
    pub forced: bool,
}

impl PendingRecord {
    /// A committed workflow transition.
    pub fn workflow(
        from: WorkflowState,
        to: WorkflowState,
        command: impl Into<String>,
        context: &CommandContext,
    ) -> Self {
        Self {
            subject: Subject::Workflow,
            from: from.into(),
            to: to.into(),
            command: command.into(),
            context: context.clone(),
            success: true,
            reason: None,
            forced: false,
        }
    }

    /// A committed cycle transition.
    pub fn cycle(
        story_id: impl Into<String>,
        cycle_id: Option<Uuid>,
        from: impl Into<StateRef>,
        to: impl Into<StateRef>,
        command: impl Into<String>,
        context: &CommandContext,
    ) -> Self {
        Self {
            subject: Subject::Cycle {
                story_id: story_id.into(),
                cycle_id,
            },
            from: from.into(),
            to: to.into(),
            command: command.into(),
            context: context.clone(),
            success: true,
            reason: None,
            forced: false,
        }
    }

    /// Mark as denied: the state is unchanged and `reason` says why.
    #[must_use]
    pub fn denied(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.to = self.from;
        self.reason = Some(reason.into());
        self
    }

    /// Attach an audit reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Mark as forced.
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }
}

/// Durable sink that receives every record before it enters the history.
pub trait Journal: Send {
    /// Persist one record. An error aborts the append.
    fn write(&mut self, record: &TransitionRecord) -> Result<(), StorageError>;

    /// Persist records that commit together.
    fn write_batch(&mut self, records: &[TransitionRecord]) -> Result<(), StorageError> {
        for record in records {
            self.write(record)?;
        }
        Ok(())
    }
}

/// Journal writing one JSON object per line.
#[derive(Debug)]
pub struct JsonlJournal {
    path: PathBuf,
    file: File,
}

impl JsonlJournal {
    /// Open (creating if needed) a journal file for appending.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record from a journal file and verify the chain.
    pub fn read_all(path: &Path) -> Result<Vec<TransitionRecord>, StorageError> {
        let file = File::open(path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        verify_chain(&records)?;
        Ok(records)
    }
}

impl Journal for JsonlJournal {
    fn write(&mut self, record: &TransitionRecord) -> Result<(), StorageError> {
        self.write_batch(std::slice::from_ref(record))
    }

    fn write_batch(&mut self, records: &[TransitionRecord]) -> Result<(), StorageError> {
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }
        self.file.write_all(buf.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Check sequence numbering and digest links of `records`.
pub fn verify_chain(records: &[TransitionRecord]) -> Result<(), StorageError> {
    let mut prev_digest = GENESIS_DIGEST.to_string();
    for (index, record) in records.iter().enumerate() {
        let expected_sequence = index as u64 + 1;
        if record.sequence != expected_sequence {
            return Err(StorageError::Integrity {
                sequence: record.sequence,
                reason: format!("expected sequence {expected_sequence}"),
            });
        }
        if record.prev_digest != prev_digest {
            return Err(StorageError::Integrity {
                sequence: record.sequence,
                reason: "previous digest does not match".to_string(),
            });
        }
        if record.compute_digest()? != record.digest {
            return Err(StorageError::Integrity {
                sequence: record.sequence,
                reason: "record digest does not match its contents".to_string(),
            });
        }
        prev_digest.clone_from(&record.digest);
    }
    Ok(())
}

/// Transition history of one workflow instance.
#[derive(Default)]
pub struct TransitionHistory {
    records: Vec<TransitionRecord>,
    journal: Option<Box<dyn Journal>>,
}

impl fmt::Debug for TransitionHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionHistory")
            .field("records", &self.records.len())
            .field("journal", &self.journal.is_some())
            .finish()
    }
}

impl TransitionHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from stored records, verifying the chain.
    pub fn from_records(records: Vec<TransitionRecord>) -> Result<Self, StorageError> {
        verify_chain(&records)?;
        Ok(Self {
            records,
            journal: None,
        })
    }

    /// Send every future record to `journal` before appending it.
    pub fn set_journal(&mut self, journal: Box<dyn Journal>) {
        self.journal = Some(journal);
    }

    /// Append a record.
    ///
    /// Fails only when the journal cannot persist the record, in which case
    /// the history is unchanged.
    pub fn append(&mut self, pending: PendingRecord) -> Result<TransitionRecord, StorageError> {
        let mut records = self.append_all(vec![pending])?;
        Ok(records.remove(0))
    }

    /// Append records that commit together: all of them or none.
    pub fn append_all(
        &mut self,
        pending: Vec<PendingRecord>,
    ) -> Result<Vec<TransitionRecord>, StorageError> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let (mut sequence, mut prev_digest, floor) = match self.records.last() {
            Some(last) => (last.sequence, last.digest.clone(), Some(last.timestamp)),
            None => (0, GENESIS_DIGEST.to_string(), None),
        };
        // Timestamps never run backwards within one history.
        let now = Utc::now();
        let timestamp = floor.map_or(now, |floor| floor.max(now));

        let mut records = Vec::with_capacity(pending.len());
        for pending in pending {
            sequence += 1;
            let mut record = TransitionRecord {
                sequence,
                timestamp,
                subject: pending.subject,
                from: pending.from,
                to: pending.to,
                command: pending.command,
                context: pending.context,
                success: pending.success,
                reason: pending.reason,
                forced: pending.forced,
                prev_digest,
                digest: String::new(),
            };
            record.digest = record.compute_digest()?;
            prev_digest = record.digest.clone();
            records.push(record);
        }

        if let Some(journal) = self.journal.as_mut() {
            journal.write_batch(&records)?;
        }
        for record in &records {
            debug!(
                sequence = record.sequence,
                command = %record.command,
                success = record.success,
                "Appended transition record"
            );
        }
        self.records.extend(records.iter().cloned());
        Ok(records)
    }

    /// Every record, oldest first.
    pub fn records(&self) -> &[TransitionRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The last `limit` records, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<TransitionRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    /// Previously occupied workflow states, most recent first.
    ///
    /// Each state appears once, at its most recent occurrence. The state the
    /// history currently ends in is not an option.
    pub fn recovery_options(&self, limit: usize) -> Vec<RecoveryOption> {
        let changes: Vec<&TransitionRecord> = self
            .records
            .iter()
            .filter(|record| record.is_workflow_change())
            .collect();
        let Some(latest) = changes.last() else {
            return Vec::new();
        };
        let StateRef::Workflow(current) = latest.to else {
            return Vec::new();
        };

        let mut candidates: Vec<RecoveryOption> = changes
            .iter()
            .rev()
            .filter_map(|record| RecoveryOption::entered_by(record))
            .collect();
        // The state the first change left was occupied before any command.
        if let Some(first) = changes.first() {
            if let StateRef::Workflow(initial) = first.from {
                candidates.push(RecoveryOption {
                    state: initial,
                    command: None,
                    timestamp: first.timestamp,
                    reason: format!("initial state before {}", first.command),
                });
            }
        }

        let mut seen = vec![current];
        let mut options = Vec::new();
        for option in candidates {
            if options.len() == limit {
                break;
            }
            if seen.contains(&option.state) {
                continue;
            }
            seen.push(option.state);
            options.push(option);
        }
        options
    }
}

/// A state the workflow can be forced back into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOption {
    /// Previously occupied state.
    pub state: WorkflowState,
    /// Command that entered the state; `None` for the initial state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// When the state was entered.
    pub timestamp: DateTime<Utc>,
    /// Human-readable origin of the suggestion.
    pub reason: String,
}

impl RecoveryOption {
    fn entered_by(record: &TransitionRecord) -> Option<Self> {
        let StateRef::Workflow(state) = record.to else {
            return None;
        };
        let reason = match &record.reason {
            Some(reason) if record.forced => format!("forced by {}: {reason}", record.command),
            _ => format!("entered via {}", record.command),
        };
        Some(Self {
            state,
            command: Some(record.command.clone()),
            timestamp: record.timestamp,
            reason,
        })
    }
}

/// One line of a recovery report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentTransition {
    /// When it committed.
    pub timestamp: DateTime<Utc>,
    /// State before.
    pub from: StateRef,
    /// State after.
    pub to: StateRef,
    /// Command text or trigger name.
    pub command: String,
}

impl From<&TransitionRecord> for RecentTransition {
    fn from(record: &TransitionRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            from: record.from,
            to: record.to,
            command: record.command.clone(),
        }
    }
}

/// Answer to a recovery query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Current workflow state.
    pub current_state: WorkflowState,
    /// Committed transitions, most recent first.
    pub recent_transitions: Vec<RecentTransition>,
    /// States the workflow can be forced back into.
    pub recovery_options: Vec<RecoveryOption>,
}

impl RecoveryReport {
    /// Build a report from `history`.
    pub fn build(
        current_state: WorkflowState,
        history: &TransitionHistory,
        recent_limit: usize,
        options_limit: usize,
    ) -> Self {
        let recent_transitions = history
            .records()
            .iter()
            .rev()
            .filter(|record| record.success)
            .take(recent_limit)
            .map(RecentTransition::from)
            .collect();
        Self {
            current_state,
            recent_transitions,
            recovery_options: history.recovery_options(options_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TddState;
    use tempfile::TempDir;
    use WorkflowState::{BacklogReady, Idle, SprintActive, SprintPaused, SprintPlanned};

    fn change(from: WorkflowState, to: WorkflowState, command: &str) -> PendingRecord {
        PendingRecord::workflow(from, to, command, &CommandContext::new())
    }

    struct BrokenJournal;

    impl Journal for BrokenJournal {
        fn write(&mut self, _record: &TransitionRecord) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_append_assigns_sequence_and_chain() {
        let mut history = TransitionHistory::new();
        let first = history.append(change(Idle, BacklogReady, "/epic")).unwrap();
        let second = history
            .append(change(BacklogReady, SprintPlanned, "/sprint plan"))
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.prev_digest, GENESIS_DIGEST);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.prev_digest, first.digest);
        assert!(second.timestamp >= first.timestamp);
        assert!(verify_chain(history.records()).is_ok());
    }

    #[test]
    fn test_append_all_chains_batch() {
        let mut history = TransitionHistory::new();
        history.append(change(Idle, BacklogReady, "/epic")).unwrap();
        let batch = history
            .append_all(vec![
                change(BacklogReady, SprintPlanned, "/sprint plan"),
                change(SprintPlanned, SprintActive, "/sprint start"),
            ])
            .unwrap();
        assert_eq!(batch[0].sequence, 2);
        assert_eq!(batch[1].prev_digest, batch[0].digest);
        assert!(verify_chain(history.records()).is_ok());

        history.set_journal(Box::new(BrokenJournal));
        assert!(history
            .append_all(vec![change(SprintActive, SprintPaused, "/sprint pause")])
            .is_err());
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_denied_record_keeps_state() {
        let mut history = TransitionHistory::new();
        let record = history
            .append(change(SprintActive, SprintPlanned, "/sprint plan").denied("not legal"))
            .unwrap();
        assert!(!record.success);
        assert_eq!(record.from, record.to);
        assert_eq!(record.reason.as_deref(), Some("not legal"));
    }

    #[test]
    fn test_tampering_detected() {
        let mut history = TransitionHistory::new();
        history.append(change(Idle, BacklogReady, "/epic")).unwrap();
        history
            .append(change(BacklogReady, SprintPlanned, "/sprint plan"))
            .unwrap();

        let mut records = history.records().to_vec();
        records[0].command = "/feedback".to_string();
        assert!(matches!(
            TransitionHistory::from_records(records),
            Err(StorageError::Integrity { sequence: 1, .. })
        ));

        let mut records = history.records().to_vec();
        records.remove(0);
        assert!(TransitionHistory::from_records(records).is_err());
    }

    #[test]
    fn test_failed_journal_leaves_history_unchanged() {
        let mut history = TransitionHistory::new();
        history.append(change(Idle, BacklogReady, "/epic")).unwrap();
        history.set_journal(Box::new(BrokenJournal));

        let result = history.append(change(BacklogReady, SprintPlanned, "/sprint plan"));
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_recent_is_most_recent_first() {
        let mut history = TransitionHistory::new();
        history.append(change(Idle, BacklogReady, "/epic")).unwrap();
        history.append(change(BacklogReady, BacklogReady, "/approve")).unwrap();
        history
            .append(change(BacklogReady, SprintPlanned, "/sprint plan"))
            .unwrap();

        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].command, "/sprint plan");
        assert_eq!(recent[1].command, "/approve");
        assert_eq!(history.recent(10).len(), 3);
    }

    #[test]
    fn test_recovery_options_dedup_and_exclude_current() {
        let mut history = TransitionHistory::new();
        history.append(change(Idle, BacklogReady, "/epic")).unwrap();
        history
            .append(change(BacklogReady, SprintPlanned, "/sprint plan"))
            .unwrap();
        history
            .append(change(SprintPlanned, SprintActive, "/sprint start"))
            .unwrap();
        history
            .append(change(SprintActive, SprintPlanned, "force").forced().with_reason("undo"))
            .unwrap();
        history
            .append(change(SprintPlanned, SprintActive, "/sprint start"))
            .unwrap();
        history
            .append(PendingRecord::cycle(
                "AUTH-1",
                None,
                TddState::Design,
                TddState::TestRed,
                "/tdd design_complete AUTH-1",
                &CommandContext::new(),
            ))
            .unwrap();

        let options = history.recovery_options(10);
        let states: Vec<WorkflowState> = options.iter().map(|o| o.state).collect();
        assert_eq!(states, vec![SprintPlanned, BacklogReady, Idle]);
        assert!(options[0].reason.contains("undo"));
        assert_eq!(options[2].command, None);

        assert_eq!(history.recovery_options(1).len(), 1);
    }

    #[test]
    fn test_recovery_options_empty_history() {
        assert!(TransitionHistory::new().recovery_options(5).is_empty());
    }

    #[test]
    fn test_recovery_report_skips_denials() {
        let mut history = TransitionHistory::new();
        history.append(change(Idle, BacklogReady, "/epic")).unwrap();
        history
            .append(change(BacklogReady, SprintActive, "/sprint start").denied("not legal"))
            .unwrap();

        let report = RecoveryReport::build(BacklogReady, &history, 10, 5);
        assert_eq!(report.current_state, BacklogReady);
        assert_eq!(report.recent_transitions.len(), 1);
        assert_eq!(report.recent_transitions[0].command, "/epic");
        assert_eq!(report.recovery_options[0].state, Idle);
    }

    #[test]
    fn test_jsonl_journal_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("journal").join("history.jsonl");

        let mut history = TransitionHistory::new();
        history.set_journal(Box::new(JsonlJournal::open(&path).unwrap()));
        history.append(change(Idle, BacklogReady, "/epic")).unwrap();
        history
            .append(change(BacklogReady, SprintPlanned, "/sprint plan"))
            .unwrap();

        let records = JsonlJournal::read_all(&path).unwrap();
        assert_eq!(records, history.records());
    }
}
