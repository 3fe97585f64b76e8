//! Storage faults, snapshots and the history journal.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cadence_engine::{
    CommandContext, EngineConfig, FileStore, Journal, JsonlJournal, MemoryEmitter, NullEmitter,
    Snapshot, SnapshotStore, StorageError, TddState, TransitionRecord, WorkflowInstance,
    WorkflowState,
};

/// Journal that fails every write while its switch is on.
struct FlakyJournal {
    failing: Arc<AtomicBool>,
}

impl Journal for FlakyJournal {
    fn write(&mut self, _record: &TransitionRecord) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::other("disk full")));
        }
        Ok(())
    }
}

fn flaky(instance: &WorkflowInstance) -> Arc<AtomicBool> {
    let failing = Arc::new(AtomicBool::new(false));
    instance.set_journal(Box::new(FlakyJournal {
        failing: Arc::clone(&failing),
    }));
    failing
}

fn manual_review() -> EngineConfig {
    EngineConfig {
        auto_review_on_completion: false,
        ..EngineConfig::default()
    }
}

fn active(instance: &WorkflowInstance) {
    let ctx = CommandContext::new();
    instance.apply("/epic", &ctx).unwrap();
    instance.apply("/sprint plan AUTH-1 AUTH-2", &ctx).unwrap();
    instance.apply("/sprint start", &ctx).unwrap();
}

#[test]
fn test_storage_fault_propagates_and_commits_nothing() {
    let emitter = Arc::new(MemoryEmitter::new());
    let instance = WorkflowInstance::new("accounts", manual_review(), emitter.clone());
    let failing = flaky(&instance);
    instance.apply("/epic", &CommandContext::new()).unwrap();
    instance.apply("/sprint plan AUTH-1 AUTH-2", &CommandContext::new()).unwrap();

    failing.store(true, Ordering::SeqCst);
    let events = emitter.events().len();
    let records = instance.records().len();

    let err = instance.apply("/sprint start", &CommandContext::new()).unwrap_err();
    assert!(matches!(err, StorageError::Io(_)));
    assert_eq!(instance.state(), WorkflowState::SprintPlanned);
    assert!(instance.registry().is_empty());
    assert_eq!(instance.records().len(), records);
    assert_eq!(emitter.events().len(), events);

    // Denials are recorded too, so they surface the fault instead of hiding it.
    assert!(instance.apply("/feedback", &CommandContext::new()).is_err());

    failing.store(false, Ordering::SeqCst);
    assert!(instance.apply("/sprint start", &CommandContext::new()).unwrap().is_allowed());
    assert_eq!(instance.registry().len(), 2);
}

#[test]
fn test_storage_fault_rolls_back_fan_out() {
    let instance = WorkflowInstance::new("accounts", manual_review(), Arc::new(NullEmitter));
    active(&instance);
    instance.apply("/tdd design_complete AUTH-1", &CommandContext::new()).unwrap();
    let before = instance.registry().cycles();

    let failing = flaky(&instance);
    failing.store(true, Ordering::SeqCst);
    assert!(instance.apply("/sprint pause", &CommandContext::new()).is_err());

    assert_eq!(instance.state(), WorkflowState::SprintActive);
    assert_eq!(instance.registry().cycles(), before);
}

#[test]
fn test_storage_fault_restores_cycle() {
    let instance = WorkflowInstance::new("accounts", manual_review(), Arc::new(NullEmitter));
    active(&instance);
    let failing = flaky(&instance);
    failing.store(true, Ordering::SeqCst);

    assert!(instance.apply("/tdd design_complete AUTH-1", &CommandContext::new()).is_err());
    assert_eq!(instance.registry().get("AUTH-1").unwrap().state, TddState::Design);

    assert!(instance.abort("AUTH-2", "descoped").is_err());
    assert!(instance.registry().contains("AUTH-2"));

    // A story joining mid-sprint is discarded again.
    assert!(instance.apply("/tdd start AUTH-7", &CommandContext::new()).is_err());
    assert!(!instance.registry().contains("AUTH-7"));

    assert!(instance.force(WorkflowState::Idle, "reset").is_err());
    assert_eq!(instance.state(), WorkflowState::SprintActive);
    assert_eq!(instance.registry().len(), 2);
}

#[test]
fn test_file_store_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let store = FileStore::new(temp.path()).unwrap();

    let instance = WorkflowInstance::with_defaults("accounts");
    active(&instance);
    instance.apply("/tdd design_complete AUTH-2", &CommandContext::new()).unwrap();
    store.save(&instance.snapshot()).unwrap();

    assert!(store.exists("accounts"));
    assert_eq!(store.list().unwrap(), vec!["accounts".to_string()]);

    let snapshot = store.load("accounts").unwrap();
    let restored =
        WorkflowInstance::restore(snapshot, EngineConfig::default(), Arc::new(NullEmitter))
            .unwrap();
    assert_eq!(restored.state(), WorkflowState::SprintActive);
    assert_eq!(restored.registry().cycles(), instance.registry().cycles());
    assert_eq!(restored.planned_scope(), instance.planned_scope());

    store.delete("accounts").unwrap();
    assert!(matches!(store.load("accounts"), Err(StorageError::NotFound(_))));
}

#[test]
fn test_corrupt_snapshot_is_a_fault() {
    let temp = tempfile::tempdir().unwrap();
    let store = FileStore::new(temp.path()).unwrap();
    let instance = WorkflowInstance::with_defaults("accounts");
    active(&instance);

    let mut snapshot = instance.snapshot();
    snapshot.history[1].command = "/approve".to_string();
    store.save(&snapshot).unwrap();

    let loaded = store.load("accounts").unwrap();
    let err = WorkflowInstance::restore(loaded, EngineConfig::default(), Arc::new(NullEmitter))
        .unwrap_err();
    assert!(matches!(err, StorageError::Integrity { sequence: 2, .. }));
}

#[test]
fn test_float_context_survives_snapshot_reload() {
    let context =
        CommandContext::from_json(r#"{"x": 1.2345678901234567e-300, "ratio": 0.1}"#).unwrap();
    let instance = WorkflowInstance::with_defaults("accounts");
    instance.apply("/epic", &context).unwrap();
    instance.apply("/state", &context).unwrap();
    instance.apply("/dance", &context).unwrap();

    let json = instance.snapshot().to_json().unwrap();
    let snapshot = Snapshot::from_json(&json).unwrap();
    let restored =
        WorkflowInstance::restore(snapshot, EngineConfig::default(), Arc::new(NullEmitter))
            .unwrap();
    assert_eq!(restored.records(), instance.records());
    assert_eq!(restored.snapshot().to_json().unwrap(), json);
}

#[test]
fn test_jsonl_journal_mirrors_history() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("accounts.jsonl");

    let instance = WorkflowInstance::with_defaults("accounts");
    instance.set_journal(Box::new(JsonlJournal::open(&path).unwrap()));
    active(&instance);
    instance.apply("/sprint plan", &CommandContext::new()).unwrap();

    let journal = JsonlJournal::read_all(&path).unwrap();
    assert_eq!(journal, instance.records());
    assert!(journal.iter().any(|record| !record.success));
}
