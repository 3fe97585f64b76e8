//! Concurrent access to one workflow instance and to separate projects.

use std::sync::{Arc, Barrier};
use std::thread;

use cadence_engine::{
    CommandContext, EngineConfig, MemoryEmitter, NullEmitter, Projects, TddState, TransitionEvent,
    WorkflowInstance, WorkflowState,
};

const STORIES: [&str; 8] = [
    "AUTH-1", "AUTH-2", "AUTH-3", "AUTH-4", "AUTH-5", "AUTH-6", "AUTH-7", "AUTH-8",
];

const TO_DONE: [&str; 5] = [
    "design_complete",
    "tests_ready",
    "code_green",
    "refactor_done",
    "commit",
];

fn active_instance(config: EngineConfig, emitter: Arc<MemoryEmitter>) -> Arc<WorkflowInstance> {
    let instance = Arc::new(WorkflowInstance::new("accounts", config, emitter));
    let ctx = CommandContext::new();
    instance.apply("/epic", &ctx).unwrap();
    instance
        .apply(&format!("/sprint plan {}", STORIES.join(" ")), &ctx)
        .unwrap();
    assert!(instance.apply("/sprint start", &ctx).unwrap().is_allowed());
    instance
}

#[test]
fn test_stories_progress_in_parallel() {
    let emitter = Arc::new(MemoryEmitter::new());
    let instance = active_instance(EngineConfig::default(), emitter.clone());
    let barrier = Arc::new(Barrier::new(STORIES.len()));

    let handles: Vec<_> = STORIES
        .iter()
        .map(|story| {
            let instance = Arc::clone(&instance);
            let barrier = Arc::clone(&barrier);
            let story = (*story).to_string();
            thread::spawn(move || {
                barrier.wait();
                for action in TO_DONE {
                    let outcome = instance
                        .apply(&format!("/tdd {action} {story}"), &CommandContext::new())
                        .unwrap();
                    assert!(outcome.is_allowed(), "{story} {action}: {outcome:?}");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(instance.registry().is_empty());
    assert_eq!(instance.state(), WorkflowState::SprintReview);

    // The history is one total order and every story reached DONE once.
    let records = instance.records();
    assert!(cadence_engine::history::verify_chain(&records).is_ok());
    let done = emitter
        .events()
        .into_iter()
        .filter(|event| matches!(event, TransitionEvent::Tdd(e) if e.new_state == TddState::Done))
        .count();
    assert_eq!(done, STORIES.len());
}

#[test]
fn test_events_follow_history_order_under_contention() {
    let config = EngineConfig {
        auto_review_on_completion: false,
        ..EngineConfig::default()
    };
    for _ in 0..20 {
        let emitter = Arc::new(MemoryEmitter::new());
        let instance = active_instance(config.clone(), emitter.clone());
        let barrier = Arc::new(Barrier::new(STORIES.len()));

        let handles: Vec<_> = STORIES
            .iter()
            .map(|story| {
                let instance = Arc::clone(&instance);
                let barrier = Arc::clone(&barrier);
                let story = (*story).to_string();
                thread::spawn(move || {
                    barrier.wait();
                    for action in &TO_DONE[..4] {
                        instance
                            .apply(&format!("/tdd {action} {story}"), &CommandContext::new())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let committed: Vec<u64> = instance
            .records()
            .iter()
            .filter(|record| record.success)
            .map(|record| record.sequence)
            .collect();
        let emitted: Vec<u64> = emitter
            .events()
            .iter()
            .map(|event| match event {
                TransitionEvent::Workflow(e) => e.sequence,
                TransitionEvent::Tdd(e) => e.sequence,
            })
            .collect();
        assert_eq!(emitted, committed);
    }
}

#[test]
fn test_same_story_is_serialized() {
    let config = EngineConfig {
        auto_review_on_completion: false,
        ..EngineConfig::default()
    };
    let instance = active_instance(config, Arc::new(MemoryEmitter::new()));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    // Every thread races the same forward command; exactly one may win.
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let instance = Arc::clone(&instance);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                instance
                    .apply("/tdd design_complete AUTH-1", &CommandContext::new())
                    .unwrap()
                    .is_allowed()
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|allowed| *allowed)
        .count();

    assert_eq!(wins, 1);
    assert_eq!(instance.registry().get("AUTH-1").unwrap().state, TddState::TestRed);
}

#[test]
fn test_pause_is_atomic_with_concurrent_tdd_commands() {
    let config = EngineConfig {
        auto_review_on_completion: false,
        ..EngineConfig::default()
    };
    let instance = active_instance(config, Arc::new(MemoryEmitter::new()));
    let barrier = Arc::new(Barrier::new(STORIES.len() + 1));

    let workers: Vec<_> = STORIES
        .iter()
        .map(|story| {
            let instance = Arc::clone(&instance);
            let barrier = Arc::clone(&barrier);
            let story = (*story).to_string();
            thread::spawn(move || {
                barrier.wait();
                for action in ["design_complete", "tests_ready"] {
                    instance
                        .apply(&format!("/tdd {action} {story}"), &CommandContext::new())
                        .unwrap();
                }
            })
        })
        .collect();

    barrier.wait();
    let paused = instance.apply("/sprint pause", &CommandContext::new()).unwrap();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(paused.is_allowed());
    assert_eq!(instance.state(), WorkflowState::SprintPaused);
    // No cycle escaped the fan-out.
    for cycle in instance.registry().cycles() {
        assert_eq!(cycle.state, TddState::Paused, "{} escaped the pause", cycle.story_id);
    }
}

#[test]
fn test_workflow_commands_are_serialized() {
    let instance = Arc::new(WorkflowInstance::with_defaults("accounts"));
    instance.apply("/epic", &CommandContext::new()).unwrap();
    let barrier = Arc::new(Barrier::new(4));

    // Only one plan can commit from BACKLOG_READY.
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let instance = Arc::clone(&instance);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                instance
                    .apply(&format!("/sprint plan STORY-{i}"), &CommandContext::new())
                    .unwrap()
                    .is_allowed()
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|allowed| *allowed)
        .count();

    assert_eq!(wins, 1);
    assert_eq!(instance.planned_scope().len(), 1);
    assert_eq!(instance.records().len(), 5);
}

#[test]
fn test_projects_run_independently() {
    let projects = Arc::new(Projects::new(EngineConfig::default(), Arc::new(NullEmitter)));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let projects = Arc::clone(&projects);
            thread::spawn(move || {
                let instance = projects.register(&format!("project-{i}")).unwrap();
                let ctx = CommandContext::new();
                instance.apply("/epic", &ctx).unwrap();
                instance.apply("/sprint plan AUTH-1", &ctx).unwrap();
                instance.apply("/sprint start", &ctx).unwrap();
                for action in TO_DONE {
                    instance.apply(&format!("/tdd {action} AUTH-1"), &ctx).unwrap();
                }
                instance.state()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), WorkflowState::SprintReview);
    }
    assert_eq!(projects.ids().len(), 4);
}

#[tokio::test]
async fn test_channel_emitter_delivers_in_commit_order() {
    let (emitter, mut rx) = cadence_engine::ChannelEmitter::channel();
    let instance = WorkflowInstance::new("accounts", EngineConfig::default(), Arc::new(emitter));
    let ctx = CommandContext::new();
    instance.apply("/epic", &ctx).unwrap();
    instance.apply("/sprint plan AUTH-1", &ctx).unwrap();
    drop(instance);

    let mut states = Vec::new();
    while let Some(event) = rx.recv().await {
        if let TransitionEvent::Workflow(e) = event {
            states.push(e.new_state);
        }
    }
    assert_eq!(states, vec![WorkflowState::BacklogReady, WorkflowState::SprintPlanned]);
}
