//! Property-based tests for the workflow engine
//!
//! These tests drive instances through random command sequences and check
//! the invariants that must hold after every step.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    use crate::config::EngineConfig;
    use crate::context::{CiStatus, CommandContext};
    use crate::events::NullEmitter;
    use crate::guard::Trigger;
    use crate::outcome::Outcome;
    use crate::persistence::{Snapshot, StorageError};
    use crate::registry::{CycleRegistry, RegistryError};
    use crate::state::WorkflowState;
    use crate::workflow::{Applied, ApplyOutcome, WorkflowInstance};

    /// One request against an instance.
    #[derive(Debug, Clone)]
    enum Step {
        Command(String, CommandContext),
        CiFailures(String, u32),
        AllTasksDone,
    }

    // ===== STRATEGY HELPERS =====

    fn any_story() -> impl Strategy<Value = String> {
        prop_oneof![Just("AUTH-1"), Just("AUTH-2"), Just("AUTH-3")].prop_map(str::to_string)
    }

    fn any_context() -> impl Strategy<Value = CommandContext> {
        (
            prop_oneof![
                Just(None),
                Just(Some(CiStatus::Passing)),
                Just(Some(CiStatus::Failing)),
                Just(Some(CiStatus::Unknown)),
            ],
            prop::option::of(any::<bool>()),
            prop::option::of(prop::num::f64::NORMAL | prop::num::f64::SUBNORMAL),
        )
            .prop_map(|(ci_status, uncommitted_changes, measure)| {
                let mut context = CommandContext {
                    ci_status,
                    uncommitted_changes,
                    ..CommandContext::default()
                };
                if let Some(measure) = measure {
                    context
                        .extensions
                        .insert("measure".to_string(), serde_json::Value::from(measure));
                }
                context
            })
    }

    fn any_workflow_text() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("/epic Checkout"),
            Just("/approve"),
            Just("/backlog"),
            Just("/backlog add_story Login page"),
            Just("/sprint plan AUTH-1 AUTH-2"),
            Just("/sprint plan AUTH-1 AUTH-2 AUTH-3"),
            Just("/sprint start"),
            Just("/sprint status"),
            Just("/sprint pause"),
            Just("/sprint resume"),
            Just("/request_changes"),
            Just("/suggest_fix retry with a mock"),
            Just("/skip_task"),
            Just("/feedback looks good"),
            Just("/state"),
            Just("/dance"),
        ]
        .prop_map(str::to_string)
    }

    fn any_tdd_text() -> impl Strategy<Value = String> {
        let action = prop_oneof![
            Just("start"),
            Just("status"),
            Just("design_complete"),
            Just("tests_ready"),
            Just("code_green"),
            Just("refactor_done"),
            Just("commit"),
            Just("tests_broken"),
            Just("need_more_tests"),
            Just("requirements_unclear"),
            Just("review_cycle"),
            Just("skip_phase"),
            Just("pause"),
            Just("resume"),
        ];
        (action, any_story()).prop_map(|(action, story)| format!("/tdd {action} {story} because"))
    }

    fn any_step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (any_workflow_text(), any_context())
                .prop_map(|(text, ctx)| Step::Command(text, ctx)),
            6 => any_tdd_text().prop_map(|text| Step::Command(text, CommandContext::new())),
            1 => (any_story(), 0u32..5).prop_map(|(story, n)| Step::CiFailures(story, n)),
            1 => Just(Step::AllTasksDone),
        ]
    }

    fn any_steps() -> impl Strategy<Value = Vec<Step>> {
        prop::collection::vec(any_step(), 0..40)
    }

    fn any_query() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("/sprint status"),
            Just("/tdd status"),
            Just("/tdd status AUTH-1"),
            Just("/backlog"),
            Just("/backlog view"),
            Just("/backlog add_story Search"),
            Just("/backlog prioritize AUTH-2 first"),
            Just("/state"),
        ]
        .prop_map(str::to_string)
    }

    // ===== HELPERS =====

    /// Outcome with the random parts (cycle ids, sequence numbers) removed.
    fn fingerprint(outcome: &ApplyOutcome) -> String {
        match outcome {
            Outcome::Allowed(Applied::Workflow(t)) => format!("workflow {}->{}", t.from, t.to),
            Outcome::Allowed(Applied::Tdd(t)) => format!("tdd {} {}->{}", t.story_id, t.from, t.to),
            Outcome::Allowed(Applied::Cycles(statuses)) => statuses
                .iter()
                .map(|s| format!("{}={}", s.story_id, s.state))
                .collect::<Vec<_>>()
                .join(","),
            Outcome::Denied(denial) => format!("denied {denial:?}"),
        }
    }

    fn run(instance: &WorkflowInstance, step: &Step) -> Result<String, StorageError> {
        match step {
            Step::Command(text, ctx) => instance.apply(text, ctx).map(|o| fingerprint(&o)),
            Step::CiFailures(story, consecutive) => {
                let trigger = Trigger::CiFailures {
                    story_id: story.clone(),
                    consecutive: *consecutive,
                };
                instance
                    .fire(&trigger, &CommandContext::new())
                    .map(|o| fingerprint(&o.map(Applied::Workflow)))
            }
            Step::AllTasksDone => instance
                .fire(&Trigger::AllTasksDone, &CommandContext::new())
                .map(|o| fingerprint(&o.map(Applied::Workflow))),
        }
    }

    fn cycle_states(instance: &WorkflowInstance) -> Vec<String> {
        instance
            .registry()
            .cycles()
            .iter()
            .map(|c| format!("{}={}", c.story_id, c.state))
            .collect()
    }

    fn restore(snapshot: Snapshot) -> WorkflowInstance {
        WorkflowInstance::restore(snapshot, EngineConfig::default(), Arc::new(NullEmitter)).unwrap()
    }

    // ===== DETERMINISM TESTS =====

    proptest! {
        /// Property: the same sequence from a fresh instance yields the same outcomes
        #[test]
        fn test_apply_is_deterministic(steps in any_steps()) {
            let left = WorkflowInstance::with_defaults("shop");
            let right = WorkflowInstance::with_defaults("shop");
            for step in &steps {
                prop_assert_eq!(run(&left, step).unwrap(), run(&right, step).unwrap());
                prop_assert_eq!(left.state(), right.state());
            }
            prop_assert_eq!(cycle_states(&left), cycle_states(&right));
        }

        /// Property: replaying one step from the same snapshot yields the same outcome
        #[test]
        fn test_replay_from_snapshot(steps in any_steps(), next in any_step()) {
            let instance = WorkflowInstance::with_defaults("shop");
            for step in &steps {
                run(&instance, step).unwrap();
            }
            let snapshot = instance.snapshot();
            let first = restore(snapshot.clone());
            let second = restore(snapshot);
            prop_assert_eq!(run(&first, &next).unwrap(), run(&second, &next).unwrap());
            prop_assert_eq!(first.state(), second.state());
            prop_assert_eq!(cycle_states(&first), cycle_states(&second));
        }
    }

    // ===== IDEMPOTENCY TESTS =====

    proptest! {
        /// Property: status and backlog commands never change any state
        #[test]
        fn test_queries_never_change_state(
            steps in any_steps(),
            queries in prop::collection::vec(any_query(), 1..10)
        ) {
            let instance = WorkflowInstance::with_defaults("shop");
            for step in &steps {
                run(&instance, step).unwrap();
            }
            let state = instance.state();
            let cycles = instance.registry().cycles();
            for query in &queries {
                instance.apply(query, &CommandContext::new()).unwrap();
                prop_assert_eq!(instance.state(), state);
                prop_assert_eq!(&instance.registry().cycles(), &cycles);
            }
        }
    }

    // ===== ROUND-TRIP TESTS =====

    proptest! {
        /// Property: a restored snapshot matches the original instance
        #[test]
        fn test_snapshot_roundtrip(steps in any_steps()) {
            let instance = WorkflowInstance::with_defaults("shop");
            for step in &steps {
                run(&instance, step).unwrap();
            }
            let json = instance.snapshot().to_json().unwrap();
            let restored = restore(Snapshot::from_json(&json).unwrap());
            prop_assert_eq!(restored.state(), instance.state());
            prop_assert_eq!(restored.registry().cycles(), instance.registry().cycles());
            prop_assert_eq!(restored.records(), instance.records());
        }
    }

    // ===== INVARIANT TESTS =====

    proptest! {
        /// Property: review and idle are never entered while a cycle is live
        #[test]
        fn test_no_quiescent_state_with_live_cycles(steps in any_steps()) {
            let instance = WorkflowInstance::with_defaults("shop");
            for step in &steps {
                let before = instance.state();
                run(&instance, step).unwrap();
                let after = instance.state();
                if after != before && after.requires_quiescent_registry() {
                    prop_assert!(instance.summary().all_terminal);
                }
            }
        }

        /// Property: "all tasks done" is denied while any cycle is not DONE
        #[test]
        fn test_review_denied_with_active_cycles(steps in any_steps()) {
            let instance = WorkflowInstance::with_defaults("shop");
            for step in &steps {
                run(&instance, step).unwrap();
            }
            if !instance.summary().all_terminal {
                let outcome = instance
                    .fire(&Trigger::AllTasksDone, &CommandContext::new())
                    .unwrap();
                prop_assert!(outcome.is_denied());
                prop_assert_ne!(instance.state(), WorkflowState::SprintReview);
            }
        }

        /// Property: every history record chains onto the previous one
        #[test]
        fn test_history_chain_holds(steps in any_steps()) {
            let instance = WorkflowInstance::with_defaults("shop");
            for step in &steps {
                run(&instance, step).unwrap();
            }
            let records = instance.records();
            prop_assert!(crate::history::verify_chain(&records).is_ok());
            for (i, record) in records.iter().enumerate() {
                prop_assert_eq!(record.sequence, i as u64 + 1);
            }
        }

        /// Property: the registry never holds two cycles for one story
        #[test]
        fn test_registry_matches_set_model(
            ops in prop::collection::vec((any::<bool>(), any_story()), 0..50)
        ) {
            let registry = CycleRegistry::new();
            let mut model = BTreeSet::new();
            for (register, story) in ops {
                if register {
                    let result = registry.register(&story);
                    if model.insert(story.clone()) {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert_eq!(result, Err(RegistryError::DuplicateCycle(story)));
                    }
                } else {
                    let result = registry.unregister(&story);
                    prop_assert_eq!(result.is_ok(), model.remove(&story));
                }
                prop_assert_eq!(registry.summary().ids, model.iter().cloned().collect::<Vec<_>>());
            }
        }
    }
}
