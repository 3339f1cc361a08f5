mod common;

use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use tokenflow::dsl::builder::{NetBuilder, SpecificationBuilder};
use tokenflow::error::EngineError;
use tokenflow::runtime::marking::TokenStatus;
use tokenflow::runtime::net::{JoinType, SplitType};
use tokenflow::runtime::runner::{ExecutionStatus, NetRunner};

fn runner_for(net: NetBuilder, data: Map<String, Value>) -> NetRunner {
    let spec = common::compile(SpecificationBuilder::new("runner-test").net(net.build()).build());
    let root = spec.root().expect("root net");
    NetRunner::new(Uuid::new_v4(), Arc::clone(&root), data)
}

fn data(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn enabled(runner: &NetRunner) -> Vec<String> {
    runner.enabled().iter().cloned().collect()
}

/// input -> A -(and)-> B, C -> D(and join) -> output
fn parallel_net() -> NetBuilder {
    NetBuilder::new("main")
        .task("A").build()
        .task("B").build()
        .task("C").build()
        .task("D").join(JoinType::And).build()
        .flow("input", "A")
        .flow("A", "B")
        .flow("A", "C")
        .flow("B", "D")
        .flow("C", "D")
        .flow("D", "output")
}

#[test]
fn test_and_split_and_join() {
    let mut runner = runner_for(parallel_net(), Map::new());
    runner.start().unwrap();
    runner.continue_if_possible();
    assert_eq!(enabled(&runner), vec!["A"]);

    let fired = runner.fire_task("A", Map::new()).unwrap();
    assert_eq!(fired.consumed.len(), 1);
    assert_eq!(fired.produced.len(), 2);
    assert_eq!(runner.marking().count("c_A_B"), 1);
    assert_eq!(runner.marking().count("c_A_C"), 1);

    runner.continue_if_possible();
    assert_eq!(enabled(&runner), vec!["B", "C"]);

    runner.fire_task("B", Map::new()).unwrap();
    runner.continue_if_possible();
    // D waits for the C branch
    assert_eq!(enabled(&runner), vec!["C"]);
    assert!(!runner.is_task_enabled("D"));

    runner.fire_task("C", Map::new()).unwrap();
    runner.continue_if_possible();
    assert_eq!(enabled(&runner), vec!["D"]);

    let last = runner.fire_task("D", Map::new()).unwrap();
    assert_eq!(last.consumed.len(), 2);
    assert!(last.completed);
    assert!(runner.is_completed());
    assert_eq!(runner.marking().count("output"), 1);
    assert_eq!(runner.marking().total_tokens(), 1);
}

#[test]
fn test_token_conservation_and_lineage() {
    let mut runner = runner_for(parallel_net(), Map::new());
    let root = runner.start().unwrap();
    assert_eq!(runner.marking().total_tokens(), 1);

    let fired = runner.fire_task("A", Map::new()).unwrap();
    // consumed 1, produced 2
    assert_eq!(runner.marking().total_tokens(), 2);
    assert_eq!(fired.consumed, vec![root]);

    let child = fired.produced[0];
    assert_eq!(runner.tokens().get(&child).unwrap().parent, Some(root));
    assert_eq!(runner.tokens().lineage(&child), vec![child, root]);
    assert_eq!(runner.tokens().get(&root).unwrap().status, TokenStatus::Consumed);
    assert_eq!(runner.tokens().get(&root).unwrap().children.len(), 2);

    runner.fire_task("B", Map::new()).unwrap();
    assert_eq!(runner.marking().total_tokens(), 2);
    runner.fire_task("C", Map::new()).unwrap();
    runner.fire_task("D", Map::new()).unwrap();
    assert_eq!(runner.marking().total_tokens(), 1);
    assert_eq!(runner.tokens().live().count(), 1);
}

/// A(xor) -> B if x > 10, C if x > 5, otherwise D
fn xor_net(with_default: bool) -> NetBuilder {
    let net = NetBuilder::new("main")
        .task("A").split(SplitType::Xor).build()
        .task("B").build()
        .task("C").build()
        .task("D").build()
        .flow("input", "A")
        .flow_if("A", "B", "x > 10", 0)
        .flow_if("A", "C", "x > 5", 1);
    let net = if with_default {
        net.flow_default("A", "D")
    } else {
        net.flow_if("A", "D", "x < 0", 2)
    };
    net.flow("B", "output").flow("C", "output").flow("D", "output")
}

fn xor_target(x: i64, with_default: bool) -> String {
    let mut runner = runner_for(xor_net(with_default), data(json!({ "x": x })));
    runner.start().unwrap();
    runner.fire_task("A", Map::new()).unwrap();
    let marked: Vec<String> = runner.marking().marked().map(|(c, _)| c.clone()).collect();
    assert_eq!(marked.len(), 1, "xor split marks exactly one condition");
    marked[0].clone()
}

#[test]
fn test_xor_split_picks_first_true_predicate_by_ordering() {
    // both predicates hold; the lower ordering wins
    assert_eq!(xor_target(20, true), "c_A_B");
    assert_eq!(xor_target(7, true), "c_A_C");
}

#[test]
fn test_xor_split_is_deterministic() {
    for _ in 0..10 {
        assert_eq!(xor_target(20, true), "c_A_B");
    }
}

#[test]
fn test_xor_split_falls_back_to_default_then_first() {
    assert_eq!(xor_target(1, true), "c_A_D");
    // no default flow: the first postset flow is taken
    assert_eq!(xor_target(1, false), "c_A_B");
}

/// A(or) -> B if x > 1, C if x > 5; B, C -> E(or join) -> output
fn or_net() -> NetBuilder {
    NetBuilder::new("main")
        .task("A").split(SplitType::Or).build()
        .task("B").build()
        .task("C").build()
        .task("E").join(JoinType::Or).build()
        .flow("input", "A")
        .flow_if("A", "B", "x > 1", 0)
        .flow_if("A", "C", "x > 5", 1)
        .flow("B", "E")
        .flow("C", "E")
        .flow("E", "output")
}

#[test]
fn test_or_split_and_join_with_one_branch() {
    let mut runner = runner_for(or_net(), data(json!({ "x": 3 })));
    runner.start().unwrap();
    let fired = runner.fire_task("A", Map::new()).unwrap();
    assert_eq!(fired.produced.len(), 1);
    assert_eq!(runner.marking().count("c_A_B"), 1);
    assert_eq!(runner.marking().count("c_A_C"), 0);

    runner.fire_task("B", Map::new()).unwrap();
    runner.continue_if_possible();
    // nothing can reach c_C_E any more
    assert_eq!(enabled(&runner), vec!["E"]);
    assert!(runner.fire_task("E", Map::new()).unwrap().completed);
}

#[test]
fn test_or_join_waits_for_second_branch() {
    let mut runner = runner_for(or_net(), data(json!({ "x": 10 })));
    runner.start().unwrap();
    let fired = runner.fire_task("A", Map::new()).unwrap();
    assert_eq!(fired.produced.len(), 2);

    runner.fire_task("B", Map::new()).unwrap();
    runner.continue_if_possible();
    assert_eq!(enabled(&runner), vec!["C"]);
    assert!(!runner.is_task_enabled("E"));

    runner.fire_task("C", Map::new()).unwrap();
    runner.continue_if_possible();
    assert_eq!(enabled(&runner), vec!["E"]);
    let last = runner.fire_task("E", Map::new()).unwrap();
    assert_eq!(last.consumed.len(), 2);
    assert!(last.completed);
}

#[test]
fn test_or_split_without_true_predicate_takes_first_flow() {
    let mut runner = runner_for(or_net(), data(json!({ "x": 0 })));
    runner.start().unwrap();
    runner.fire_task("A", Map::new()).unwrap();
    assert_eq!(runner.marking().count("c_A_B"), 1);
    assert_eq!(runner.marking().total_tokens(), 1);
}

#[test]
fn test_cancellation_set_removes_tokens_and_busy_tasks() {
    let net = NetBuilder::new("main")
        .task("A").build()
        .task("B").cancels(&["C", "c_A_C"]).build()
        .task("C").build()
        .flow("input", "A")
        .flow("A", "B")
        .flow("A", "C")
        .flow("B", "output")
        .flow("C", "output");
    let mut runner = runner_for(net, Map::new());
    runner.start().unwrap();
    runner.fire_task("A", Map::new()).unwrap();
    runner.continue_if_possible();
    runner.begin_task("C").unwrap();

    let fired = runner.fire_task("B", Map::new()).unwrap();
    assert_eq!(fired.cancelled.len(), 1);
    assert_eq!(fired.cancelled_tasks, vec!["C"]);
    assert!(runner.busy().is_empty());
    assert_eq!(runner.marking().count("c_A_C"), 0);
    assert!(runner.is_completed());
    assert_eq!(
        runner.tokens().get(&fired.cancelled[0]).unwrap().status,
        TokenStatus::Cancelled
    );
}

#[test]
fn test_cancellation_set_naming_busy_task_cancels_held_tokens() {
    // C leads on to E, so a surviving token would enable both again
    let net = NetBuilder::new("main")
        .task("A").build()
        .task("B").cancels(&["C"]).build()
        .task("C").build()
        .task("E").build()
        .task("F").build()
        .flow("input", "A")
        .flow("A", "B")
        .flow("A", "C")
        .flow("B", "F")
        .flow("C", "E")
        .flow("E", "output")
        .flow("F", "output");
    let mut runner = runner_for(net, Map::new());
    runner.start().unwrap();
    runner.fire_task("A", Map::new()).unwrap();
    runner.continue_if_possible();
    runner.begin_task("C").unwrap();
    let held = runner.reserved("C")[0];

    let fired = runner.fire_task("B", Map::new()).unwrap();
    assert_eq!(fired.cancelled_tasks, vec!["C"]);
    assert_eq!(fired.cancelled, vec![held]);
    assert_eq!(runner.tokens().get(&held).unwrap().status, TokenStatus::Cancelled);
    assert!(runner.reserved("C").is_empty());

    let delta = runner.continue_if_possible();
    assert_eq!(delta.newly_enabled, vec!["F"]);
    assert!(!runner.is_task_enabled("C"));
    assert!(!runner.is_task_enabled("E"));
    assert_eq!(runner.marking().total_tokens(), 1);
}

#[test]
fn test_begin_takes_tokens_shared_with_other_tasks() {
    // A and B share the input condition without a deferred choice group
    let net = NetBuilder::new("main")
        .task("A").build()
        .task("B").build()
        .task("D").build()
        .flow("input", "A")
        .flow("input", "B")
        .flow("A", "D")
        .flow("B", "D")
        .flow("D", "output");
    let mut runner = runner_for(net, Map::new());
    runner.start().unwrap();
    runner.continue_if_possible();
    assert_eq!(enabled(&runner), vec!["A", "B"]);

    let disabled = runner.begin_task("A").unwrap();
    assert_eq!(disabled, vec!["B"]);
    assert!(runner.enabled().is_empty());
    assert!(runner.marking().is_empty());
    assert!(matches!(runner.begin_task("B"), Err(EngineError::InvalidFiring { .. })));
    assert!(!runner.is_deadlocked());

    let fired = runner.fire_task("A", Map::new()).unwrap();
    assert_eq!(fired.consumed.len(), 1);
    runner.continue_if_possible();
    assert_eq!(enabled(&runner), vec!["D"]);
    assert!(runner.fire_task("D", Map::new()).unwrap().completed);
}

#[test]
fn test_deferred_choice_withdraws_siblings() {
    let net = NetBuilder::new("main")
        .task("A").build()
        .task("B").build()
        .flow("input", "A")
        .flow("input", "B")
        .flow("A", "output")
        .flow("B", "output")
        .deferred_choice("pick", &["A", "B"]);
    let mut runner = runner_for(net, Map::new());
    runner.start().unwrap();
    runner.continue_if_possible();
    assert_eq!(enabled(&runner), vec!["A", "B"]);

    let withdrawn = runner.begin_task("B").unwrap();
    assert_eq!(withdrawn, vec!["A"]);
    assert!(runner.enabled().is_empty());
    assert!(runner.withdrawn().contains("A"));
    assert!(!runner.is_task_enabled("A"));
    assert!(matches!(runner.begin_task("A"), Err(EngineError::InvalidFiring { .. })));

    // the winner holds the input token while it works
    assert_eq!(runner.marking().count("input"), 0);
    assert_eq!(runner.reserved("B").len(), 1);
    let held = runner.reserved("B")[0];
    let fired = runner.fire_task("B", Map::new()).unwrap();
    assert_eq!(fired.consumed, vec![held]);
    assert!(fired.completed);
    assert!(runner.withdrawn().is_empty());
}

#[test]
fn test_register_deferred_choice_requires_shared_preset() {
    let mut runner = runner_for(parallel_net(), Map::new());
    assert!(runner.register_deferred_choice("bc", &["B", "C"]).is_err());
    assert!(runner.register_deferred_choice("unknown", &["Z"]).is_err());

    let net = NetBuilder::new("main")
        .task("A").build()
        .task("B").build()
        .flow("input", "A")
        .flow("input", "B")
        .flow("A", "output")
        .flow("B", "output");
    let mut runner = runner_for(net, Map::new());
    runner.register_deferred_choice("pick", &["A", "B"]).unwrap();
    runner.start().unwrap();
    runner.continue_if_possible();
    assert_eq!(runner.begin_task("A").unwrap(), vec!["B"]);
}

fn linear_net() -> NetBuilder {
    NetBuilder::new("main")
        .task("A").build()
        .task("B").build()
        .flow("input", "A")
        .flow("A", "B")
        .flow("B", "output")
}

#[test]
fn test_suspend_waits_for_busy_tasks() {
    let mut runner = runner_for(linear_net(), Map::new());
    runner.start().unwrap();
    runner.continue_if_possible();
    runner.begin_task("A").unwrap();

    assert_eq!(runner.suspend(), ExecutionStatus::Suspending);
    // a busy task may still finish
    runner.fire_task("A", Map::new()).unwrap();
    assert_eq!(runner.status(), ExecutionStatus::Suspended);

    let delta = runner.continue_if_possible();
    assert!(delta.newly_enabled.is_empty());
    assert!(matches!(runner.begin_task("B"), Err(EngineError::RunnerSuspended { .. })));

    let delta = runner.resume();
    assert_eq!(delta.newly_enabled, vec!["B"]);
    assert_eq!(runner.status(), ExecutionStatus::Normal);
    runner.begin_task("B").unwrap();
}

#[test]
fn test_suspend_without_busy_tasks_is_immediate() {
    let mut runner = runner_for(linear_net(), Map::new());
    runner.start().unwrap();
    assert_eq!(runner.suspend(), ExecutionStatus::Suspended);
    assert!(matches!(
        runner.fire_task("A", Map::new()),
        Err(EngineError::RunnerSuspended { .. })
    ));
}

#[test]
fn test_invalid_firing_leaves_marking_untouched() {
    let mut runner = runner_for(linear_net(), Map::new());
    runner.start().unwrap();
    let before = runner.marking().clone();

    assert!(matches!(
        runner.fire_task("B", Map::new()),
        Err(EngineError::InvalidFiring { .. })
    ));
    assert!(matches!(
        runner.fire_task("nope", Map::new()),
        Err(EngineError::TaskNotFound(_))
    ));
    assert!(matches!(runner.cancel_task("A"), Err(EngineError::InvalidFiring { .. })));
    assert_eq!(runner.marking(), &before);

    assert!(runner.start().is_err(), "a runner starts once");
}

#[test]
fn test_completed_runner_rejects_firing() {
    let mut runner = runner_for(linear_net(), Map::new());
    runner.start().unwrap();
    runner.fire_task("A", Map::new()).unwrap();
    runner.fire_task("B", Map::new()).unwrap();
    assert!(runner.is_completed());
    assert!(runner.fire_task("A", Map::new()).is_err());
}

#[test]
fn test_cancel_task_aborts_busy_task() {
    let mut runner = runner_for(linear_net(), Map::new());
    runner.start().unwrap();
    runner.begin_task("A").unwrap();
    let aborted = runner.cancel_task("A").unwrap();
    assert_eq!(aborted.cancelled.len(), 1);
    assert!(aborted.produced.is_empty());
    assert!(runner.marking().is_empty());
    assert!(runner.busy().is_empty());
    // no tokens left, so this is not a deadlock
    assert!(!runner.is_deadlocked());
}

#[test]
fn test_firing_merges_data_into_runner() {
    let mut runner = runner_for(linear_net(), data(json!({ "amount": 5 })));
    runner.start().unwrap();
    runner
        .fire_task("A", data(json!({ "approved": true })))
        .unwrap();
    assert_eq!(runner.data().get("approved"), Some(&json!(true)));
    assert_eq!(runner.data().get("amount"), Some(&json!(5)));
}

#[test]
fn test_and_join_starved_by_xor_is_deadlock() {
    let net = NetBuilder::new("main")
        .task("A").split(SplitType::Xor).build()
        .task("B").build()
        .task("C").build()
        .task("D").join(JoinType::And).build()
        .flow("input", "A")
        .flow_if("A", "B", "true", 0)
        .flow_default("A", "C")
        .flow("B", "D")
        .flow("C", "D")
        .flow("D", "output");
    let mut runner = runner_for(net, Map::new());
    runner.start().unwrap();
    runner.fire_task("A", Map::new()).unwrap();
    runner.fire_task("B", Map::new()).unwrap();
    let delta = runner.continue_if_possible();
    assert!(!delta.active);
    assert!(runner.is_deadlocked());
    assert_eq!(runner.stranded_tasks(), vec!["D"]);
}

#[test]
fn test_cancel_runner_clears_everything() {
    let mut runner = runner_for(parallel_net(), Map::new());
    runner.start().unwrap();
    runner.fire_task("A", Map::new()).unwrap();
    runner.continue_if_possible();
    runner.begin_task("B").unwrap();

    let removed = runner.cancel();
    assert_eq!(removed.len(), 2);
    assert!(runner.marking().is_empty());
    assert!(runner.enabled().is_empty());
    assert!(runner.busy().is_empty());
}

#[test]
fn test_snapshot_round_trips_through_json() {
    let mut runner = runner_for(parallel_net(), Map::new());
    runner.start().unwrap();
    runner.fire_task("A", Map::new()).unwrap();
    runner.continue_if_possible();

    let snapshot = runner.snapshot();
    let json = serde_json::to_string(&snapshot).unwrap();
    let back: tokenflow::runtime::runner::RunnerSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(back.marking, snapshot.marking);
    assert_eq!(back.enabled, snapshot.enabled);
    assert_eq!(back.net_id, "main");
}
