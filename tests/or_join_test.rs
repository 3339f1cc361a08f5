mod common;

use std::collections::BTreeSet;

use uuid::Uuid;

use tokenflow::dsl::builder::{NetBuilder, SpecificationBuilder};
use tokenflow::runtime::marking::Marking;
use tokenflow::runtime::net::{JoinType, Net, SplitType};
use tokenflow::runtime::or_join::{analyze, analyze_with_busy, is_or_join_enabled};

fn net(builder: NetBuilder) -> std::sync::Arc<Net> {
    common::compile(SpecificationBuilder::new("or-join").net(builder.build()).build())
        .root()
        .expect("root net")
}

fn marking(conditions: &[&str]) -> Marking {
    let mut m = Marking::new();
    for c in conditions {
        m.put(c, Uuid::new_v4());
    }
    m
}

/// A(or) -> B, C; B -> E; C -> X -> E; E is the OR-join.
fn diamond() -> std::sync::Arc<Net> {
    net(NetBuilder::new("main")
        .task("A").split(SplitType::Or).build()
        .task("B").build()
        .task("C").build()
        .task("X").build()
        .task("E").join(JoinType::Or).build()
        .flow("input", "A")
        .flow("A", "B")
        .flow("A", "C")
        .flow("B", "E")
        .flow("C", "X")
        .flow("X", "E")
        .flow("E", "output"))
}

#[test]
fn test_or_join_needs_a_marked_preset_condition() {
    let net = diamond();
    assert!(!is_or_join_enabled(&net, &marking(&[]), "E"));
    assert!(!is_or_join_enabled(&net, &marking(&["c_A_B"]), "E"));
}

#[test]
fn test_or_join_fires_when_other_branch_is_dead() {
    let net = diamond();
    let verdict = analyze(&net, &marking(&["c_B_E"]), "E");
    assert!(verdict.enabled);
    assert!(verdict.awaiting.is_empty());
}

#[test]
fn test_or_join_waits_for_token_upstream() {
    let net = diamond();
    // the C branch is two steps away from the join
    for upstream in ["c_A_C", "c_C_X"] {
        let verdict = analyze(&net, &marking(&["c_B_E", upstream]), "E");
        assert!(!verdict.enabled, "token at {} can still arrive", upstream);
        assert_eq!(verdict.awaiting, vec!["c_X_E".to_string()]);
    }
}

#[test]
fn test_or_join_waits_for_busy_producer() {
    let net = diamond();
    // X started and holds the only token of its branch
    let busy: BTreeSet<String> = ["X".to_string()].into_iter().collect();
    let verdict = analyze_with_busy(&net, &marking(&["c_B_E"]), &busy, "E");
    assert!(!verdict.enabled);
    assert_eq!(verdict.awaiting, vec!["c_X_E".to_string()]);

    // C busy upstream of X keeps the join waiting too
    let busy: BTreeSet<String> = ["C".to_string()].into_iter().collect();
    assert!(!analyze_with_busy(&net, &marking(&["c_B_E"]), &busy, "E").enabled);
    assert!(analyze_with_busy(&net, &marking(&["c_B_E"]), &BTreeSet::new(), "E").enabled);
}

#[test]
fn test_or_join_with_every_preset_marked() {
    let net = diamond();
    assert!(is_or_join_enabled(&net, &marking(&["c_B_E", "c_X_E"]), "E"));
}

#[test]
fn test_or_join_respects_and_join_upstream() {
    // F needs both d1 and d2 before it can feed the join
    let net = net(NetBuilder::new("main")
        .condition("d1")
        .condition("d2")
        .task("A").split(SplitType::Or).build()
        .task("B").build()
        .task("F").join(JoinType::And).build()
        .task("E").join(JoinType::Or).build()
        .flow("input", "A")
        .flow("A", "B")
        .flow("A", "d1")
        .flow("A", "d2")
        .flow("d1", "F")
        .flow("d2", "F")
        .flow("B", "E")
        .flow("F", "E")
        .flow("E", "output"));

    // only d1 is marked and nothing can produce d2 any more
    assert!(is_or_join_enabled(&net, &marking(&["c_B_E", "d1"]), "E"));
    assert!(!is_or_join_enabled(&net, &marking(&["c_B_E", "d1", "d2"]), "E"));
}

#[test]
fn test_or_join_ignores_loops_through_itself() {
    // E feeds back into B; the path through E itself must not keep E waiting
    let net = net(NetBuilder::new("main")
        .condition("back")
        .task("A").split(SplitType::Or).build()
        .task("B").build()
        .task("C").build()
        .task("E").join(JoinType::Or).split(SplitType::Xor).build()
        .flow("input", "A")
        .flow("A", "B")
        .flow("A", "C")
        .flow("B", "E")
        .flow("C", "E")
        .flow_if("E", "back", "again == true", 0)
        .flow_default("E", "output")
        .flow("back", "C"));

    assert!(is_or_join_enabled(&net, &marking(&["c_B_E"]), "E"));
    assert!(!is_or_join_enabled(&net, &marking(&["c_B_E", "back"]), "E"));
}

#[test]
fn test_analyze_unknown_task() {
    let net = diamond();
    let verdict = analyze(&net, &marking(&["c_B_E"]), "missing");
    assert!(!verdict.enabled);
}
