use serde_json::json;

use tokenflow::dsl::builder::{NetBuilder, SpecificationBuilder};
use tokenflow::resourcing::{DistributionStrategy, InitialAction};
use tokenflow::runtime::net::{JoinType, SplitType, TaskKind};
use tokenflow::timer::{TimerAction, TimerSpec, TimerTrigger};

#[test]
fn test_build_linear_specification() {
    let spec = SpecificationBuilder::new("linear")
        .name("Linear")
        .var("env", "prod")
        .net(
            NetBuilder::new("main")
                .task("review")
                    .name("Review request")
                    .roles(&["clerk"])
                    .build()
                .flow("input", "review")
                .flow("review", "output")
                .build(),
        )
        .build();

    assert_eq!(spec.id, "linear");
    assert_eq!(spec.name, "Linear");
    assert_eq!(spec.root_net, "main");
    assert_eq!(spec.variables.get("env"), Some(&json!("prod")));

    let net = &spec.nets[0];
    assert_eq!(net.input_condition, "input");
    assert_eq!(net.output_condition, "output");
    assert_eq!(net.flows.len(), 2);

    let review = &net.tasks[0];
    assert_eq!(review.name.as_deref(), Some("Review request"));
    assert_eq!(review.kind, TaskKind::Manual);
    assert_eq!(review.join, JoinType::Xor);
    assert_eq!(review.split, SplitType::And);
    let resourcing = review.resourcing.as_ref().expect("resourcing set by roles()");
    assert_eq!(resourcing.roles, vec!["clerk"]);
    assert!(resourcing.available_only);
}

#[test]
fn test_first_net_is_root_unless_overridden() {
    let inner = NetBuilder::new("inner").task("t").build().flow("input", "t").flow("t", "output").build();
    let outer = NetBuilder::new("outer").task("s").composite("inner").build().flow("input", "s").flow("s", "output").build();

    let spec = SpecificationBuilder::new("nested").net(inner.clone()).net(outer.clone()).build();
    assert_eq!(spec.root_net, "inner");

    let spec = SpecificationBuilder::new("nested").net(inner).net(outer).root("outer").build();
    assert_eq!(spec.root_net, "outer");
    assert_eq!(spec.nets[1].tasks[0].decomposition.as_deref(), Some("inner"));
}

#[test]
fn test_task_builder_options() {
    let net = NetBuilder::new("main")
        .input("start")
        .output("end")
        .task("calc")
            .codelet("assign")
            .param("expressions", json!(["total = price * qty"]))
            .split(SplitType::Xor)
            .build()
        .task("approve")
            .roles(&["manager"])
            .participants(&["carol"])
            .filter("capability", json!({ "capability": "finance" }))
            .four_eyes(&["calc"])
            .distribution(DistributionStrategy::RoundRobin)
            .allocate()
            .timer(TimerSpec {
                duration_ms: 500,
                trigger: TimerTrigger::OnStarted,
                action: TimerAction::Escalate,
            })
            .cancels(&["c_calc_reject"])
            .build()
        .flow("start", "calc")
        .flow_if("calc", "approve", "total > 100", 0)
        .flow_default("calc", "end")
        .flow("approve", "end")
        .build();

    assert_eq!(net.input_condition, "start");
    let calc = &net.tasks[0];
    assert_eq!(calc.kind, TaskKind::Automated);
    assert_eq!(calc.codelet.as_deref(), Some("assign"));
    assert_eq!(calc.params["expressions"][0], json!("total = price * qty"));

    let approve = &net.tasks[1];
    let r = approve.resourcing.as_ref().unwrap();
    assert_eq!(r.participants, vec!["carol"]);
    assert_eq!(r.filters[0].name, "capability");
    assert_eq!(r.four_eyes, vec!["calc"]);
    assert_eq!(r.distribution, DistributionStrategy::RoundRobin);
    assert_eq!(r.initial, InitialAction::Allocate);
    assert_eq!(approve.timer.as_ref().unwrap().action, TimerAction::Escalate);
    assert_eq!(approve.cancellation_set, vec!["c_calc_reject"]);

    let conditional = &net.flows[1];
    assert_eq!(conditional.predicate.as_deref(), Some("total > 100"));
    assert_eq!(conditional.ordering, Some(0));
    assert!(net.flows[2].default);
}
