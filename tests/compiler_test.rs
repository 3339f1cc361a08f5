use tokenflow::compiler::core::Compiler;
use tokenflow::dsl::builder::{NetBuilder, SpecificationBuilder};
use tokenflow::dsl::SpecificationDef;
use tokenflow::error::EngineError;
use tokenflow::runtime::net::{MultiInstanceSpec, SplitType};

fn compile(def: SpecificationDef) -> Result<tokenflow::runtime::net::Specification, EngineError> {
    Compiler::new().compile(def)
}

fn single(net: NetBuilder) -> SpecificationDef {
    SpecificationBuilder::new("compiler-test").net(net.build()).build()
}

fn validation_message(result: Result<tokenflow::runtime::net::Specification, EngineError>) -> String {
    match result {
        Err(EngineError::Validation(msg)) => msg,
        Err(other) => panic!("expected a validation error, got {:?}", other),
        Ok(_) => panic!("expected a validation error"),
    }
}

#[test]
fn test_compile_linear_net() {
    let spec = compile(single(
        NetBuilder::new("main")
            .task("A").build()
            .task("B").build()
            .flow("input", "A")
            .flow("A", "B")
            .flow("B", "output"),
    ))
    .expect("Compilation failed");

    let net = spec.root().unwrap();
    assert_eq!(net.input_condition, "input");
    assert_eq!(net.output_condition, "output");
    assert_eq!(net.tasks.len(), 2);

    // A -> B got an implicit condition in between
    let implicit = net.conditions.get("c_A_B").expect("implicit condition");
    assert!(implicit.implicit);
    assert_eq!(net.task("A").unwrap().postset[0].target, "c_A_B");
    assert_eq!(net.task("B").unwrap().preset, vec!["c_A_B"]);
    assert_eq!(net.consumers_of("c_A_B"), ["B".to_string()]);
    assert_eq!(net.producers_of("c_A_B"), ["A".to_string()]);
}

#[test]
fn test_postset_sorted_by_ordering() {
    let spec = compile(single(
        NetBuilder::new("main")
            .task("A").split(SplitType::Xor).build()
            .task("B").build()
            .task("C").build()
            .flow("input", "A")
            .flow_if("A", "B", "x > 1", 5)
            .flow_if("A", "C", "x > 2", 1)
            .flow("B", "output")
            .flow("C", "output"),
    ))
    .unwrap();
    let a = spec.root().unwrap().task("A").unwrap().clone();
    let targets: Vec<&str> = a.postset.iter().map(|f| f.target.as_str()).collect();
    assert_eq!(targets, vec!["c_A_C", "c_A_B"]);
    assert_eq!(a.postset[0].predicate.as_ref().unwrap().raw(), "x > 2");
}

#[test]
fn test_duplicate_net_and_missing_root() {
    let net = NetBuilder::new("main").task("A").build().flow("input", "A").flow("A", "output");
    let def = SpecificationBuilder::new("dup")
        .net(net.build())
        .net(NetBuilder::new("main").task("B").build().flow("input", "B").flow("B", "output").build())
        .build();
    assert!(validation_message(compile(def)).contains("duplicate net"));

    let def = SpecificationBuilder::new("no-root")
        .net(NetBuilder::new("main").task("A").build().flow("input", "A").flow("A", "output").build())
        .root("elsewhere")
        .build();
    assert!(validation_message(compile(def)).contains("root net"));
}

#[test]
fn test_compiler_can_be_reused() {
    let linear = || single(NetBuilder::new("main").task("A").build().flow("input", "A").flow("A", "output"));
    let mut compiler = Compiler::new();
    compiler.compile(linear()).expect("first compile");
    let again = compiler.compile(linear()).expect("second compile reuses net ids");
    assert!(again.root().is_some());
}

#[test]
fn test_unknown_flow_endpoint() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main").task("A").build().flow("input", "A").flow("A", "nowhere"),
    )));
    assert!(msg.contains("unknown flow target 'nowhere'"));
}

#[test]
fn test_condition_to_condition_flow_rejected() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main")
            .condition("mid")
            .task("A").build()
            .flow("input", "mid")
            .flow("mid", "A")
            .flow("A", "output"),
    )));
    assert!(msg.contains("connects two conditions"));
}

#[test]
fn test_output_condition_has_no_outgoing_flow() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main")
            .task("A").build()
            .task("B").build()
            .flow("input", "A")
            .flow("A", "output")
            .flow("output", "B")
            .flow("B", "output"),
    )));
    assert!(msg.contains("outgoing flow"));
}

#[test]
fn test_input_condition_has_no_incoming_flow() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main")
            .task("A").build()
            .flow("input", "A")
            .flow("A", "output")
            .flow("A", "input"),
    )));
    assert!(msg.contains("incoming flow"));
}

#[test]
fn test_task_without_postset_rejected() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main")
            .task("A").build()
            .task("B").build()
            .flow("input", "A")
            .flow("input", "B")
            .flow("A", "output"),
    )));
    assert!(msg.contains("'B' has no outgoing flow"));
}

#[test]
fn test_same_input_and_output_rejected() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main").output("input").task("A").build().flow("input", "A").flow("A", "input"),
    )));
    assert!(msg.contains("must differ"));
}

#[test]
fn test_two_default_flows_rejected() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main")
            .condition("x")
            .task("A").split(SplitType::Xor).build()
            .task("B").build()
            .flow("input", "A")
            .flow_default("A", "x")
            .flow_default("A", "output")
            .flow("x", "B")
            .flow("B", "output"),
    )));
    assert!(msg.contains("more than one default flow"));
}

#[test]
fn test_invalid_predicate_reports_flow() {
    let result = compile(single(
        NetBuilder::new("main")
            .task("A").split(SplitType::Xor).build()
            .flow("input", "A")
            .flow_if("A", "output", "(x > 1", 0),
    ));
    match result {
        Err(EngineError::InvalidPredicate { source_id, target, .. }) => {
            assert_eq!(source_id, "A");
            assert_eq!(target, "output");
        }
        other => panic!("expected InvalidPredicate, got {:?}", other.map(|s| s.id)),
    }
}

#[test]
fn test_predicate_on_condition_flow_rejected() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main").task("A").build().flow_if("input", "A", "x > 1", 0).flow("A", "output"),
    )));
    assert!(msg.contains("cannot carry a predicate"));
}

#[test]
fn test_unresolved_and_self_decomposition() {
    let def = single(
        NetBuilder::new("main").task("A").composite("missing").build().flow("input", "A").flow("A", "output"),
    );
    assert!(matches!(
        compile(def),
        Err(EngineError::UnresolvedDecomposition { ref task, ref net }) if task == "A" && net == "missing"
    ));

    let def = single(
        NetBuilder::new("main").task("A").composite("main").build().flow("input", "A").flow("A", "output"),
    );
    assert!(validation_message(compile(def)).contains("its own net"));
}

#[test]
fn test_composite_resolves_subnet() {
    let def = SpecificationBuilder::new("nested")
        .net(
            NetBuilder::new("main")
                .task("outer").composite("inner").build()
                .flow("input", "outer")
                .flow("outer", "output")
                .build(),
        )
        .net(NetBuilder::new("inner").task("work").build().flow("input", "work").flow("work", "output").build())
        .build();
    let spec = compile(def).unwrap();
    assert_eq!(spec.root_net, "main");
    assert!(spec.net("inner").is_some());
    assert!(spec.root().unwrap().task("outer").unwrap().is_composite());
}

#[test]
fn test_unknown_cancellation_element_rejected() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main").task("A").cancels(&["ghost"]).build().flow("input", "A").flow("A", "output"),
    )));
    assert!(msg.contains("cancels unknown element 'ghost'"));
}

#[test]
fn test_deferred_choice_members_share_preset() {
    let msg = validation_message(compile(single(
        NetBuilder::new("main")
            .task("A").build()
            .task("B").build()
            .flow("input", "A")
            .flow("A", "B")
            .flow("B", "output")
            .deferred_choice("pick", &["A", "B"]),
    )));
    assert!(msg.contains("do not share one preset"));
}

#[test]
fn test_multi_instance_bounds() {
    let mi = MultiInstanceSpec {
        min: 3,
        max: 1,
        threshold: None,
        items: "reviewers".to_string(),
        item_var: "reviewer".to_string(),
        output_var: "reviews".to_string(),
    };
    let msg = validation_message(compile(single(
        NetBuilder::new("main").task("A").multi_instance(mi).build().flow("input", "A").flow("A", "output"),
    )));
    assert!(msg.contains("min exceeds max"));
}

#[test]
fn test_variables_become_initial_data() {
    let def = SpecificationBuilder::new("vars")
        .var("limit", 10)
        .net(NetBuilder::new("main").task("A").build().flow("input", "A").flow("A", "output").build())
        .build();
    let spec = compile(def).unwrap();
    assert_eq!(spec.variables.get("limit"), Some(&serde_json::json!(10)));
}
