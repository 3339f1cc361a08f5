use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::dsl::{ConditionDef, FlowDef, NetDef, SpecificationDef, TaskDef};
use crate::resourcing::{DistributionStrategy, FilterSpec, InitialAction, ResourcingSpec};
use crate::runtime::net::{JoinType, MultiInstanceSpec, SplitType, TaskKind};
use crate::timer::TimerSpec;

pub struct SpecificationBuilder {
    id: String,
    name: String,
    version: String,
    root_net: Option<String>,
    variables: HashMap<String, Value>,
    nets: Vec<NetDef>,
}

impl SpecificationBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            version: "0.1".to_string(),
            root_net: None,
            variables: HashMap::new(),
            nets: Vec::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn var(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    /// The first net added becomes the root unless [`Self::root`] says otherwise.
    pub fn net(mut self, net: NetDef) -> Self {
        if self.root_net.is_none() {
            self.root_net = Some(net.id.clone());
        }
        self.nets.push(net);
        self
    }

    pub fn root(mut self, net_id: &str) -> Self {
        self.root_net = Some(net_id.to_string());
        self
    }

    pub fn build(self) -> SpecificationDef {
        SpecificationDef {
            id: self.id,
            name: self.name,
            version: self.version,
            root_net: self.root_net.unwrap_or_default(),
            nets: self.nets,
            variables: self.variables,
        }
    }
}

pub struct NetBuilder {
    id: String,
    input: String,
    output: String,
    pub conditions: Vec<ConditionDef>,
    pub tasks: Vec<TaskDef>, // public so tests can tweak definitions directly
    flows: Vec<FlowDef>,
    deferred_choice: BTreeMap<String, Vec<String>>,
}

impl NetBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            input: "input".to_string(),
            output: "output".to_string(),
            conditions: Vec::new(),
            tasks: Vec::new(),
            flows: Vec::new(),
            deferred_choice: BTreeMap::new(),
        }
    }

    pub fn input(mut self, id: &str) -> Self {
        self.input = id.to_string();
        self
    }

    pub fn output(mut self, id: &str) -> Self {
        self.output = id.to_string();
        self
    }

    pub fn condition(mut self, id: &str) -> Self {
        self.conditions.push(ConditionDef {
            id: id.to_string(),
            name: None,
        });
        self
    }

    pub fn task(self, id: &str) -> TaskBuilder {
        TaskBuilder {
            net_builder: self,
            def: TaskDef::new(id),
        }
    }

    pub fn flow(mut self, source: &str, target: &str) -> Self {
        self.flows.push(FlowDef {
            source: source.to_string(),
            target: target.to_string(),
            predicate: None,
            ordering: None,
            default: false,
        });
        self
    }

    pub fn flow_if(mut self, source: &str, target: &str, predicate: &str, ordering: u32) -> Self {
        self.flows.push(FlowDef {
            source: source.to_string(),
            target: target.to_string(),
            predicate: Some(predicate.to_string()),
            ordering: Some(ordering),
            default: false,
        });
        self
    }

    pub fn flow_default(mut self, source: &str, target: &str) -> Self {
        self.flows.push(FlowDef {
            source: source.to_string(),
            target: target.to_string(),
            predicate: None,
            ordering: None,
            default: true,
        });
        self
    }

    pub fn deferred_choice(mut self, group: &str, tasks: &[&str]) -> Self {
        self.deferred_choice
            .insert(group.to_string(), tasks.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> NetDef {
        NetDef {
            id: self.id,
            input_condition: self.input,
            output_condition: self.output,
            conditions: self.conditions,
            tasks: self.tasks,
            flows: self.flows,
            deferred_choice: self.deferred_choice,
        }
    }
}

pub struct TaskBuilder {
    net_builder: NetBuilder,
    def: TaskDef,
}

impl TaskBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.def.name = Some(name.to_string());
        self
    }

    pub fn join(mut self, join: JoinType) -> Self {
        self.def.join = join;
        self
    }

    pub fn split(mut self, split: SplitType) -> Self {
        self.def.split = split;
        self
    }

    pub fn automated(mut self) -> Self {
        self.def.kind = TaskKind::Automated;
        self
    }

    pub fn codelet(mut self, name: &str) -> Self {
        self.def.kind = TaskKind::Automated;
        self.def.codelet = Some(name.to_string());
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.def.params.is_object() {
            self.def.params = Value::Object(Default::default());
        }
        if let Some(obj) = self.def.params.as_object_mut() {
            obj.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn composite(mut self, net_id: &str) -> Self {
        self.def.decomposition = Some(net_id.to_string());
        self
    }

    pub fn cancels(mut self, elements: &[&str]) -> Self {
        self.def.cancellation_set = elements.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.resourcing().roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn participants(mut self, participants: &[&str]) -> Self {
        self.resourcing().participants = participants.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn filter(mut self, name: &str, params: Value) -> Self {
        self.resourcing().filters.push(FilterSpec {
            name: name.to_string(),
            params,
        });
        self
    }

    pub fn four_eyes(mut self, tasks: &[&str]) -> Self {
        self.resourcing().four_eyes = tasks.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn distribution(mut self, strategy: DistributionStrategy) -> Self {
        self.resourcing().distribution = strategy;
        self
    }

    pub fn allocate(mut self) -> Self {
        self.resourcing().initial = InitialAction::Allocate;
        self
    }

    pub fn timer(mut self, timer: TimerSpec) -> Self {
        self.def.timer = Some(timer);
        self
    }

    pub fn multi_instance(mut self, spec: MultiInstanceSpec) -> Self {
        self.def.multi_instance = Some(spec);
        self
    }

    fn resourcing(&mut self) -> &mut ResourcingSpec {
        self.def.resourcing.get_or_insert_with(ResourcingSpec::default)
    }

    pub fn build(mut self) -> NetBuilder {
        self.net_builder.tasks.push(self.def);
        self.net_builder
    }
}
