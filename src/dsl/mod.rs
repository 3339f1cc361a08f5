pub mod builder;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resourcing::ResourcingSpec;
use crate::runtime::net::{ConditionId, ElementId, JoinType, MultiInstanceSpec, NetId, SplitType, TaskId, TaskKind};
use crate::timer::TimerSpec;

/// Authoring form of a specification, as it appears in YAML.
///
/// The compiler turns this into an immutable [`crate::runtime::net::Specification`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecificationDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub root_net: NetId,
    pub nets: Vec<NetDef>,
    /// Initial case data, overridden by data passed at case creation.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetDef {
    pub id: NetId,
    pub input_condition: ConditionId,
    pub output_condition: ConditionId,
    /// Intermediate conditions. The input and output conditions may be omitted here.
    #[serde(default)]
    pub conditions: Vec<ConditionDef>,
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub flows: Vec<FlowDef>,
    /// Deferred choice groups: group name -> tasks sharing one preset.
    #[serde(default)]
    pub deferred_choice: BTreeMap<String, Vec<TaskId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionDef {
    pub id: ConditionId,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDef {
    pub id: TaskId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub join: JoinType,
    #[serde(default)]
    pub split: SplitType,
    #[serde(default)]
    pub kind: TaskKind,
    /// Subnet id; a task with a decomposition is composite.
    #[serde(default)]
    pub decomposition: Option<NetId>,
    #[serde(default)]
    pub cancellation_set: Vec<ElementId>,
    #[serde(default)]
    pub resourcing: Option<ResourcingSpec>,
    #[serde(default)]
    pub timer: Option<TimerSpec>,
    #[serde(default)]
    pub multi_instance: Option<MultiInstanceSpec>,
    /// Codelet run when an automated task starts executing.
    #[serde(default)]
    pub codelet: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl TaskDef {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            join: JoinType::default(),
            split: SplitType::default(),
            kind: TaskKind::default(),
            decomposition: None,
            cancellation_set: Vec::new(),
            resourcing: None,
            timer: None,
            multi_instance: None,
            codelet: None,
            params: Value::Null,
        }
    }
}

/// A flow between a condition and a task, or between two tasks
/// (an implicit condition is inserted by the compiler).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowDef {
    pub source: ElementId,
    pub target: ElementId,
    /// Boolean expression over case data, evaluated for XOR/OR splits.
    #[serde(default)]
    pub predicate: Option<String>,
    /// Evaluation order for XOR splits; flows without one keep declaration order.
    #[serde(default)]
    pub ordering: Option<u32>,
    #[serde(default)]
    pub default: bool,
}
