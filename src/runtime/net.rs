use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resourcing::ResourcingSpec;
use crate::runtime::predicate::Predicate;
use crate::timer::TimerSpec;

pub type ElementId = String;
pub type ConditionId = ElementId;
pub type TaskId = ElementId;
pub type NetId = String;
pub type SpecificationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    And,
    #[default]
    Xor,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitType {
    #[default]
    And,
    Xor,
    Or,
}

/// Who performs a task's work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Offered to participants via resource dispatch.
    #[default]
    Manual,
    /// Executed by the system (optionally through a codelet), never resourced.
    Automated,
}

/// Multi-instance configuration: one child work item per element of `items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    #[serde(default = "default_min")]
    pub min: usize,
    #[serde(default = "default_max")]
    pub max: usize,
    /// Completed children needed to finish the task; `None` waits for all.
    #[serde(default)]
    pub threshold: Option<usize>,
    /// Runner data key holding the array to fan out over.
    pub items: String,
    #[serde(default = "default_item_var")]
    pub item_var: String,
    /// Runner data key receiving the array of child outputs.
    pub output_var: String,
}

fn default_min() -> usize {
    1
}

fn default_max() -> usize {
    usize::MAX
}

fn default_item_var() -> String {
    "item".to_string()
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub id: ConditionId,
    pub name: String,
    /// Inserted by the compiler between two directly connected tasks.
    pub implicit: bool,
}

/// An outgoing flow of a task, already resolved to its target condition.
#[derive(Debug, Clone)]
pub struct Flow {
    pub target: ConditionId,
    pub predicate: Option<Predicate>,
    pub ordering: u32,
    pub is_default: bool,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub join: JoinType,
    pub split: SplitType,
    pub kind: TaskKind,
    /// Preset conditions in declaration order.
    pub preset: Vec<ConditionId>,
    /// Outgoing flows sorted by ascending ordering.
    pub postset: Vec<Flow>,
    pub decomposition: Option<NetId>,
    pub cancellation_set: Vec<ElementId>,
    pub resourcing: Option<ResourcingSpec>,
    pub timer: Option<TimerSpec>,
    pub multi_instance: Option<MultiInstanceSpec>,
    pub codelet: Option<String>,
    pub params: Value,
}

impl Task {
    pub fn is_composite(&self) -> bool {
        self.decomposition.is_some()
    }

    pub fn postset_conditions(&self) -> impl Iterator<Item = &ConditionId> {
        self.postset.iter().map(|f| &f.target)
    }
}

/// Immutable net description shared by every runner of a specification.
#[derive(Debug, Clone)]
pub struct Net {
    pub id: NetId,
    pub input_condition: ConditionId,
    pub output_condition: ConditionId,
    pub conditions: BTreeMap<ConditionId, Condition>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub deferred_choice: BTreeMap<String, BTreeSet<TaskId>>,
    /// condition -> tasks that consume from it
    consumers: HashMap<ConditionId, Vec<TaskId>>,
    /// condition -> tasks that produce into it
    producers: HashMap<ConditionId, Vec<TaskId>>,
}

impl Net {
    pub fn new(
        id: NetId,
        input_condition: ConditionId,
        output_condition: ConditionId,
        conditions: BTreeMap<ConditionId, Condition>,
        tasks: BTreeMap<TaskId, Task>,
        deferred_choice: BTreeMap<String, BTreeSet<TaskId>>,
    ) -> Self {
        let mut consumers: HashMap<ConditionId, Vec<TaskId>> = HashMap::new();
        let mut producers: HashMap<ConditionId, Vec<TaskId>> = HashMap::new();
        for task in tasks.values() {
            for c in &task.preset {
                consumers.entry(c.clone()).or_default().push(task.id.clone());
            }
            for c in task.postset_conditions() {
                producers.entry(c.clone()).or_default().push(task.id.clone());
            }
        }

        Self {
            id,
            input_condition,
            output_condition,
            conditions,
            tasks,
            deferred_choice,
            consumers,
            producers,
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn has_condition(&self, id: &str) -> bool {
        self.conditions.contains_key(id)
    }

    pub fn consumers_of(&self, condition: &str) -> &[TaskId] {
        self.consumers.get(condition).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn producers_of(&self, condition: &str) -> &[TaskId] {
        self.producers.get(condition).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Deferred choice group a task belongs to, if any.
    pub fn choice_group_of(&self, task: &str) -> Option<&str> {
        self.deferred_choice
            .iter()
            .find(|(_, members)| members.contains(task))
            .map(|(group, _)| group.as_str())
    }
}

/// A compiled specification: the root net plus every subnet it decomposes to.
#[derive(Debug, Clone)]
pub struct Specification {
    pub id: SpecificationId,
    pub name: String,
    pub version: String,
    pub root_net: NetId,
    pub nets: HashMap<NetId, Arc<Net>>,
    pub variables: serde_json::Map<String, Value>,
}

impl Specification {
    pub fn net(&self, id: &str) -> Option<Arc<Net>> {
        self.nets.get(id).cloned()
    }

    pub fn root(&self) -> Option<Arc<Net>> {
        self.net(&self.root_net)
    }
}
