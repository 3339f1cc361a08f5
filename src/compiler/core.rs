use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::dsl::{NetDef, SpecificationDef, TaskDef};
use crate::error::{EngineError, EngineResult};
use crate::runtime::net::{Condition, ConditionId, Flow, Net, Specification, Task, TaskId};
use crate::runtime::predicate::Predicate;

/// Turns a [`SpecificationDef`] into an immutable [`Specification`].
///
/// Structural checks: unique ids, known flow endpoints, an input condition
/// nothing flows into and an output condition nothing flows out of,
/// resolvable decompositions, cancellation sets and deferred choice groups
/// that name elements of the same net, and compilable predicates.
/// Flows between two tasks get an implicit condition.
pub struct Compiler {
    net_ids: HashSet<String>,
}

enum Endpoint {
    Condition,
    Task,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            net_ids: HashSet::new(),
        }
    }

    pub fn compile(&mut self, def: SpecificationDef) -> EngineResult<Specification> {
        // 1. Pass 1: Indexing
        self.net_ids.clear();
        for net in &def.nets {
            if !self.net_ids.insert(net.id.clone()) {
                return Err(invalid(format!("duplicate net id '{}'", net.id)));
            }
        }
        if !self.net_ids.contains(&def.root_net) {
            return Err(invalid(format!("root net '{}' is not defined", def.root_net)));
        }

        // 2. Pass 2: Transform
        let mut nets = HashMap::new();
        for net_def in &def.nets {
            let net = self.compile_net(net_def)?;
            nets.insert(net.id.clone(), Arc::new(net));
        }

        debug!(specification = %def.id, nets = nets.len(), "specification compiled");
        Ok(Specification {
            id: def.id,
            name: def.name,
            version: def.version,
            root_net: def.root_net,
            nets,
            variables: def.variables.into_iter().collect(),
        })
    }

    fn compile_net(&self, def: &NetDef) -> EngineResult<Net> {
        if def.input_condition == def.output_condition {
            return Err(invalid(format!(
                "net '{}': input and output condition must differ",
                def.id
            )));
        }

        let mut conditions: BTreeMap<ConditionId, Condition> = BTreeMap::new();
        for id in [&def.input_condition, &def.output_condition] {
            conditions.insert(id.clone(), condition(id, None, false));
        }
        for c in &def.conditions {
            let boundary = c.id == def.input_condition || c.id == def.output_condition;
            if conditions.contains_key(&c.id) && !boundary {
                return Err(invalid(format!("net '{}': duplicate condition '{}'", def.id, c.id)));
            }
            conditions.insert(c.id.clone(), condition(&c.id, c.name.as_deref(), false));
        }

        let mut tasks: BTreeMap<TaskId, Task> = BTreeMap::new();
        for t in &def.tasks {
            if conditions.contains_key(&t.id) || tasks.contains_key(&t.id) {
                return Err(invalid(format!("net '{}': duplicate element id '{}'", def.id, t.id)));
            }
            tasks.insert(t.id.clone(), self.transform_task(def, t)?);
        }

        for (index, flow) in def.flows.iter().enumerate() {
            let source = endpoint(&conditions, &tasks, &flow.source)
                .ok_or_else(|| invalid(format!("net '{}': unknown flow source '{}'", def.id, flow.source)))?;
            let target = endpoint(&conditions, &tasks, &flow.target)
                .ok_or_else(|| invalid(format!("net '{}': unknown flow target '{}'", def.id, flow.target)))?;

            let predicate = match &flow.predicate {
                Some(raw) => Some(Predicate::compile(raw).map_err(|reason| EngineError::InvalidPredicate {
                    source_id: flow.source.clone(),
                    target: flow.target.clone(),
                    predicate: raw.clone(),
                    reason,
                })?),
                None => None,
            };
            let ordering = flow.ordering.unwrap_or(index as u32);

            match (source, target) {
                (Endpoint::Condition, Endpoint::Condition) => {
                    return Err(invalid(format!(
                        "net '{}': flow {} -> {} connects two conditions",
                        def.id, flow.source, flow.target
                    )));
                }
                (Endpoint::Condition, Endpoint::Task) => {
                    if predicate.is_some() || flow.default {
                        return Err(invalid(format!(
                            "net '{}': flow {} -> {} leaves a condition and cannot carry a predicate",
                            def.id, flow.source, flow.target
                        )));
                    }
                    add_preset(&mut tasks, &flow.target, &flow.source);
                }
                (Endpoint::Task, Endpoint::Condition) => {
                    add_postset(&mut tasks, &flow.source, &flow.target, predicate, ordering, flow.default);
                }
                (Endpoint::Task, Endpoint::Task) => {
                    let mut implicit = format!("c_{}_{}", flow.source, flow.target);
                    while conditions.contains_key(&implicit) || tasks.contains_key(&implicit) {
                        implicit.push('_');
                    }
                    conditions.insert(implicit.clone(), condition(&implicit, None, true));
                    add_postset(&mut tasks, &flow.source, &implicit, predicate, ordering, flow.default);
                    add_preset(&mut tasks, &flow.target, &implicit);
                }
            }
        }

        for task in tasks.values_mut() {
            // stable: equal orderings keep declaration order
            task.postset.sort_by_key(|f| f.ordering);
        }

        self.check_structure(def, &tasks)?;

        let mut deferred_choice = BTreeMap::new();
        for (group, members) in &def.deferred_choice {
            let mut shared: Option<BTreeSet<&ConditionId>> = None;
            for m in members {
                let task = tasks.get(m).ok_or_else(|| {
                    invalid(format!("net '{}': deferred choice '{}' names unknown task '{}'", def.id, group, m))
                })?;
                let preset: BTreeSet<&ConditionId> = task.preset.iter().collect();
                match &shared {
                    Some(p) if *p != preset => {
                        return Err(invalid(format!(
                            "net '{}': deferred choice '{}' members do not share one preset",
                            def.id, group
                        )));
                    }
                    Some(_) => {}
                    None => shared = Some(preset),
                }
            }
            deferred_choice.insert(group.clone(), members.iter().cloned().collect::<BTreeSet<_>>());
        }

        Ok(Net::new(
            def.id.clone(),
            def.input_condition.clone(),
            def.output_condition.clone(),
            conditions,
            tasks,
            deferred_choice,
        ))
    }

    fn transform_task(&self, net: &NetDef, def: &TaskDef) -> EngineResult<Task> {
        if let Some(sub) = &def.decomposition {
            if !self.net_ids.contains(sub) {
                return Err(EngineError::UnresolvedDecomposition {
                    task: def.id.clone(),
                    net: sub.clone(),
                });
            }
            if *sub == net.id {
                return Err(invalid(format!("task '{}' decomposes to its own net", def.id)));
            }
        }
        if let Some(mi) = &def.multi_instance {
            if def.decomposition.is_some() {
                return Err(invalid(format!(
                    "task '{}': a composite task cannot be multi-instance",
                    def.id
                )));
            }
            if mi.min > mi.max {
                return Err(invalid(format!("task '{}': multi-instance min exceeds max", def.id)));
            }
            if mi.items.is_empty() || mi.output_var.is_empty() {
                return Err(invalid(format!(
                    "task '{}': multi-instance needs 'items' and 'output_var'",
                    def.id
                )));
            }
        }

        Ok(Task {
            id: def.id.clone(),
            name: def.name.clone().unwrap_or_else(|| def.id.clone()),
            join: def.join,
            split: def.split,
            kind: def.kind,
            preset: Vec::new(),
            postset: Vec::new(),
            decomposition: def.decomposition.clone(),
            cancellation_set: def.cancellation_set.clone(),
            resourcing: def.resourcing.clone(),
            timer: def.timer.clone(),
            multi_instance: def.multi_instance.clone(),
            codelet: def.codelet.clone(),
            params: def.params.clone(),
        })
    }

    fn check_structure(&self, def: &NetDef, tasks: &BTreeMap<TaskId, Task>) -> EngineResult<()> {
        for task in tasks.values() {
            if task.preset.iter().any(|c| *c == def.output_condition) {
                return Err(invalid(format!(
                    "net '{}': output condition '{}' has an outgoing flow to '{}'",
                    def.id, def.output_condition, task.id
                )));
            }
            if task.postset_conditions().any(|c| *c == def.input_condition) {
                return Err(invalid(format!(
                    "net '{}': input condition '{}' has an incoming flow from '{}'",
                    def.id, def.input_condition, task.id
                )));
            }
            if task.preset.is_empty() {
                return Err(invalid(format!("net '{}': task '{}' has no incoming flow", def.id, task.id)));
            }
            if task.postset.is_empty() {
                return Err(invalid(format!("net '{}': task '{}' has no outgoing flow", def.id, task.id)));
            }
            if task.postset.iter().filter(|f| f.is_default).count() > 1 {
                return Err(invalid(format!(
                    "net '{}': task '{}' has more than one default flow",
                    def.id, task.id
                )));
            }
            for element in &task.cancellation_set {
                let known = tasks.contains_key(element)
                    || *element == def.input_condition
                    || *element == def.output_condition
                    || def.conditions.iter().any(|c| c.id == *element)
                    || tasks.values().any(|t| t.preset.contains(element));
                if !known {
                    return Err(invalid(format!(
                        "net '{}': task '{}' cancels unknown element '{}'",
                        def.id, task.id, element
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(msg: String) -> EngineError {
    EngineError::Validation(msg)
}

fn condition(id: &str, name: Option<&str>, implicit: bool) -> Condition {
    Condition {
        id: id.to_string(),
        name: name.unwrap_or(id).to_string(),
        implicit,
    }
}

fn endpoint(conditions: &BTreeMap<ConditionId, Condition>, tasks: &BTreeMap<TaskId, Task>, id: &str) -> Option<Endpoint> {
    if conditions.contains_key(id) {
        Some(Endpoint::Condition)
    } else if tasks.contains_key(id) {
        Some(Endpoint::Task)
    } else {
        None
    }
}

fn add_preset(tasks: &mut BTreeMap<TaskId, Task>, task: &str, condition: &str) {
    if let Some(t) = tasks.get_mut(task) {
        if !t.preset.iter().any(|c| c == condition) {
            t.preset.push(condition.to_string());
        }
    }
}

fn add_postset(
    tasks: &mut BTreeMap<TaskId, Task>,
    task: &str,
    target: &str,
    predicate: Option<Predicate>,
    ordering: u32,
    is_default: bool,
) {
    if let Some(t) = tasks.get_mut(task) {
        t.postset.push(Flow {
            target: target.to_string(),
            predicate,
            ordering,
            is_default,
        });
    }
}
