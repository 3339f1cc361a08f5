use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::runtime::marking::{Marking, TokenArena, TokenId, TokenStatus};
use crate::runtime::net::{ConditionId, Flow, JoinType, Net, NetId, SplitType, Task, TaskId};
use crate::runtime::or_join;

pub type CaseId = Uuid;
pub type RunnerId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Normal,
    /// Suspend requested while tasks were busy.
    Suspending,
    Suspended,
    Resuming,
}

/// Links a sub-case runner to the composite work item that launched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub runner: RunnerId,
    pub work_item: Uuid,
}

/// Audit record of one firing (or abort) of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FiringResult {
    pub task: TaskId,
    pub consumed: Vec<TokenId>,
    pub produced: Vec<TokenId>,
    pub cancelled: Vec<TokenId>,
    /// Tasks named in the cancellation set that were enabled or busy.
    pub cancelled_tasks: Vec<TaskId>,
    /// Deferred choice siblings withdrawn by this firing.
    pub withdrawn: Vec<TaskId>,
    pub completed: bool,
}

/// What changed in the enabled set during [`NetRunner::continue_if_possible`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnablementDelta {
    pub newly_enabled: Vec<TaskId>,
    pub withdrawn: Vec<TaskId>,
    /// Whether any task is still enabled or busy.
    pub active: bool,
}

/// 网络执行器 (Net Runner)
///
/// Executes one net instance: the root net of a case, or the subnet of a
/// composite task. Owns the marking, the token lineage and the task
/// bookkeeping; every mutation of those goes through this type.
#[derive(Debug, Clone)]
pub struct NetRunner {
    id: RunnerId,
    case_id: CaseId,
    net: Arc<Net>,
    marking: Marking,
    tokens: TokenArena,
    data: Map<String, Value>,
    completed: bool,
    status: ExecutionStatus,
    enabled: BTreeSet<TaskId>,
    busy: BTreeSet<TaskId>,
    /// Join tokens taken from the marking when a task became busy.
    reserved: BTreeMap<TaskId, Vec<TokenId>>,
    withdrawn: BTreeSet<TaskId>,
    deferred_choice: BTreeMap<String, BTreeSet<TaskId>>,
    parent: Option<ParentLink>,
    children: BTreeSet<RunnerId>,
}

impl NetRunner {
    pub fn new(case_id: CaseId, net: Arc<Net>, data: Map<String, Value>) -> Self {
        let deferred_choice = net.deferred_choice.clone();
        Self {
            id: Uuid::new_v4(),
            case_id,
            net,
            marking: Marking::new(),
            tokens: TokenArena::new(),
            data,
            completed: false,
            status: ExecutionStatus::Normal,
            enabled: BTreeSet::new(),
            busy: BTreeSet::new(),
            reserved: BTreeMap::new(),
            withdrawn: BTreeSet::new(),
            deferred_choice,
            parent: None,
            children: BTreeSet::new(),
        }
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn id(&self) -> RunnerId {
        self.id
    }

    pub fn case_id(&self) -> CaseId {
        self.case_id
    }

    pub fn net(&self) -> &Arc<Net> {
        &self.net
    }

    pub fn marking(&self) -> &Marking {
        &self.marking
    }

    pub fn tokens(&self) -> &TokenArena {
        &self.tokens
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn set_data(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn enabled(&self) -> &BTreeSet<TaskId> {
        &self.enabled
    }

    pub fn busy(&self) -> &BTreeSet<TaskId> {
        &self.busy
    }

    pub fn withdrawn(&self) -> &BTreeSet<TaskId> {
        &self.withdrawn
    }

    /// Tokens held by a busy task.
    pub fn reserved(&self, task: &str) -> &[TokenId] {
        self.reserved.get(task).map(|t| t.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &BTreeSet<RunnerId> {
        &self.children
    }

    pub fn add_child(&mut self, child: RunnerId) {
        self.children.insert(child);
    }

    pub fn remove_child(&mut self, child: &RunnerId) {
        self.children.remove(child);
    }

    /// Places a fresh root token at the input condition.
    pub fn start(&mut self) -> EngineResult<TokenId> {
        if !self.net.has_condition(&self.net.input_condition) {
            return Err(EngineError::MissingInputCondition(self.net.id.clone()));
        }
        if !self.net.has_condition(&self.net.output_condition) {
            return Err(EngineError::MissingOutputCondition(self.net.id.clone()));
        }
        if !self.tokens.is_empty() {
            return Err(EngineError::Validation(format!("runner {} already started", self.id)));
        }

        let input = self.net.input_condition.clone();
        let token = self.tokens.create(None, &input, self.data.clone());
        self.marking.put(&input, token);
        debug!(runner = %self.id, net = %self.net.id, "net runner started");
        Ok(token)
    }

    /// Tasks that may fire under the current marking, ignoring busy and withdrawn tasks.
    pub fn get_enabled_tasks(&self) -> BTreeSet<TaskId> {
        self.net
            .tasks
            .values()
            .filter(|t| !self.busy.contains(&t.id) && !self.withdrawn.contains(&t.id))
            .filter(|t| self.join_enables(t))
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn is_task_enabled(&self, task: &str) -> bool {
        match self.net.task(task) {
            Some(t) => !self.busy.contains(task) && !self.withdrawn.contains(task) && self.join_enables(t),
            None => false,
        }
    }

    fn join_enables(&self, task: &Task) -> bool {
        match task.join {
            JoinType::And => !task.preset.is_empty() && task.preset.iter().all(|c| self.marking.is_marked(c)),
            JoinType::Xor => task.preset.iter().any(|c| self.marking.is_marked(c)),
            JoinType::Or => or_join::analyze_with_busy(&self.net, &self.marking, &self.busy, &task.id).enabled,
        }
    }

    /// Registers a deferred choice group. Members must share the same preset.
    pub fn register_deferred_choice(&mut self, group: &str, tasks: &[&str]) -> EngineResult<()> {
        let mut preset: Option<BTreeSet<&ConditionId>> = None;
        for id in tasks {
            let task = self
                .net
                .task(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            let this: BTreeSet<&ConditionId> = task.preset.iter().collect();
            match &preset {
                Some(p) if *p != this => {
                    return Err(EngineError::Validation(format!(
                        "deferred choice group '{}': task '{}' does not share the group preset",
                        group, id
                    )));
                }
                Some(_) => {}
                None => preset = Some(this),
            }
        }
        self.deferred_choice
            .insert(group.to_string(), tasks.iter().map(|t| t.to_string()).collect());
        Ok(())
    }

    fn choice_siblings(&self, task: &str) -> Vec<TaskId> {
        self.deferred_choice
            .values()
            .filter(|members| members.contains(task))
            .flat_map(|members| members.iter())
            .filter(|m| m.as_str() != task)
            .cloned()
            .collect()
    }

    /// Withdraws every non-busy sibling of `task` in its deferred choice groups.
    fn withdraw_siblings(&mut self, task: &str) -> Vec<TaskId> {
        let mut withdrawn = Vec::new();
        for sibling in self.choice_siblings(task) {
            if self.busy.contains(&sibling) {
                continue;
            }
            self.enabled.remove(&sibling);
            if self.withdrawn.insert(sibling.clone()) {
                withdrawn.push(sibling);
            }
        }
        if !withdrawn.is_empty() {
            debug!(runner = %self.id, winner = %task, withdrawn = ?withdrawn, "deferred choice resolved");
        }
        withdrawn
    }

    fn release_siblings(&mut self, task: &str) {
        for sibling in self.choice_siblings(task) {
            self.withdrawn.remove(&sibling);
        }
    }

    /// Moves an enabled task to busy: its work has started. The join tokens
    /// leave the marking and are held for the task until it fires or aborts.
    ///
    /// Returns every task that lost its enablement: withdrawn deferred choice
    /// siblings first, then tasks starved of the tokens just taken.
    pub fn begin_task(&mut self, task_id: &str) -> EngineResult<Vec<TaskId>> {
        let net = Arc::clone(&self.net);
        let task = net
            .task(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        self.ensure_can_start(task_id)?;
        if self.busy.contains(task_id) {
            return Err(EngineError::InvalidFiring {
                task: task_id.to_string(),
                reason: "task is already busy".to_string(),
            });
        }
        if !self.is_task_enabled(task_id) {
            return Err(EngineError::InvalidFiring {
                task: task_id.to_string(),
                reason: "task is not enabled".to_string(),
            });
        }

        let mut withdrawn = self.withdraw_siblings(task_id);
        let taken = self.consume(task);
        self.reserved.insert(task_id.to_string(), taken);
        self.enabled.remove(task_id);
        self.busy.insert(task_id.to_string());

        let starved: Vec<TaskId> = self
            .enabled
            .iter()
            .filter(|t| !self.is_task_enabled(t))
            .cloned()
            .collect();
        for t in starved {
            self.enabled.remove(&t);
            if !withdrawn.contains(&t) {
                withdrawn.push(t);
            }
        }
        debug!(runner = %self.id, task = %task_id, disabled = ?withdrawn, "task busy");
        Ok(withdrawn)
    }

    fn ensure_can_start(&self, task_id: &str) -> EngineResult<()> {
        if self.completed {
            return Err(EngineError::InvalidFiring {
                task: task_id.to_string(),
                reason: "net has already completed".to_string(),
            });
        }
        if self.status != ExecutionStatus::Normal {
            return Err(EngineError::RunnerSuspended {
                runner: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Fires a task: consume per join, clear the cancellation set, produce per split.
    ///
    /// A busy task already holds its join tokens and skips straight to the
    /// cancellation set; a task that is not busy must be enabled and the
    /// runner must be running.
    pub fn fire_task(&mut self, task_id: &str, data: Map<String, Value>) -> EngineResult<FiringResult> {
        let net = Arc::clone(&self.net);
        let task = net
            .task(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        let was_busy = self.busy.contains(task_id);
        if was_busy {
            if self.completed {
                return Err(EngineError::InvalidFiring {
                    task: task_id.to_string(),
                    reason: "net has already completed".to_string(),
                });
            }
        } else {
            self.ensure_can_start(task_id)?;
            if !self.is_task_enabled(task_id) {
                return Err(EngineError::InvalidFiring {
                    task: task_id.to_string(),
                    reason: "task is not enabled".to_string(),
                });
            }
        }

        let withdrawn = if was_busy { Vec::new() } else { self.withdraw_siblings(task_id) };

        // 1. consume
        let consumed = if was_busy {
            self.reserved.remove(task_id).unwrap_or_default()
        } else {
            self.consume(task)
        };
        for t in &consumed {
            self.tokens.retire(t, TokenStatus::Consumed);
        }
        for (k, v) in &data {
            self.data.insert(k.clone(), v.clone());
        }

        // 2. cancellation set
        let mut cancelled = Vec::new();
        let mut cancelled_tasks = Vec::new();
        for element in &task.cancellation_set {
            if net.has_condition(element) {
                for t in self.marking.clear(element) {
                    self.tokens.retire(&t, TokenStatus::Cancelled);
                    cancelled.push(t);
                }
            } else if element != task_id && net.task(element).is_some() {
                let was_enabled = self.enabled.remove(element);
                let was_busy = self.busy.remove(element);
                for t in self.reserved.remove(element).unwrap_or_default() {
                    self.tokens.retire(&t, TokenStatus::Cancelled);
                    cancelled.push(t);
                }
                if was_busy {
                    self.release_siblings(element);
                }
                if was_enabled || was_busy {
                    cancelled_tasks.push(element.clone());
                }
            }
        }

        // 3. produce
        let parent = consumed.first().copied();
        let mut produced = Vec::new();
        for target in self.split_targets(task) {
            let token = self.tokens.create(parent, &target, data.clone());
            self.marking.put(&target, token);
            produced.push(token);
        }

        self.busy.remove(task_id);
        self.enabled.remove(task_id);
        self.release_siblings(task_id);

        // 4. completion
        if self.marking.is_marked(&net.output_condition) {
            self.completed = true;
        }
        self.settle_suspension();

        debug!(
            runner = %self.id,
            task = %task_id,
            consumed = consumed.len(),
            produced = produced.len(),
            cancelled = cancelled.len(),
            completed = self.completed,
            "task fired"
        );

        Ok(FiringResult {
            task: task_id.to_string(),
            consumed,
            produced,
            cancelled,
            cancelled_tasks,
            withdrawn,
            completed: self.completed,
        })
    }

    /// Aborts a busy task: its held join tokens are cancelled and nothing
    /// is produced.
    pub fn cancel_task(&mut self, task_id: &str) -> EngineResult<FiringResult> {
        if self.net.task(task_id).is_none() {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        }
        if !self.busy.contains(task_id) {
            return Err(EngineError::InvalidFiring {
                task: task_id.to_string(),
                reason: "only a busy task can be aborted".to_string(),
            });
        }

        let cancelled = self.reserved.remove(task_id).unwrap_or_default();
        for t in &cancelled {
            self.tokens.retire(t, TokenStatus::Cancelled);
        }
        self.busy.remove(task_id);
        self.release_siblings(task_id);
        self.settle_suspension();
        debug!(runner = %self.id, task = %task_id, "busy task aborted");

        Ok(FiringResult {
            task: task_id.to_string(),
            cancelled,
            completed: self.completed,
            ..Default::default()
        })
    }

    fn consume(&mut self, task: &Task) -> Vec<TokenId> {
        let mut consumed = Vec::new();
        match task.join {
            JoinType::And | JoinType::Or => {
                for c in &task.preset {
                    if let Some(t) = self.marking.take(c) {
                        consumed.push(t);
                    }
                }
            }
            JoinType::Xor => {
                if let Some(c) = task.preset.iter().find(|c| self.marking.is_marked(c)) {
                    if let Some(t) = self.marking.take(c) {
                        consumed.push(t);
                    }
                }
            }
        }
        consumed
    }

    /// Postset conditions receiving a token, evaluated against runner data.
    pub fn split_targets(&self, task: &Task) -> Vec<ConditionId> {
        let holds = |f: &&Flow| {
            f.predicate.as_ref().map(|p| p.evaluate(&self.data)).unwrap_or(false)
        };

        match task.split {
            SplitType::And => {
                let mut targets: Vec<ConditionId> = Vec::new();
                for c in task.postset_conditions() {
                    if !targets.contains(c) {
                        targets.push(c.clone());
                    }
                }
                targets
            }
            SplitType::Xor => task
                .postset
                .iter()
                .find(holds)
                .or_else(|| task.postset.iter().find(|f| f.is_default))
                .or_else(|| task.postset.first())
                .map(|f| vec![f.target.clone()])
                .unwrap_or_default(),
            SplitType::Or => {
                let mut targets: Vec<ConditionId> = Vec::new();
                for f in task.postset.iter().filter(holds) {
                    if !targets.contains(&f.target) {
                        targets.push(f.target.clone());
                    }
                }
                if targets.is_empty() {
                    if let Some(first) = task.postset.first() {
                        targets.push(first.target.clone());
                    }
                }
                targets
            }
        }
    }

    /// Recomputes the enabled set. A no-op while suspended or completed.
    pub fn continue_if_possible(&mut self) -> EnablementDelta {
        if self.completed || matches!(self.status, ExecutionStatus::Suspending | ExecutionStatus::Suspended) {
            return EnablementDelta {
                active: !self.enabled.is_empty() || !self.busy.is_empty(),
                ..Default::default()
            };
        }

        let fresh = self.get_enabled_tasks();
        let newly_enabled: Vec<TaskId> = fresh.difference(&self.enabled).cloned().collect();
        let withdrawn: Vec<TaskId> = self.enabled.difference(&fresh).cloned().collect();
        self.enabled = fresh;

        EnablementDelta {
            newly_enabled,
            withdrawn,
            active: !self.enabled.is_empty() || !self.busy.is_empty(),
        }
    }

    /// No enabled or busy task, tokens left and the output not reached.
    pub fn is_deadlocked(&self) -> bool {
        self.status == ExecutionStatus::Normal
            && !self.completed
            && self.enabled.is_empty()
            && self.busy.is_empty()
            && !self.marking.is_empty()
    }

    /// Tasks that consume from a marked condition; used for deadlock diagnostics.
    pub fn stranded_tasks(&self) -> Vec<TaskId> {
        let mut tasks: Vec<TaskId> = Vec::new();
        for (condition, _) in self.marking.marked() {
            for t in self.net.consumers_of(condition) {
                if !tasks.contains(t) {
                    tasks.push(t.clone());
                }
            }
        }
        tasks
    }

    pub fn suspend(&mut self) -> ExecutionStatus {
        if matches!(self.status, ExecutionStatus::Normal | ExecutionStatus::Resuming) {
            self.status = if self.busy.is_empty() {
                ExecutionStatus::Suspended
            } else {
                ExecutionStatus::Suspending
            };
            debug!(runner = %self.id, status = ?self.status, "net runner suspending");
        }
        self.status
    }

    /// Completes a pending suspension while tasks are still busy. The caller
    /// has established that none of them can finish before a resume.
    pub fn settle_suspended(&mut self) {
        if self.status == ExecutionStatus::Suspending {
            self.status = ExecutionStatus::Suspended;
            debug!(runner = %self.id, busy = ?self.busy, "net runner suspended with busy sub-cases");
        }
    }

    fn settle_suspension(&mut self) {
        if self.status == ExecutionStatus::Suspending && self.busy.is_empty() {
            self.status = ExecutionStatus::Suspended;
            debug!(runner = %self.id, "net runner suspended");
        }
    }

    /// Recomputes the enabled set while RESUMING, then returns to NORMAL.
    pub fn resume(&mut self) -> EnablementDelta {
        if self.status == ExecutionStatus::Normal {
            return self.continue_if_possible();
        }
        self.status = ExecutionStatus::Resuming;
        let delta = self.continue_if_possible();
        self.status = ExecutionStatus::Normal;
        debug!(runner = %self.id, "net runner resumed");
        delta
    }

    /// Removes every token, held ones included, and forgets enabled/busy tasks.
    pub fn cancel(&mut self) -> Vec<TokenId> {
        let mut tokens = self.marking.drain_all();
        tokens.extend(std::mem::take(&mut self.reserved).into_values().flatten());
        for t in &tokens {
            self.tokens.retire(t, TokenStatus::Cancelled);
        }
        self.enabled.clear();
        self.busy.clear();
        self.withdrawn.clear();
        tokens
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        RunnerSnapshot {
            id: self.id,
            case_id: self.case_id,
            net_id: self.net.id.clone(),
            marking: self.marking.clone(),
            tokens: self.tokens.clone(),
            data: self.data.clone(),
            completed: self.completed,
            status: self.status,
            enabled: self.enabled.clone(),
            busy: self.busy.clone(),
            reserved: self.reserved.clone(),
            withdrawn: self.withdrawn.clone(),
            parent: self.parent.clone(),
            children: self.children.clone(),
        }
    }
}

/// Serializable view of a runner, used for persistence and queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSnapshot {
    pub id: RunnerId,
    pub case_id: CaseId,
    pub net_id: NetId,
    pub marking: Marking,
    pub tokens: TokenArena,
    pub data: Map<String, Value>,
    pub completed: bool,
    pub status: ExecutionStatus,
    pub enabled: BTreeSet<TaskId>,
    pub busy: BTreeSet<TaskId>,
    #[serde(default)]
    pub reserved: BTreeMap<TaskId, Vec<TokenId>>,
    pub withdrawn: BTreeSet<TaskId>,
    pub parent: Option<ParentLink>,
    pub children: BTreeSet<RunnerId>,
}
