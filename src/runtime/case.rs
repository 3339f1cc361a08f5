use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::resourcing::CompletionRecord;
use crate::runtime::net::{Specification, SpecificationId, TaskId};
use crate::runtime::runner::{CaseId, ExecutionStatus, NetRunner, RunnerId, RunnerSnapshot};
use crate::runtime::work_item::{ParticipantId, WorkItem, WorkItemId, WorkItemStatus};
use crate::timer::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Created,
    Running,
    Suspending,
    Suspended,
    Completed,
    Cancelled,
}

impl CaseStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, CaseStatus::Completed | CaseStatus::Cancelled)
    }
}

/// 案例状态 (Case State)
///
/// Everything one case owns: its runners (root plus live sub-cases), its
/// work items and the completion history used for four-eyes checks.
/// Always accessed through the engine's per-case lock.
#[derive(Debug, Clone)]
pub struct CaseState {
    pub id: CaseId,
    pub spec: Arc<Specification>,
    pub status: CaseStatus,
    pub root: RunnerId,
    pub runners: HashMap<RunnerId, NetRunner>,
    pub work_items: BTreeMap<WorkItemId, WorkItem>,
    pub completions: Vec<CompletionRecord>,
    /// work item -> its pending timer
    pub timers: HashMap<WorkItemId, TimerId>,
    /// Runners already reported as deadlocked.
    pub deadlocked: BTreeSet<RunnerId>,
    pub created_at: DateTime<Utc>,
}

impl CaseState {
    pub fn new(spec: Arc<Specification>, root: NetRunner) -> Self {
        let id = root.case_id();
        let root_id = root.id();
        Self {
            id,
            spec,
            status: CaseStatus::Created,
            root: root_id,
            runners: HashMap::from([(root_id, root)]),
            work_items: BTreeMap::new(),
            completions: Vec::new(),
            timers: HashMap::new(),
            deadlocked: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn runner(&self, id: &RunnerId) -> EngineResult<&NetRunner> {
        self.runners.get(id).ok_or(EngineError::RunnerNotFound(*id))
    }

    pub fn runner_mut(&mut self, id: &RunnerId) -> EngineResult<&mut NetRunner> {
        self.runners.get_mut(id).ok_or(EngineError::RunnerNotFound(*id))
    }

    pub fn root_runner(&self) -> EngineResult<&NetRunner> {
        self.runner(&self.root)
    }

    pub fn item(&self, id: &WorkItemId) -> EngineResult<&WorkItem> {
        self.work_items.get(id).ok_or(EngineError::WorkItemNotFound(*id))
    }

    pub fn item_mut(&mut self, id: &WorkItemId) -> EngineResult<&mut WorkItem> {
        self.work_items.get_mut(id).ok_or(EngineError::WorkItemNotFound(*id))
    }

    /// Active top-level work items of a task in one runner.
    pub fn active_items_for(&self, runner: &RunnerId, task: &str) -> Vec<WorkItemId> {
        self.work_items
            .values()
            .filter(|w| w.runner_id == *runner && w.task_id == task && w.parent.is_none() && w.is_active())
            .map(|w| w.id)
            .collect()
    }

    pub fn active_items_of_runner(&self, runner: &RunnerId) -> Vec<WorkItemId> {
        self.work_items
            .values()
            .filter(|w| w.runner_id == *runner && w.is_active())
            .map(|w| w.id)
            .collect()
    }

    /// Number of items each participant currently holds in this case.
    pub fn participant_load(&self) -> HashMap<ParticipantId, usize> {
        let mut load = HashMap::new();
        for item in self.work_items.values() {
            let held = matches!(
                item.status(),
                WorkItemStatus::Allocated
                    | WorkItemStatus::Started
                    | WorkItemStatus::Executing
                    | WorkItemStatus::Suspended
            );
            if let (true, Some(p)) = (held, &item.allocated_to) {
                *load.entry(p.clone()).or_insert(0) += 1;
            }
        }
        load
    }

    /// Every busy task of `runner` is a composite task whose sub-case runner
    /// is suspended, so nothing in it can progress until a resume.
    pub fn waits_only_on_suspended_subcases(&self, runner: &RunnerId) -> bool {
        let Some(r) = self.runners.get(runner) else {
            return false;
        };
        r.busy().iter().all(|task| {
            let items = self.active_items_for(runner, task);
            !items.is_empty()
                && items.iter().all(|id| {
                    self.work_items
                        .get(id)
                        .and_then(|w| w.child_runner)
                        .and_then(|child| self.runners.get(&child))
                        .is_some_and(|child| child.status() == ExecutionStatus::Suspended)
                })
        })
    }

    /// Runners below `runner`, deepest first.
    pub fn descendants(&self, runner: &RunnerId) -> Vec<RunnerId> {
        let mut out = Vec::new();
        if let Some(r) = self.runners.get(runner) {
            for child in r.children() {
                out.extend(self.descendants(child));
                out.push(*child);
            }
        }
        out
    }

    pub fn snapshot(&self) -> CaseSnapshot {
        let mut runners: Vec<RunnerSnapshot> = self.runners.values().map(|r| r.snapshot()).collect();
        runners.sort_by_key(|r| r.id);
        CaseSnapshot {
            id: self.id,
            specification_id: self.spec.id.clone(),
            status: self.status,
            root: self.root,
            runners,
            work_items: self.work_items.values().cloned().collect(),
            completions: self.completions.clone(),
            timers: self.timers.iter().map(|(w, t)| (*w, *t)).collect(),
            created_at: self.created_at,
        }
    }
}

/// Serializable image of a case, handed to the [`CaseStore`](crate::runtime::storage::CaseStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub id: CaseId,
    pub specification_id: SpecificationId,
    pub status: CaseStatus,
    pub root: RunnerId,
    pub runners: Vec<RunnerSnapshot>,
    pub work_items: Vec<WorkItem>,
    pub completions: Vec<CompletionRecord>,
    pub timers: BTreeMap<WorkItemId, TimerId>,
    pub created_at: DateTime<Utc>,
}

impl CaseSnapshot {
    pub fn work_items_of_task<'a>(&'a self, task: &'a TaskId) -> impl Iterator<Item = &'a WorkItem> + 'a {
        self.work_items.iter().filter(move |w| &w.task_id == task)
    }
}
