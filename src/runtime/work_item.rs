use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::runtime::net::TaskId;
use crate::runtime::runner::{CaseId, RunnerId};
use crate::timer::TimerSpec;

pub type WorkItemId = Uuid;
pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    Enabled,
    Fired,
    Offered,
    Allocated,
    Started,
    /// System task running without a participant.
    Executing,
    Suspended,
    Completed,
    ForceCompleted,
    Failed,
    Cancelled,
    /// Multi-instance parent waiting on its children.
    Parent,
    /// Diagnostic record for a task stranded by a deadlock.
    Deadlocked,
}

impl WorkItemStatus {
    pub const ALL: [WorkItemStatus; 13] = [
        WorkItemStatus::Enabled,
        WorkItemStatus::Fired,
        WorkItemStatus::Offered,
        WorkItemStatus::Allocated,
        WorkItemStatus::Started,
        WorkItemStatus::Executing,
        WorkItemStatus::Suspended,
        WorkItemStatus::Completed,
        WorkItemStatus::ForceCompleted,
        WorkItemStatus::Failed,
        WorkItemStatus::Cancelled,
        WorkItemStatus::Parent,
        WorkItemStatus::Deadlocked,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemStatus::Completed
                | WorkItemStatus::ForceCompleted
                | WorkItemStatus::Failed
                | WorkItemStatus::Cancelled
                | WorkItemStatus::Deadlocked
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemEvent {
    Fire,
    Offer,
    Allocate,
    Reallocate,
    Delegate,
    Start,
    Execute,
    Spawn,
    Complete,
    Fail,
    Suspend,
    Resume,
    Cancel,
    Timeout,
    ForceComplete,
    Skip,
}

impl WorkItemEvent {
    pub const ALL: [WorkItemEvent; 16] = [
        WorkItemEvent::Fire,
        WorkItemEvent::Offer,
        WorkItemEvent::Allocate,
        WorkItemEvent::Reallocate,
        WorkItemEvent::Delegate,
        WorkItemEvent::Start,
        WorkItemEvent::Execute,
        WorkItemEvent::Spawn,
        WorkItemEvent::Complete,
        WorkItemEvent::Fail,
        WorkItemEvent::Suspend,
        WorkItemEvent::Resume,
        WorkItemEvent::Cancel,
        WorkItemEvent::Timeout,
        WorkItemEvent::ForceComplete,
        WorkItemEvent::Skip,
    ];
}

/// The transition table. `None` means the event is invalid in that status.
pub fn next_status(from: WorkItemStatus, event: WorkItemEvent) -> Option<WorkItemStatus> {
    use WorkItemEvent as E;
    use WorkItemStatus as S;

    match (from, event) {
        (S::Enabled, E::Fire) => Some(S::Fired),
        (S::Enabled, E::Cancel) => Some(S::Cancelled),
        (S::Enabled, E::Skip) => Some(S::Completed),

        (S::Fired, E::Offer) => Some(S::Offered),
        (S::Fired, E::Allocate) => Some(S::Allocated),
        (S::Fired, E::Start) => Some(S::Started),
        (S::Fired, E::Execute) => Some(S::Executing),
        (S::Fired, E::Spawn) => Some(S::Parent),
        (S::Fired, E::Cancel) => Some(S::Cancelled),

        (S::Offered, E::Allocate) => Some(S::Allocated),
        (S::Offered, E::Cancel) => Some(S::Cancelled),
        (S::Offered, E::Timeout) => Some(S::Failed),

        (S::Allocated, E::Start) => Some(S::Started),
        (S::Allocated, E::Reallocate) => Some(S::Allocated),
        (S::Allocated, E::Delegate) => Some(S::Offered),
        (S::Allocated, E::Cancel) => Some(S::Cancelled),
        (S::Allocated, E::Timeout) => Some(S::Failed),

        (S::Started | S::Executing, E::Complete) => Some(S::Completed),
        (S::Started | S::Executing, E::Fail) => Some(S::Failed),
        (S::Started | S::Executing, E::Suspend) => Some(S::Suspended),
        (S::Started | S::Executing, E::Cancel) => Some(S::Cancelled),
        (S::Started | S::Executing, E::Timeout) => Some(S::Failed),
        (S::Started | S::Executing, E::ForceComplete) => Some(S::ForceCompleted),

        (S::Suspended, E::Resume) => Some(S::Started),
        (S::Suspended, E::Cancel) => Some(S::Cancelled),
        (S::Suspended, E::ForceComplete) => Some(S::ForceCompleted),

        (S::Parent, E::Complete) => Some(S::Completed),
        (S::Parent, E::Cancel) => Some(S::Cancelled),

        _ => None,
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub event: WorkItemEvent,
    pub from: WorkItemStatus,
    pub to: WorkItemStatus,
    pub participant: Option<ParticipantId>,
    pub data: Value,
}

/// 工作项 (Work Item)
///
/// Execution record of one task activation. Its status only changes
/// through [`WorkItem::apply`], which enforces the transition table and
/// appends to the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub case_id: CaseId,
    pub runner_id: RunnerId,
    pub task_id: TaskId,
    status: WorkItemStatus,
    timestamps: BTreeMap<WorkItemStatus, DateTime<Utc>>,
    pub input: Map<String, Value>,
    pub output: Map<String, Value>,
    pub offered_to: BTreeSet<ParticipantId>,
    pub allocated_to: Option<ParticipantId>,
    pub timer: Option<TimerSpec>,
    pub parent: Option<WorkItemId>,
    pub children: Vec<WorkItemId>,
    /// Sub-case runner launched for a composite task.
    pub child_runner: Option<RunnerId>,
    history: Vec<HistoryEntry>,
}

impl WorkItem {
    pub fn new(case_id: CaseId, runner_id: RunnerId, task_id: &str, input: Map<String, Value>) -> Self {
        Self::with_status(case_id, runner_id, task_id, input, WorkItemStatus::Enabled)
    }

    pub fn deadlocked(case_id: CaseId, runner_id: RunnerId, task_id: &str) -> Self {
        Self::with_status(case_id, runner_id, task_id, Map::new(), WorkItemStatus::Deadlocked)
    }

    fn with_status(
        case_id: CaseId,
        runner_id: RunnerId,
        task_id: &str,
        input: Map<String, Value>,
        status: WorkItemStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            case_id,
            runner_id,
            task_id: task_id.to_string(),
            status,
            timestamps: BTreeMap::from([(status, Utc::now())]),
            input,
            output: Map::new(),
            offered_to: BTreeSet::new(),
            allocated_to: None,
            timer: None,
            parent: None,
            children: Vec::new(),
            child_runner: None,
            history: Vec::new(),
        }
    }

    pub fn status(&self) -> WorkItemStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// When the item last entered `status`.
    pub fn entered_at(&self, status: WorkItemStatus) -> Option<DateTime<Utc>> {
        self.timestamps.get(&status).copied()
    }

    pub fn can_apply(&self, event: WorkItemEvent) -> bool {
        next_status(self.status, event).is_some()
    }

    /// Applies an event. Invalid events leave the item untouched.
    pub fn apply(&mut self, event: WorkItemEvent, participant: Option<&str>, data: Value) -> EngineResult<WorkItemStatus> {
        let to = next_status(self.status, event).ok_or(EngineError::InvalidTransition {
            work_item: self.id,
            status: self.status,
            event,
        })?;

        let now = Utc::now();
        self.history.push(HistoryEntry {
            timestamp: now,
            event,
            from: self.status,
            to,
            participant: participant.map(str::to_string),
            data,
        });
        self.timestamps.insert(to, now);
        self.status = to;
        Ok(to)
    }

    /// Whether `participant` was offered or holds this item.
    pub fn involves(&self, participant: &str) -> bool {
        self.offered_to.contains(participant) || self.allocated_to.as_deref() == Some(participant)
    }
}
