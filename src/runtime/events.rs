use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::runtime::net::TaskId;
use crate::runtime::runner::CaseId;
use crate::runtime::work_item::{ParticipantId, WorkItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SpecificationLoaded,
    SpecificationActivated,
    SpecificationDeactivated,
    SpecificationUnloaded,
    CaseCreated,
    CaseStarted,
    CaseSuspending,
    CaseSuspended,
    CaseResumed,
    CaseCompleted,
    CaseCancelled,
    CaseDeadlocked,
    SubCaseStarted,
    SubCaseCompleted,
    TaskFired,
    TaskAborted,
    WorkItemCreated,
    WorkItemStatusChanged,
    ResourcingUnfulfilled,
    TimerExpired,
    TimerNotify,
    TimerEscalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub case_id: Option<CaseId>,
    pub work_item_id: Option<WorkItemId>,
    pub task_id: Option<TaskId>,
    pub participant_id: Option<ParticipantId>,
    pub data: Value,
}

impl EngineEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            case_id: None,
            work_item_id: None,
            task_id: None,
            participant_id: None,
            data: Value::Null,
        }
    }

    pub fn case(mut self, case_id: CaseId) -> Self {
        self.case_id = Some(case_id);
        self
    }

    pub fn work_item(mut self, id: WorkItemId) -> Self {
        self.work_item_id = Some(id);
        self
    }

    pub fn task(mut self, task: &str) -> Self {
        self.task_id = Some(task.to_string());
        self
    }

    pub fn participant(mut self, participant: Option<&str>) -> Self {
        self.participant_id = participant.map(str::to_string);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Receives engine events synchronously, in emission order.
///
/// Returning an error (or panicking) never affects the operation that
/// emitted the event; the failure is logged and the next listener runs.
pub trait EngineListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent) -> Result<()>;
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn EngineListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn EngineListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn publish(&self, events: &[EngineEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        for event in events {
            for listener in &listeners {
                match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(kind = ?event.kind, error = %e, "event listener failed"),
                    Err(_) => error!(kind = ?event.kind, "event listener panicked"),
                }
            }
        }
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingListener;

impl EngineListener for TracingListener {
    fn on_event(&self, event: &EngineEvent) -> Result<()> {
        info!(
            kind = ?event.kind,
            case_id = ?event.case_id,
            work_item = ?event.work_item_id,
            task = ?event.task_id,
            participant = ?event.participant_id,
            data = %event.data,
            "engine event"
        );
        Ok(())
    }
}
