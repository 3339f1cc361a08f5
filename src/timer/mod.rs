use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::runtime::work_item::WorkItemId;

pub type TimerId = Uuid;

/// When a task's timer starts counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerTrigger {
    #[default]
    OnEnabled,
    OnStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerAction {
    /// Time the work item out (it ends FAILED).
    Fail,
    /// Force-complete the work item.
    Complete,
    Notify,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSpec {
    pub duration_ms: u64,
    #[serde(default)]
    pub trigger: TimerTrigger,
    pub action: TimerAction,
}

impl TimerSpec {
    pub fn new(duration: Duration, trigger: TimerTrigger, action: TimerAction) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
            trigger,
            action,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Delivered to the engine when a timer runs out.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerExpiry {
    pub timer_id: TimerId,
    pub work_item_id: WorkItemId,
    pub action: TimerAction,
}

/// Schedules expiry notifications keyed by work item.
pub trait TimerService: Send + Sync {
    fn create_timer(
        &self,
        work_item_id: WorkItemId,
        duration: Duration,
        trigger: TimerTrigger,
        action: TimerAction,
    ) -> Result<TimerId>;

    /// Cancelling an unknown or already fired timer is not an error.
    fn cancel_timer(&self, timer_id: TimerId) -> Result<()>;

    fn shutdown(&self) {}
}

/// Sleeps on the tokio runtime and sends a [`TimerExpiry`] to the engine's channel.
pub struct TokioTimerService {
    sender: mpsc::Sender<TimerExpiry>,
    handles: Arc<DashMap<TimerId, JoinHandle<()>>>,
}

impl TokioTimerService {
    pub fn new(sender: mpsc::Sender<TimerExpiry>) -> Self {
        Self {
            sender,
            handles: Arc::new(DashMap::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.handles.len()
    }
}

impl TimerService for TokioTimerService {
    fn create_timer(
        &self,
        work_item_id: WorkItemId,
        duration: Duration,
        trigger: TimerTrigger,
        action: TimerAction,
    ) -> Result<TimerId> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow!("timers need a tokio runtime: {}", e))?;

        let timer_id = Uuid::new_v4();
        let sender = self.sender.clone();
        let handles = self.handles.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            handles.remove(&timer_id);
            let expiry = TimerExpiry {
                timer_id,
                work_item_id,
                action,
            };
            if let Err(e) = sender.send(expiry).await {
                warn!(timer = %timer_id, "timer expiry dropped (engine gone?): {}", e);
            }
        });
        self.handles.insert(timer_id, handle);
        debug!(timer = %timer_id, work_item = %work_item_id, ?trigger, ?action, ?duration, "timer created");
        Ok(timer_id)
    }

    fn cancel_timer(&self, timer_id: TimerId) -> Result<()> {
        if let Some((_, handle)) = self.handles.remove(&timer_id) {
            handle.abort();
            debug!(timer = %timer_id, "timer cancelled");
        }
        Ok(())
    }

    fn shutdown(&self) {
        let ids: Vec<TimerId> = self.handles.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.handles.remove(&id) {
                handle.abort();
            }
        }
    }
}
