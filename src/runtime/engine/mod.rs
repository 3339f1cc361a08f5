//! 引擎 (Engine)
//!
//! Owns specifications and cases and drives the loop between work item
//! transitions and net firings. Each case sits behind its own
//! `tokio::sync::Mutex`; the tables themselves are `DashMap`s that are
//! only locked to insert or remove whole entries.
//!
//! Every public case operation runs as a transaction: the case is cloned
//! up front, follow-up work (resourcing, codelets) is drained, the result
//! is saved through the [`CaseStore`], and only then are events published
//! and timer cancellations applied. Any error restores the clone.

mod driver;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::codelets::{Codelet, CodeletRegistry};
use crate::compiler::core::Compiler;
use crate::config::{EngineConfig, StoreConfig};
use crate::dsl::SpecificationDef;
use crate::error::{EngineError, EngineResult};
use crate::resourcing::directory::StaticDirectory;
use crate::resourcing::{DistributionMetrics, ResourceDispatch};
use crate::runtime::case::{CaseSnapshot, CaseState, CaseStatus};
use crate::runtime::events::{EngineEvent, EngineListener, EventBus, EventKind};
use crate::runtime::net::{ConditionId, Specification, SpecificationId, TaskId};
use crate::runtime::redis_storage::RedisCaseStore;
use crate::runtime::runner::{CaseId, NetRunner, RunnerId, RunnerSnapshot};
use crate::runtime::storage::{CaseStore, InMemoryCaseStore};
use crate::runtime::work_item::{ParticipantId, WorkItem, WorkItemEvent, WorkItemId, WorkItemStatus};
use crate::timer::{TimerAction, TimerExpiry, TimerId, TimerService, TokioTimerService};

struct SpecEntry {
    spec: Arc<Specification>,
    active: bool,
}

/// Follow-up work queued while a case is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Fire and resource an ENABLED work item.
    Resource(WorkItemId),
    /// Run the codelet of an EXECUTING work item.
    Execute(WorkItemId),
}

/// Side effects buffered until the operation commits.
#[derive(Default)]
struct Effects {
    events: Vec<EngineEvent>,
    created_timers: Vec<TimerId>,
    cancelled_timers: Vec<TimerId>,
    pending: VecDeque<Pending>,
}

impl Effects {
    fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }
}

struct Txn {
    before: CaseState,
    fx: Effects,
}

impl Txn {
    fn begin(case: &CaseState) -> Self {
        Self {
            before: case.clone(),
            fx: Effects::default(),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    specs: DashMap<SpecificationId, SpecEntry>,
    cases: DashMap<CaseId, Arc<Mutex<CaseState>>>,
    work_item_index: DashMap<WorkItemId, CaseId>,
    participant_load: DashMap<ParticipantId, usize>,
    events: EventBus,
    codelets: CodeletRegistry,
    dispatch: Arc<dyn ResourceDispatch>,
    timers: Arc<dyn TimerService>,
    timer_sender: mpsc::Sender<TimerExpiry>,
    timer_receiver: Mutex<Option<mpsc::Receiver<TimerExpiry>>>,
    store: Option<Arc<dyn CaseStore>>,
    shut_down: AtomicBool,
    shutdown_signal: Notify,
}

pub struct EngineBuilder {
    config: EngineConfig,
    dispatch: Option<Arc<dyn ResourceDispatch>>,
    timers: Option<Arc<dyn TimerService>>,
    store: Option<Arc<dyn CaseStore>>,
    listeners: Vec<Arc<dyn EngineListener>>,
    codelets: Vec<Arc<dyn Codelet>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dispatch(mut self, dispatch: Arc<dyn ResourceDispatch>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Replaces the tokio timer service. Expiries must then be fed to
    /// [`Engine::handle_timer_expiry`] (or through [`Engine::timer_sender`]).
    pub fn timer_service(mut self, timers: Arc<dyn TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Overrides the store selected by the configuration.
    pub fn store(mut self, store: Arc<dyn CaseStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EngineListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn codelet(mut self, codelet: Arc<dyn Codelet>) -> Self {
        self.codelets.push(codelet);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let (tx, rx) = mpsc::channel(self.config.timer_channel_capacity.max(1));

        let store: Option<Arc<dyn CaseStore>> = match self.store {
            Some(store) => Some(store),
            None => match &self.config.store {
                StoreConfig::None => None,
                StoreConfig::Memory => Some(Arc::new(InMemoryCaseStore::new())),
                StoreConfig::Redis { url } => Some(Arc::new(
                    RedisCaseStore::open(url).map_err(|e| EngineError::Persistence(e.to_string()))?,
                )),
            },
        };

        let timers: Arc<dyn TimerService> = match self.timers {
            Some(timers) => timers,
            None => Arc::new(TokioTimerService::new(tx.clone())),
        };

        let codelets = CodeletRegistry::with_builtins();
        for codelet in self.codelets {
            codelets.register(codelet);
        }

        let events = EventBus::new();
        for listener in self.listeners {
            events.subscribe(listener);
        }

        Ok(Engine {
            config: self.config,
            specs: DashMap::new(),
            cases: DashMap::new(),
            work_item_index: DashMap::new(),
            participant_load: DashMap::new(),
            events,
            codelets,
            dispatch: self.dispatch.unwrap_or_else(|| Arc::new(StaticDirectory::new())),
            timers,
            timer_sender: tx,
            timer_receiver: Mutex::new(Some(rx)),
            store,
            shut_down: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
        })
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            config: EngineConfig::default(),
            dispatch: None,
            timers: None,
            store: None,
            listeners: Vec::new(),
            codelets: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self, listener: Arc<dyn EngineListener>) {
        self.events.subscribe(listener);
    }

    pub fn register_codelet(&self, codelet: Arc<dyn Codelet>) {
        self.codelets.register(codelet);
    }

    pub fn timer_sender(&self) -> mpsc::Sender<TimerExpiry> {
        self.timer_sender.clone()
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        Ok(())
    }

    // --- specifications ---

    /// Compiles and loads a definition. The specification starts inactive.
    pub fn load_definition(&self, def: SpecificationDef) -> EngineResult<SpecificationId> {
        let spec = Compiler::new().compile(def)?;
        self.load_specification(spec)
    }

    pub fn load_specification(&self, spec: Specification) -> EngineResult<SpecificationId> {
        self.ensure_running()?;
        for net in spec.nets.values() {
            for task in net.tasks.values() {
                if let Some(codelet) = task.codelet.as_deref().and_then(|name| self.codelets.get(name)) {
                    codelet.validate(&task.params).map_err(|e| {
                        EngineError::Validation(format!("task '{}' codelet '{}': {}", task.id, codelet.name(), e))
                    })?;
                }
            }
        }

        let id = spec.id.clone();
        match self.specs.entry(id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::SpecificationExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(SpecEntry {
                    spec: Arc::new(spec),
                    active: false,
                });
            }
        }
        info!(specification = %id, "specification loaded");
        self.events
            .publish(&[EngineEvent::new(EventKind::SpecificationLoaded).data(json!({ "specification": id }))]);
        Ok(id)
    }

    pub fn activate_specification(&self, id: &str) -> EngineResult<()> {
        self.set_active(id, true, EventKind::SpecificationActivated)
    }

    /// Running cases continue; no new case can be created.
    pub fn deactivate_specification(&self, id: &str) -> EngineResult<()> {
        self.set_active(id, false, EventKind::SpecificationDeactivated)
    }

    fn set_active(&self, id: &str, active: bool, kind: EventKind) -> EngineResult<()> {
        {
            let mut entry = self
                .specs
                .get_mut(id)
                .ok_or_else(|| EngineError::SpecificationNotFound(id.to_string()))?;
            entry.active = active;
        }
        debug!(specification = %id, active, "specification state changed");
        self.events.publish(&[EngineEvent::new(kind).data(json!({ "specification": id }))]);
        Ok(())
    }

    /// Fails while an unfinished case still uses the specification.
    pub async fn unload_specification(&self, id: &str) -> EngineResult<()> {
        if !self.specs.contains_key(id) {
            return Err(EngineError::SpecificationNotFound(id.to_string()));
        }
        for handle in self.case_handles() {
            let case = handle.lock().await;
            if case.spec.id == id && !case.status.is_finished() {
                return Err(EngineError::SpecificationInUse(id.to_string()));
            }
        }
        self.specs.remove(id);
        info!(specification = %id, "specification unloaded");
        self.events
            .publish(&[EngineEvent::new(EventKind::SpecificationUnloaded).data(json!({ "specification": id }))]);
        Ok(())
    }

    pub fn specification(&self, id: &str) -> Option<Arc<Specification>> {
        self.specs.get(id).map(|e| e.spec.clone())
    }

    pub fn is_specification_active(&self, id: &str) -> bool {
        self.specs.get(id).map(|e| e.active).unwrap_or(false)
    }

    // --- cases ---

    /// Creates a case in CREATED status. Case data overrides the
    /// specification's initial variables.
    pub async fn create_case(&self, spec_id: &str, data: Map<String, Value>) -> EngineResult<CaseId> {
        self.ensure_running()?;
        let spec = {
            let entry = self
                .specs
                .get(spec_id)
                .ok_or_else(|| EngineError::SpecificationNotFound(spec_id.to_string()))?;
            if !entry.active {
                return Err(EngineError::SpecificationInactive(spec_id.to_string()));
            }
            entry.spec.clone()
        };
        let root_net = spec.root().ok_or_else(|| {
            EngineError::Validation(format!("root net '{}' is missing", spec.root_net))
        })?;

        let mut initial = spec.variables.clone();
        initial.extend(data);
        let root = NetRunner::new(uuid::Uuid::new_v4(), root_net, initial);
        let case = CaseState::new(spec.clone(), root);
        let case_id = case.id;

        self.persist(&case).await?;
        self.cases.insert(case_id, Arc::new(Mutex::new(case)));

        info!(case_id = %case_id, specification = %spec_id, "case created");
        self.events.publish(&[EngineEvent::new(EventKind::CaseCreated)
            .case(case_id)
            .data(json!({ "specification": spec_id }))]);
        Ok(case_id)
    }

    pub async fn start_case(&self, case_id: CaseId) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_handle(case_id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.start_case_in(&mut case, &mut txn.fx);
        self.finish(&mut case, txn, result).await
    }

    pub async fn launch_case(&self, spec_id: &str, data: Map<String, Value>) -> EngineResult<CaseId> {
        let case_id = self.create_case(spec_id, data).await?;
        self.start_case(case_id).await?;
        Ok(case_id)
    }

    /// Cancels every sub-case runner first, then the case's own work items.
    pub async fn cancel_case(&self, case_id: CaseId) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_handle(case_id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.cancel_case_in(&mut case, &mut txn.fx);
        self.finish(&mut case, txn, result).await
    }

    pub async fn suspend_case(&self, case_id: CaseId) -> EngineResult<CaseStatus> {
        self.ensure_running()?;
        let handle = self.case_handle(case_id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.suspend_case_in(&mut case, &mut txn.fx);
        self.finish(&mut case, txn, result).await
    }

    pub async fn resume_case(&self, case_id: CaseId) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_handle(case_id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.resume_case_in(&mut case, &mut txn.fx);
        self.finish(&mut case, txn, result).await
    }

    // --- work items ---

    /// Fires and resources an ENABLED work item (used when
    /// `resource_on_enable` is off, or to retry by hand).
    pub async fn fire_work_item(&self, id: WorkItemId) -> EngineResult<WorkItemStatus> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.fire_work_item_in(&mut case, &mut txn.fx, id).await;
        self.finish(&mut case, txn, result).await
    }

    pub async fn allocate_work_item(&self, id: WorkItemId, participant: &str) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.allocate_in(&mut case, &mut txn.fx, id, participant);
        self.finish(&mut case, txn, result).await
    }

    pub async fn start_work_item(&self, id: WorkItemId, participant: &str) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.start_in(&mut case, &mut txn.fx, id, participant);
        self.finish(&mut case, txn, result).await
    }

    pub async fn complete_work_item(
        &self,
        id: WorkItemId,
        participant: &str,
        output: Map<String, Value>,
    ) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.complete_by_participant(&mut case, &mut txn.fx, id, participant, output);
        self.finish(&mut case, txn, result).await
    }

    pub async fn fail_work_item(&self, id: WorkItemId, participant: &str) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = Self::ensure_holder(case.item(&id)?, participant)
            .and_then(|_| self.fail_item(&mut case, &mut txn.fx, id, WorkItemEvent::Fail, Some(participant)));
        self.finish(&mut case, txn, result).await
    }

    pub async fn suspend_work_item(&self, id: WorkItemId, participant: &str) -> EngineResult<()> {
        self.simple_transition(id, participant, WorkItemEvent::Suspend).await
    }

    pub async fn resume_work_item(&self, id: WorkItemId, participant: &str) -> EngineResult<()> {
        self.simple_transition(id, participant, WorkItemEvent::Resume).await
    }

    /// Hands an allocated item back as an offer to `to`.
    pub async fn delegate_work_item(&self, id: WorkItemId, from: &str, to: &str) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.delegate_in(&mut case, &mut txn.fx, id, from, to);
        self.finish(&mut case, txn, result).await
    }

    pub async fn reallocate_work_item(&self, id: WorkItemId, from: &str, to: &str) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.reallocate_in(&mut case, &mut txn.fx, id, from, to);
        self.finish(&mut case, txn, result).await
    }

    /// Completes an ENABLED item without doing its work; the task fires with no data.
    pub async fn skip_work_item(&self, id: WorkItemId, participant: Option<&str>) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.complete_item(&mut case, &mut txn.fx, id, WorkItemEvent::Skip, participant, Map::new());
        self.finish(&mut case, txn, result).await
    }

    pub async fn force_complete_work_item(&self, id: WorkItemId, output: Map<String, Value>) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.complete_item(&mut case, &mut txn.fx, id, WorkItemEvent::ForceComplete, None, output);
        self.finish(&mut case, txn, result).await
    }

    async fn simple_transition(&self, id: WorkItemId, participant: &str, event: WorkItemEvent) -> EngineResult<()> {
        self.ensure_running()?;
        let handle = self.case_of(id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = Self::ensure_holder(case.item(&id)?, participant).and_then(|_| {
            self.transition(&mut case, &mut txn.fx, id, event, Some(participant), Value::Null)
                .map(|_| ())
        });
        self.finish(&mut case, txn, result).await
    }

    // --- timers ---

    /// Applies a timer expiry through the case lock. Expiries for timers
    /// that were cancelled or replaced in the meantime are ignored.
    pub async fn handle_timer_expiry(&self, expiry: TimerExpiry) -> EngineResult<()> {
        self.ensure_running()?;
        let case_id = match self.work_item_index.get(&expiry.work_item_id) {
            Some(c) => *c,
            None => {
                debug!(work_item = %expiry.work_item_id, "timer expired for unknown work item");
                return Ok(());
            }
        };
        let handle = self.case_handle(case_id)?;
        let mut case = handle.lock().await;
        let mut txn = Txn::begin(&case);
        let result = self.timer_expired_in(&mut case, &mut txn.fx, &expiry);
        self.finish(&mut case, txn, result).await
    }

    /// Processes timer expiries until shutdown. Only one loop may run per engine.
    pub async fn run_timers(&self) {
        let mut rx = match self.timer_receiver.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("timer loop already running");
                return;
            }
        };
        info!("Timer loop started.");

        loop {
            let notified = self.shutdown_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shut_down.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = &mut notified => break,
                expiry = rx.recv() => match expiry {
                    Some(expiry) => {
                        let work_item = expiry.work_item_id;
                        if let Err(e) = self.handle_timer_expiry(expiry).await {
                            error!(work_item = %work_item, error = %e, "timer expiry handling failed");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("Timer loop stopped.");
    }

    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timers.shutdown();
        self.shutdown_signal.notify_waiters();
        info!(cases = self.cases.len(), "engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    // --- queries ---

    pub fn case_ids(&self) -> Vec<CaseId> {
        self.cases.iter().map(|e| *e.key()).collect()
    }

    pub async fn case_status(&self, case_id: CaseId) -> EngineResult<CaseStatus> {
        let handle = self.case_handle(case_id)?;
        let case = handle.lock().await;
        Ok(case.status)
    }

    /// Root runner data.
    pub async fn case_data(&self, case_id: CaseId) -> EngineResult<Map<String, Value>> {
        let handle = self.case_handle(case_id)?;
        let case = handle.lock().await;
        Ok(case.root_runner()?.data().clone())
    }

    pub async fn case_snapshot(&self, case_id: CaseId) -> EngineResult<CaseSnapshot> {
        let handle = self.case_handle(case_id)?;
        let case = handle.lock().await;
        Ok(case.snapshot())
    }

    /// Token counts per condition of a runner (the root when `runner` is `None`).
    pub async fn marking(&self, case_id: CaseId, runner: Option<RunnerId>) -> EngineResult<BTreeMap<ConditionId, usize>> {
        let handle = self.case_handle(case_id)?;
        let case = handle.lock().await;
        let runner = runner.unwrap_or(case.root);
        Ok(case.runner(&runner)?.marking().counts())
    }

    pub async fn runner_snapshot(&self, case_id: CaseId, runner: RunnerId) -> EngineResult<RunnerSnapshot> {
        let handle = self.case_handle(case_id)?;
        let case = handle.lock().await;
        Ok(case.runner(&runner)?.snapshot())
    }

    pub async fn enabled_tasks(&self, case_id: CaseId) -> EngineResult<BTreeSet<TaskId>> {
        let handle = self.case_handle(case_id)?;
        let case = handle.lock().await;
        Ok(case.root_runner()?.enabled().clone())
    }

    pub async fn work_item(&self, id: WorkItemId) -> EngineResult<WorkItem> {
        let handle = self.case_of(id)?;
        let case = handle.lock().await;
        case.item(&id).cloned()
    }

    pub async fn work_items_for_case(&self, case_id: CaseId) -> EngineResult<Vec<WorkItem>> {
        let handle = self.case_handle(case_id)?;
        let case = handle.lock().await;
        Ok(case.work_items.values().cloned().collect())
    }

    /// Items offered to or held by `participant`, optionally in one status.
    pub async fn work_items_for_participant(
        &self,
        participant: &str,
        status: Option<WorkItemStatus>,
    ) -> Vec<WorkItem> {
        let mut found = Vec::new();
        for handle in self.case_handles() {
            let case = handle.lock().await;
            found.extend(
                case.work_items
                    .values()
                    .filter(|w| w.involves(participant))
                    .filter(|w| status.is_none_or(|s| w.status() == s))
                    .cloned(),
            );
        }
        found
    }

    /// Allocated, started or suspended items a participant holds across all cases.
    pub fn participant_load(&self, participant: &str) -> usize {
        self.participant_load.get(participant).map(|v| *v).unwrap_or(0)
    }

    // --- plumbing ---

    fn case_handle(&self, case_id: CaseId) -> EngineResult<Arc<Mutex<CaseState>>> {
        self.cases
            .get(&case_id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::CaseNotFound(case_id))
    }

    fn case_handles(&self) -> Vec<Arc<Mutex<CaseState>>> {
        self.cases.iter().map(|c| c.value().clone()).collect()
    }

    fn case_of(&self, work_item: WorkItemId) -> EngineResult<Arc<Mutex<CaseState>>> {
        let case_id = self
            .work_item_index
            .get(&work_item)
            .map(|c| *c)
            .ok_or(EngineError::WorkItemNotFound(work_item))?;
        self.case_handle(case_id)
    }

    fn metrics(&self) -> DistributionMetrics {
        DistributionMetrics {
            queue_lengths: self
                .participant_load
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    async fn persist(&self, case: &CaseState) -> EngineResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let result = if case.status.is_finished() {
            store.remove(case.id).await
        } else {
            store.save(&case.snapshot()).await
        };
        result.map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Drains follow-up work, saves, then commits or rolls back.
    async fn finish<T>(&self, case: &mut CaseState, txn: Txn, result: EngineResult<T>) -> EngineResult<T> {
        let Txn { before, mut fx } = txn;
        let result = match result {
            Ok(value) => self.drain(case, &mut fx).await.map(|_| value),
            Err(e) => Err(e),
        };
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                debug!(case_id = %case.id, error = %e, "operation rolled back");
                self.rollback(case, before, fx);
                return Err(e);
            }
        };
        if let Err(e) = self.persist(case).await {
            error!(case_id = %case.id, error = %e, "case save failed, rolling back");
            self.rollback(case, before, fx);
            return Err(e);
        }
        self.commit(&before, case, fx);
        Ok(value)
    }

    fn rollback(&self, case: &mut CaseState, before: CaseState, fx: Effects) {
        *case = before;
        for timer in fx.created_timers {
            if let Err(e) = self.timers.cancel_timer(timer) {
                warn!(timer = %timer, error = %e, "failed to cancel timer during rollback");
            }
        }
    }

    fn commit(&self, before: &CaseState, after: &CaseState, fx: Effects) {
        for id in after.work_items.keys() {
            if !before.work_items.contains_key(id) {
                self.work_item_index.insert(*id, after.id);
            }
        }

        let old_load = before.participant_load();
        let new_load = after.participant_load();
        let participants: HashSet<&ParticipantId> = old_load.keys().chain(new_load.keys()).collect();
        for p in participants {
            let old = old_load.get(p).copied().unwrap_or(0);
            let new = new_load.get(p).copied().unwrap_or(0);
            if old == new {
                continue;
            }
            let mut load = self.participant_load.entry(p.clone()).or_insert(0);
            *load = (*load + new).saturating_sub(old);
        }

        for timer in fx.cancelled_timers {
            if let Err(e) = self.timers.cancel_timer(timer) {
                warn!(timer = %timer, error = %e, "failed to cancel timer");
            }
        }

        self.events.publish(&fx.events);
    }

    fn ensure_holder(item: &WorkItem, participant: &str) -> EngineResult<()> {
        match &item.allocated_to {
            Some(holder) if holder != participant => Err(EngineError::ParticipantNotEligible {
                participant: participant.to_string(),
                work_item: item.id,
            }),
            _ => Ok(()),
        }
    }

    fn timer_expired_in(&self, case: &mut CaseState, fx: &mut Effects, expiry: &TimerExpiry) -> EngineResult<()> {
        let wi = expiry.work_item_id;
        if case.timers.get(&wi) != Some(&expiry.timer_id) {
            debug!(work_item = %wi, timer = %expiry.timer_id, "stale timer expiry ignored");
            return Ok(());
        }
        case.timers.remove(&wi);

        let (task, status) = {
            let item = case.item(&wi)?;
            (item.task_id.clone(), item.status())
        };
        info!(case_id = %case.id, work_item = %wi, task = %task, action = ?expiry.action, "timer expired");
        fx.emit(
            EngineEvent::new(EventKind::TimerExpired)
                .case(case.id)
                .work_item(wi)
                .task(&task)
                .data(json!({ "action": expiry.action, "timer": expiry.timer_id })),
        );

        match expiry.action {
            TimerAction::Fail => {
                if case.item(&wi)?.can_apply(WorkItemEvent::Timeout) {
                    self.fail_item(case, fx, wi, WorkItemEvent::Timeout, None)?;
                } else {
                    warn!(work_item = %wi, status = ?status, "timeout ignored in current status");
                }
            }
            TimerAction::Complete => {
                if case.item(&wi)?.can_apply(WorkItemEvent::ForceComplete) {
                    self.complete_item(case, fx, wi, WorkItemEvent::ForceComplete, None, Map::new())?;
                } else {
                    warn!(work_item = %wi, status = ?status, "timer completion ignored in current status");
                }
            }
            TimerAction::Notify => {
                fx.emit(EngineEvent::new(EventKind::TimerNotify).case(case.id).work_item(wi).task(&task));
            }
            TimerAction::Escalate => {
                fx.emit(EngineEvent::new(EventKind::TimerEscalate).case(case.id).work_item(wi).task(&task));
            }
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.timers.shutdown();
    }
}
