use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{Effects, Engine, Pending};
use crate::error::{EngineError, EngineResult};
use crate::resourcing::{CompletionRecord, InitialAction, ResourcingContext};
use crate::runtime::case::{CaseState, CaseStatus};
use crate::runtime::events::{EngineEvent, EventKind};
use crate::runtime::net::{Net, Task, TaskKind};
use crate::runtime::runner::{ExecutionStatus, NetRunner, ParentLink, RunnerId};
use crate::runtime::work_item::{WorkItem, WorkItemEvent, WorkItemId, WorkItemStatus};
use crate::timer::{TimerSpec, TimerTrigger};

impl Engine {
    // --- case level ---

    pub(super) fn start_case_in(&self, case: &mut CaseState, fx: &mut Effects) -> EngineResult<()> {
        if case.status != CaseStatus::Created {
            return Err(case_state_error(case));
        }
        let root = case.root;
        case.runner_mut(&root)?.start()?;
        case.status = CaseStatus::Running;
        info!(case_id = %case.id, specification = %case.spec.id, "case started");
        fx.emit(EngineEvent::new(EventKind::CaseStarted).case(case.id));
        self.refresh_runner(case, fx, root)
    }

    pub(super) fn cancel_case_in(&self, case: &mut CaseState, fx: &mut Effects) -> EngineResult<()> {
        if case.status.is_finished() {
            return Err(case_state_error(case));
        }
        let root = case.root;
        self.cancel_runner(case, fx, root)?;
        for (_, timer) in case.timers.drain() {
            fx.cancelled_timers.push(timer);
        }
        case.status = CaseStatus::Cancelled;
        info!(case_id = %case.id, "case cancelled");
        fx.emit(EngineEvent::new(EventKind::CaseCancelled).case(case.id));
        Ok(())
    }

    pub(super) fn suspend_case_in(&self, case: &mut CaseState, fx: &mut Effects) -> EngineResult<CaseStatus> {
        if case.status != CaseStatus::Running {
            return Err(case_state_error(case));
        }
        for runner in case.runners.values_mut() {
            runner.suspend();
        }
        case.status = CaseStatus::Suspending;
        fx.emit(EngineEvent::new(EventKind::CaseSuspending).case(case.id));
        self.settle_case_suspension(case, fx);
        Ok(case.status)
    }

    pub(super) fn resume_case_in(&self, case: &mut CaseState, fx: &mut Effects) -> EngineResult<()> {
        if !matches!(case.status, CaseStatus::Suspending | CaseStatus::Suspended) {
            return Err(case_state_error(case));
        }
        let root = case.root;
        let mut order = vec![root];
        order.extend(case.descendants(&root));
        for id in &order {
            case.runner_mut(id)?.resume();
        }
        case.status = CaseStatus::Running;
        info!(case_id = %case.id, "case resumed");
        fx.emit(EngineEvent::new(EventKind::CaseResumed).case(case.id));
        for id in order {
            // a sub-case may have completed while an earlier runner was refreshed
            if case.runners.contains_key(&id) && !case.status.is_finished() {
                self.refresh_runner(case, fx, id)?;
            }
        }
        Ok(())
    }

    /// A SUSPENDING runner whose busy tasks only wait on suspended sub-cases
    /// settles too; repeated so a settled sub-case lets its parent settle.
    fn settle_case_suspension(&self, case: &mut CaseState, fx: &mut Effects) {
        if case.status != CaseStatus::Suspending {
            return;
        }
        loop {
            let waiting: Vec<RunnerId> = case
                .runners
                .values()
                .filter(|r| r.status() == ExecutionStatus::Suspending)
                .map(|r| r.id())
                .filter(|id| case.waits_only_on_suspended_subcases(id))
                .collect();
            if waiting.is_empty() {
                break;
            }
            for id in waiting {
                if let Some(runner) = case.runners.get_mut(&id) {
                    runner.settle_suspended();
                }
            }
        }
        if case.runners.values().all(|r| r.status() == ExecutionStatus::Suspended) {
            case.status = CaseStatus::Suspended;
            info!(case_id = %case.id, "case suspended");
            fx.emit(EngineEvent::new(EventKind::CaseSuspended).case(case.id));
        }
    }

    // --- work item operations ---

    pub(super) async fn fire_work_item_in(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
    ) -> EngineResult<WorkItemStatus> {
        let item = case.item(&id)?;
        if !item.can_apply(WorkItemEvent::Fire) {
            return Err(EngineError::InvalidTransition {
                work_item: id,
                status: item.status(),
                event: WorkItemEvent::Fire,
            });
        }
        self.resource(case, fx, id).await?;
        Ok(case.item(&id)?.status())
    }

    pub(super) fn allocate_in(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        participant: &str,
    ) -> EngineResult<()> {
        let item = case.item(&id)?;
        if item.status() == WorkItemStatus::Offered && !item.offered_to.contains(participant) {
            return Err(not_eligible(participant, id));
        }
        self.transition(case, fx, id, WorkItemEvent::Allocate, Some(participant), Value::Null)?;
        let item = case.item_mut(&id)?;
        item.allocated_to = Some(participant.to_string());
        item.offered_to.clear();
        Ok(())
    }

    pub(super) fn start_in(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        participant: &str,
    ) -> EngineResult<()> {
        let item = case.item(&id)?;
        Engine::ensure_holder(item, participant)?;
        if !item.can_apply(WorkItemEvent::Start) {
            return Err(EngineError::InvalidTransition {
                work_item: id,
                status: item.status(),
                event: WorkItemEvent::Start,
            });
        }
        let (runner_id, task_id, is_child) = (item.runner_id, item.task_id.clone(), item.parent.is_some());

        if !is_child {
            self.begin(case, fx, runner_id, &task_id)?;
        }
        self.transition(case, fx, id, WorkItemEvent::Start, Some(participant), Value::Null)?;
        case.item_mut(&id)?.allocated_to = Some(participant.to_string());
        self.start_timer_on(case, fx, id, TimerTrigger::OnStarted)
    }

    pub(super) fn complete_by_participant(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        participant: &str,
        output: Map<String, Value>,
    ) -> EngineResult<()> {
        let item = case.item(&id)?;
        Engine::ensure_holder(item, participant)?;
        if item.status() == WorkItemStatus::Parent {
            // a multi-instance parent completes through its children
            return Err(EngineError::InvalidTransition {
                work_item: id,
                status: item.status(),
                event: WorkItemEvent::Complete,
            });
        }
        self.complete_item(case, fx, id, WorkItemEvent::Complete, Some(participant), output)
    }

    pub(super) fn delegate_in(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        from: &str,
        to: &str,
    ) -> EngineResult<()> {
        let item = case.item(&id)?;
        if item.allocated_to.as_deref() != Some(from) {
            return Err(not_eligible(from, id));
        }
        self.transition(case, fx, id, WorkItemEvent::Delegate, Some(from), json!({ "to": to }))?;
        let item = case.item_mut(&id)?;
        item.allocated_to = None;
        item.offered_to.clear();
        item.offered_to.insert(to.to_string());
        Ok(())
    }

    pub(super) fn reallocate_in(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        from: &str,
        to: &str,
    ) -> EngineResult<()> {
        let item = case.item(&id)?;
        if item.allocated_to.as_deref() != Some(from) {
            return Err(not_eligible(from, id));
        }
        self.transition(case, fx, id, WorkItemEvent::Reallocate, Some(from), json!({ "to": to }))?;
        case.item_mut(&id)?.allocated_to = Some(to.to_string());
        Ok(())
    }

    // --- internals ---

    /// Applies a work item event and records the status change event.
    pub(super) fn transition(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        event: WorkItemEvent,
        participant: Option<&str>,
        data: Value,
    ) -> EngineResult<WorkItemStatus> {
        let case_id = case.id;
        let item = case.item_mut(&id)?;
        let from = item.status();
        let to = item.apply(event, participant, data)?;
        debug!(case_id = %case_id, work_item = %id, task = %item.task_id, ?event, ?from, ?to, "work item transition");
        fx.emit(
            EngineEvent::new(EventKind::WorkItemStatusChanged)
                .case(case_id)
                .work_item(id)
                .task(&item.task_id)
                .participant(participant)
                .data(json!({ "event": event, "from": from, "to": to })),
        );
        Ok(to)
    }

    fn create_work_item(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        runner_id: RunnerId,
        task_id: &str,
    ) -> EngineResult<WorkItemId> {
        let runner = case.runner(&runner_id)?;
        let task = runner
            .net()
            .task(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let mut item = WorkItem::new(case.id, runner_id, task_id, runner.data().clone());
        item.timer = task.timer.clone();
        let id = item.id;
        case.work_items.insert(id, item);

        fx.emit(
            EngineEvent::new(EventKind::WorkItemCreated)
                .case(case.id)
                .work_item(id)
                .task(task_id)
                .data(json!({ "runner": runner_id })),
        );
        self.start_timer_on(case, fx, id, TimerTrigger::OnEnabled)?;
        if self.config.resource_on_enable {
            fx.pending.push_back(Pending::Resource(id));
        }
        Ok(id)
    }

    fn start_timer_on(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        trigger: TimerTrigger,
    ) -> EngineResult<()> {
        let item = case.item(&id)?;
        let spec: TimerSpec = match &item.timer {
            Some(spec) if spec.trigger == trigger && item.parent.is_none() => spec.clone(),
            _ => return Ok(()),
        };
        let timer = self
            .timers
            .create_timer(id, spec.duration(), spec.trigger, spec.action)
            .map_err(|e| EngineError::Timer(e.to_string()))?;
        fx.created_timers.push(timer);
        if let Some(old) = case.timers.insert(id, timer) {
            fx.cancelled_timers.push(old);
        }
        Ok(())
    }

    fn stop_timer(&self, case: &mut CaseState, fx: &mut Effects, id: WorkItemId) {
        if let Some(timer) = case.timers.remove(&id) {
            fx.cancelled_timers.push(timer);
        }
    }

    /// Runs queued resourcing and codelets until nothing is left.
    pub(super) async fn drain(&self, case: &mut CaseState, fx: &mut Effects) -> EngineResult<()> {
        while let Some(next) = fx.pending.pop_front() {
            match next {
                Pending::Resource(id) => {
                    if case.item(&id)?.status() == WorkItemStatus::Enabled {
                        self.resource(case, fx, id).await?;
                    }
                }
                Pending::Execute(id) => {
                    if case.item(&id)?.status() == WorkItemStatus::Executing {
                        self.execute(case, fx, id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconciles work items with the runner after its marking changed.
    fn refresh_runner(&self, case: &mut CaseState, fx: &mut Effects, runner_id: RunnerId) -> EngineResult<()> {
        if case.status.is_finished() {
            return Ok(());
        }
        let runner = case.runner_mut(&runner_id)?;
        let delta = runner.continue_if_possible();
        if !delta.newly_enabled.is_empty() || !delta.withdrawn.is_empty() {
            debug!(
                runner = %runner_id,
                enabled = ?delta.newly_enabled,
                withdrawn = ?delta.withdrawn,
                "enabled set changed"
            );
        }
        if runner.is_completed() {
            return self.runner_completed(case, fx, runner_id);
        }

        let enabled = runner.enabled().clone();
        let busy = runner.busy().clone();

        let stale: Vec<WorkItemId> = case
            .work_items
            .values()
            .filter(|w| w.runner_id == runner_id && w.parent.is_none())
            .filter(|w| {
                matches!(
                    w.status(),
                    WorkItemStatus::Enabled
                        | WorkItemStatus::Fired
                        | WorkItemStatus::Offered
                        | WorkItemStatus::Allocated
                )
            })
            .filter(|w| !enabled.contains(&w.task_id) && !busy.contains(&w.task_id))
            .map(|w| w.id)
            .collect();
        for id in stale {
            self.cancel_item(case, fx, id)?;
        }

        for task in &enabled {
            if case.active_items_for(&runner_id, task).is_empty() {
                self.create_work_item(case, fx, runner_id, task)?;
            }
        }

        self.check_deadlock(case, fx, runner_id)?;
        self.settle_case_suspension(case, fx);
        Ok(())
    }

    fn check_deadlock(&self, case: &mut CaseState, fx: &mut Effects, runner_id: RunnerId) -> EngineResult<()> {
        let runner = case.runner(&runner_id)?;
        if !runner.is_deadlocked() {
            case.deadlocked.remove(&runner_id);
            return Ok(());
        }
        if !case.deadlocked.insert(runner_id) {
            return Ok(());
        }

        let runner = case.runner(&runner_id)?;
        let stranded = runner.stranded_tasks();
        let marking = runner.marking().counts();
        warn!(case_id = %case.id, runner = %runner_id, stranded = ?stranded, "case deadlocked");
        fx.emit(
            EngineEvent::new(EventKind::CaseDeadlocked)
                .case(case.id)
                .data(json!({ "runner": runner_id, "marking": marking, "tasks": stranded })),
        );
        for task in stranded {
            let item = WorkItem::deadlocked(case.id, runner_id, &task);
            fx.emit(
                EngineEvent::new(EventKind::WorkItemCreated)
                    .case(case.id)
                    .work_item(item.id)
                    .task(&task)
                    .data(json!({ "runner": runner_id, "status": WorkItemStatus::Deadlocked })),
            );
            case.work_items.insert(item.id, item);
        }
        Ok(())
    }

    /// Moves a task to busy in its runner and cancels the items of every
    /// task that lost its enablement: withdrawn deferred choice siblings and
    /// tasks that needed the tokens the begun task now holds.
    fn begin(&self, case: &mut CaseState, fx: &mut Effects, runner_id: RunnerId, task_id: &str) -> EngineResult<()> {
        let withdrawn = case.runner_mut(&runner_id)?.begin_task(task_id)?;
        for sibling in withdrawn {
            for id in case.active_items_for(&runner_id, &sibling) {
                self.cancel_item(case, fx, id)?;
            }
        }
        Ok(())
    }

    fn task_of(case: &CaseState, id: &WorkItemId) -> EngineResult<(Arc<Net>, RunnerId, String)> {
        let item = case.item(id)?;
        let net = Arc::clone(case.runner(&item.runner_id)?.net());
        if net.task(&item.task_id).is_none() {
            return Err(EngineError::TaskNotFound(item.task_id.clone()));
        }
        Ok((net, item.runner_id, item.task_id.clone()))
    }

    /// ENABLED -> FIRED, then hands the item to the path its task needs.
    async fn resource(&self, case: &mut CaseState, fx: &mut Effects, id: WorkItemId) -> EngineResult<()> {
        let (net, runner_id, task_id) = Self::task_of(case, &id)?;
        let Some(task) = net.task(&task_id) else {
            return Err(EngineError::TaskNotFound(task_id));
        };
        let is_child = case.item(&id)?.parent.is_some();

        self.transition(case, fx, id, WorkItemEvent::Fire, None, Value::Null)?;

        if !is_child {
            if task.is_composite() {
                return self.launch_subnet(case, fx, id, runner_id, task);
            }
            if task.multi_instance.is_some() {
                return self.spawn_instances(case, fx, id, runner_id, task);
            }
        }

        if task.kind == TaskKind::Automated {
            if !is_child {
                self.begin(case, fx, runner_id, &task_id)?;
            }
            self.transition(case, fx, id, WorkItemEvent::Execute, None, Value::Null)?;
            self.start_timer_on(case, fx, id, TimerTrigger::OnStarted)?;
            fx.pending.push_back(Pending::Execute(id));
            return Ok(());
        }

        self.offer(case, fx, id, task).await
    }

    /// Asks resource dispatch for participants and offers or allocates.
    /// With no candidate left the item stays FIRED.
    async fn offer(&self, case: &mut CaseState, fx: &mut Effects, id: WorkItemId, task: &Task) -> EngineResult<()> {
        let policy = task.resourcing.clone().unwrap_or_default();
        let context = ResourcingContext {
            case_id: case.id,
            work_item_id: id,
            task_id: task.id.clone(),
            data: case.item(&id)?.input.clone(),
        };

        let mut candidates = self
            .dispatch
            .find_candidates(&policy.roles, policy.available_only)
            .await
            .map_err(resourcing_error)?;
        for p in &policy.participants {
            if !candidates.contains(p) {
                candidates.push(p.clone());
            }
        }
        let candidates = self
            .dispatch
            .apply_filters(&policy.filters, &context, candidates)
            .await
            .map_err(resourcing_error)?;
        let candidates = if policy.four_eyes.is_empty() {
            candidates
        } else {
            self.dispatch
                .apply_four_eyes(candidates, case.id, &policy.four_eyes, &case.completions)
                .await
                .map_err(resourcing_error)?
        };
        let candidates = self
            .dispatch
            .apply_distribution(candidates, policy.distribution, &task.id, &context, &self.metrics())
            .await
            .map_err(resourcing_error)?;

        if candidates.is_empty() {
            warn!(case_id = %case.id, work_item = %id, task = %task.id, "no eligible participant, work item stays fired");
            fx.emit(
                EngineEvent::new(EventKind::ResourcingUnfulfilled)
                    .case(case.id)
                    .work_item(id)
                    .task(&task.id)
                    .data(json!({ "roles": policy.roles })),
            );
            return Ok(());
        }

        match policy.initial {
            InitialAction::Allocate => {
                let participant = candidates[0].clone();
                self.transition(case, fx, id, WorkItemEvent::Allocate, Some(&participant), Value::Null)?;
                case.item_mut(&id)?.allocated_to = Some(participant);
            }
            InitialAction::Offer => {
                self.transition(
                    case,
                    fx,
                    id,
                    WorkItemEvent::Offer,
                    None,
                    json!({ "participants": candidates }),
                )?;
                case.item_mut(&id)?.offered_to = candidates.into_iter().collect();
            }
        }
        Ok(())
    }

    fn launch_subnet(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        runner_id: RunnerId,
        task: &Task,
    ) -> EngineResult<()> {
        let net_id = task.decomposition.clone().unwrap_or_default();
        let subnet = case.spec.net(&net_id).ok_or_else(|| EngineError::UnresolvedDecomposition {
            task: task.id.clone(),
            net: net_id.clone(),
        })?;

        self.begin(case, fx, runner_id, &task.id)?;
        self.transition(case, fx, id, WorkItemEvent::Start, None, json!({ "subnet": net_id }))?;
        self.start_timer_on(case, fx, id, TimerTrigger::OnStarted)?;

        let data = case.item(&id)?.input.clone();
        let mut child = NetRunner::new(case.id, subnet, data).with_parent(ParentLink {
            runner: runner_id,
            work_item: id,
        });
        child.start()?;
        let child_id = child.id();
        case.runners.insert(child_id, child);
        case.runner_mut(&runner_id)?.add_child(child_id);
        case.item_mut(&id)?.child_runner = Some(child_id);

        info!(case_id = %case.id, task = %task.id, subnet = %net_id, runner = %child_id, "sub-case started");
        fx.emit(
            EngineEvent::new(EventKind::SubCaseStarted)
                .case(case.id)
                .work_item(id)
                .task(&task.id)
                .data(json!({ "runner": child_id, "net": net_id })),
        );
        self.refresh_runner(case, fx, child_id)
    }

    fn spawn_instances(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        runner_id: RunnerId,
        task: &Task,
    ) -> EngineResult<()> {
        let Some(mi) = task.multi_instance.as_ref() else {
            return Ok(());
        };
        self.begin(case, fx, runner_id, &task.id)?;

        let input = case.item(&id)?.input.clone();
        let mut values: Vec<Value> = match input.get(&mi.items) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single.clone()],
        };
        values.truncate(mi.max);
        while values.len() < mi.min {
            values.push(Value::Null);
        }

        self.transition(case, fx, id, WorkItemEvent::Spawn, None, json!({ "instances": values.len() }))?;
        for value in values {
            let mut child_input = input.clone();
            child_input.insert(mi.item_var.clone(), value);
            let mut child = WorkItem::new(case.id, runner_id, &task.id, child_input);
            child.parent = Some(id);
            let child_id = child.id;
            case.work_items.insert(child_id, child);
            case.item_mut(&id)?.children.push(child_id);
            fx.emit(
                EngineEvent::new(EventKind::WorkItemCreated)
                    .case(case.id)
                    .work_item(child_id)
                    .task(&task.id)
                    .data(json!({ "parent": id })),
            );
            fx.pending.push_back(Pending::Resource(child_id));
        }

        if case.item(&id)?.children.is_empty() {
            return self.instance_finished(case, fx, id);
        }
        Ok(())
    }

    /// Runs the task's codelet and completes or fails the item with the result.
    async fn execute(&self, case: &mut CaseState, fx: &mut Effects, id: WorkItemId) -> EngineResult<()> {
        let (net, _, task_id) = Self::task_of(case, &id)?;
        let Some(task) = net.task(&task_id) else {
            return Err(EngineError::TaskNotFound(task_id));
        };
        let Some(name) = task.codelet.as_deref() else {
            return self.complete_item(case, fx, id, WorkItemEvent::Complete, None, Map::new());
        };
        let Some(codelet) = self.codelets.get(name) else {
            warn!(case_id = %case.id, task = %task_id, codelet = %name, "codelet not registered");
            return self.fail_item(case, fx, id, WorkItemEvent::Fail, None);
        };

        let input = case.item(&id)?.input.clone();
        match codelet.execute(task.params.clone(), &input).await {
            Ok(output) => self.complete_item(case, fx, id, WorkItemEvent::Complete, None, output),
            Err(e) => {
                warn!(case_id = %case.id, task = %task_id, codelet = %name, error = %e, "codelet failed");
                self.fail_item(case, fx, id, WorkItemEvent::Fail, None)
            }
        }
    }

    /// Completes an item (COMPLETE, FORCE_COMPLETE or SKIP) and fires its task.
    pub(super) fn complete_item(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        event: WorkItemEvent,
        participant: Option<&str>,
        output: Map<String, Value>,
    ) -> EngineResult<()> {
        let item = case.item(&id)?;
        let (runner_id, task_id, parent, child_runner) =
            (item.runner_id, item.task_id.clone(), item.parent, item.child_runner);

        self.stop_timer(case, fx, id);
        self.transition(case, fx, id, event, participant, Value::Object(output.clone()))?;

        let item = case.item_mut(&id)?;
        item.output = output.clone();
        let performer = participant.map(str::to_string).or_else(|| item.allocated_to.clone());
        if let Some(performer) = performer {
            case.completions.push(CompletionRecord {
                task_id: task_id.clone(),
                work_item_id: id,
                participant: performer,
                completed_at: Utc::now(),
            });
        }

        // force-completing a composite item abandons its sub-case
        if let Some(child) = child_runner {
            if case.runners.contains_key(&child) {
                self.cancel_runner(case, fx, child)?;
            }
        }

        match parent {
            Some(parent) => self.instance_finished(case, fx, parent),
            None => self.fire(case, fx, runner_id, &task_id, output),
        }
    }

    fn fire(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        runner_id: RunnerId,
        task_id: &str,
        data: Map<String, Value>,
    ) -> EngineResult<()> {
        let result = case.runner_mut(&runner_id)?.fire_task(task_id, data)?;
        fx.emit(
            EngineEvent::new(EventKind::TaskFired)
                .case(case.id)
                .task(task_id)
                .data(json!({
                    "runner": runner_id,
                    "consumed": result.consumed,
                    "produced": result.produced,
                    "cancelled": result.cancelled,
                    "completed": result.completed,
                })),
        );
        for task in result.cancelled_tasks.iter().chain(result.withdrawn.iter()) {
            for id in case.active_items_for(&runner_id, task) {
                self.cancel_item(case, fx, id)?;
            }
        }
        self.refresh_runner(case, fx, runner_id)
    }

    /// Re-evaluates a multi-instance parent after one of its children ended.
    /// The parent completes once `threshold` children completed, or once
    /// every child is finished.
    fn instance_finished(&self, case: &mut CaseState, fx: &mut Effects, parent: WorkItemId) -> EngineResult<()> {
        let (net, runner_id, task_id) = Self::task_of(case, &parent)?;
        let item = case.item(&parent)?;
        if item.status() != WorkItemStatus::Parent {
            return Ok(());
        }
        let Some(mi) = net.task(&task_id).and_then(|t| t.multi_instance.clone()) else {
            return Ok(());
        };

        let children: Vec<WorkItemId> = item.children.clone();
        let mut outputs = Vec::new();
        let mut all_finished = true;
        for child in &children {
            let c = case.item(child)?;
            match c.status() {
                WorkItemStatus::Completed | WorkItemStatus::ForceCompleted => {
                    outputs.push(Value::Object(c.output.clone()))
                }
                s if s.is_terminal() => {}
                _ => all_finished = false,
            }
        }
        let threshold = mi.threshold.unwrap_or(children.len()).min(children.len());
        if outputs.len() < threshold && !all_finished {
            return Ok(());
        }

        for child in children {
            self.cancel_item(case, fx, child)?;
        }
        let mut output = Map::new();
        output.insert(mi.output_var.clone(), Value::Array(outputs));

        self.stop_timer(case, fx, parent);
        self.transition(case, fx, parent, WorkItemEvent::Complete, None, Value::Object(output.clone()))?;
        case.item_mut(&parent)?.output = output.clone();
        self.fire(case, fx, runner_id, &task_id, output)
    }

    /// Fails an item (FAIL or TIMEOUT). A failed top-level item aborts its
    /// task: the join tokens are cancelled and nothing is produced.
    pub(super) fn fail_item(
        &self,
        case: &mut CaseState,
        fx: &mut Effects,
        id: WorkItemId,
        event: WorkItemEvent,
        participant: Option<&str>,
    ) -> EngineResult<()> {
        let item = case.item(&id)?;
        let (runner_id, task_id, parent, child_runner) =
            (item.runner_id, item.task_id.clone(), item.parent, item.child_runner);

        self.stop_timer(case, fx, id);
        self.transition(case, fx, id, event, participant, Value::Null)?;

        if let Some(parent) = parent {
            return self.instance_finished(case, fx, parent);
        }
        if let Some(child) = child_runner {
            if case.runners.contains_key(&child) {
                self.cancel_runner(case, fx, child)?;
            }
        }

        let runner = case.runner_mut(&runner_id)?;
        if !runner.busy().contains(&task_id) {
            runner.begin_task(&task_id)?;
        }
        let result = runner.cancel_task(&task_id)?;
        warn!(case_id = %case.id, task = %task_id, work_item = %id, "task aborted");
        fx.emit(
            EngineEvent::new(EventKind::TaskAborted)
                .case(case.id)
                .work_item(id)
                .task(&task_id)
                .data(json!({ "runner": runner_id, "cancelled": result.cancelled })),
        );
        self.refresh_runner(case, fx, runner_id)
    }

    /// Cancels an active item together with its sub-case and instances.
    fn cancel_item(&self, case: &mut CaseState, fx: &mut Effects, id: WorkItemId) -> EngineResult<()> {
        let item = case.item(&id)?;
        if !item.is_active() {
            return Ok(());
        }
        let children = item.children.clone();
        let child_runner = item.child_runner;

        if let Some(child) = child_runner {
            if case.runners.contains_key(&child) {
                self.cancel_runner(case, fx, child)?;
            }
        }
        for child in children {
            self.cancel_item(case, fx, child)?;
        }
        self.stop_timer(case, fx, id);
        self.transition(case, fx, id, WorkItemEvent::Cancel, None, Value::Null)?;
        Ok(())
    }

    /// Child runners first, then this runner's work items, then its tokens.
    /// A cancelled sub-case runner is detached from its parent.
    fn cancel_runner(&self, case: &mut CaseState, fx: &mut Effects, runner_id: RunnerId) -> EngineResult<()> {
        let children: Vec<RunnerId> = case.runner(&runner_id)?.children().iter().copied().collect();
        for child in children {
            if case.runners.contains_key(&child) {
                self.cancel_runner(case, fx, child)?;
            }
        }
        for id in case.active_items_of_runner(&runner_id) {
            self.cancel_item(case, fx, id)?;
        }

        let runner = case.runner_mut(&runner_id)?;
        let tokens = runner.cancel();
        let parent = runner.parent().cloned();
        debug!(case_id = %case.id, runner = %runner_id, tokens = tokens.len(), "net runner cancelled");

        if let Some(link) = parent {
            case.runners.remove(&runner_id);
            if let Some(p) = case.runners.get_mut(&link.runner) {
                p.remove_child(&runner_id);
            }
        }
        Ok(())
    }

    /// The runner reached its output condition.
    fn runner_completed(&self, case: &mut CaseState, fx: &mut Effects, runner_id: RunnerId) -> EngineResult<()> {
        let children: Vec<RunnerId> = case.runner(&runner_id)?.children().iter().copied().collect();
        for child in children {
            if case.runners.contains_key(&child) {
                self.cancel_runner(case, fx, child)?;
            }
        }
        for id in case.active_items_of_runner(&runner_id) {
            self.cancel_item(case, fx, id)?;
        }

        let runner = case.runner(&runner_id)?;
        let parent = runner.parent().cloned();
        let data = runner.data().clone();

        match parent {
            None => {
                for (_, timer) in case.timers.drain() {
                    fx.cancelled_timers.push(timer);
                }
                case.status = CaseStatus::Completed;
                info!(case_id = %case.id, "case completed");
                fx.emit(EngineEvent::new(EventKind::CaseCompleted).case(case.id).data(Value::Object(data)));
                Ok(())
            }
            Some(link) => {
                case.runners.remove(&runner_id);
                if let Some(p) = case.runners.get_mut(&link.runner) {
                    p.remove_child(&runner_id);
                }
                info!(case_id = %case.id, runner = %runner_id, "sub-case completed");
                fx.emit(
                    EngineEvent::new(EventKind::SubCaseCompleted)
                        .case(case.id)
                        .work_item(link.work_item)
                        .data(json!({ "runner": runner_id })),
                );
                self.complete_item(case, fx, link.work_item, WorkItemEvent::Complete, None, data)
            }
        }
    }
}

fn case_state_error(case: &CaseState) -> EngineError {
    EngineError::CaseState {
        case: case.id,
        status: format!("{:?}", case.status),
    }
}

fn not_eligible(participant: &str, work_item: WorkItemId) -> EngineError {
    EngineError::ParticipantNotEligible {
        participant: participant.to_string(),
        work_item,
    }
}

fn resourcing_error(e: anyhow::Error) -> EngineError {
    EngineError::Resourcing(e.to_string())
}
