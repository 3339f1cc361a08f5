use thiserror::Error;
use uuid::Uuid;

use crate::runtime::runner::ExecutionStatus;
use crate::runtime::work_item::{WorkItemEvent, WorkItemStatus};

/// Errors raised by the net runner and the engine.
///
/// Every public case operation is all-or-nothing: when one of these is
/// returned, the case is left exactly as it was before the call.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid transition: work item {work_item} cannot handle {event:?} in status {status:?}")]
    InvalidTransition {
        work_item: Uuid,
        status: WorkItemStatus,
        event: WorkItemEvent,
    },

    #[error("invalid firing of task '{task}': {reason}")]
    InvalidFiring { task: String, reason: String },

    #[error("net '{0}' has no input condition")]
    MissingInputCondition(String),

    #[error("net '{0}' has no output condition")]
    MissingOutputCondition(String),

    #[error("task '{task}' decomposes to unknown net '{net}'")]
    UnresolvedDecomposition { task: String, net: String },

    #[error("specification validation failed: {0}")]
    Validation(String),

    #[error("invalid predicate '{predicate}' on flow {source_id} -> {target}: {reason}")]
    InvalidPredicate {
        source_id: String,
        target: String,
        predicate: String,
        reason: String,
    },

    #[error("specification not found: {0}")]
    SpecificationNotFound(String),

    #[error("specification '{0}' is not active")]
    SpecificationInactive(String),

    #[error("specification '{0}' still has running cases")]
    SpecificationInUse(String),

    #[error("specification '{0}' is already loaded")]
    SpecificationExists(String),

    #[error("case not found: {0}")]
    CaseNotFound(Uuid),

    #[error("case {case} cannot accept this operation in status {status}")]
    CaseState { case: Uuid, status: String },

    #[error("work item not found: {0}")]
    WorkItemNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("net runner not found: {0}")]
    RunnerNotFound(Uuid),

    #[error("net runner {runner} is {status:?}; no task may begin")]
    RunnerSuspended { runner: Uuid, status: ExecutionStatus },

    #[error("participant '{participant}' may not act on work item {work_item}")]
    ParticipantNotEligible { participant: String, work_item: Uuid },

    #[error("resource dispatch failed: {0}")]
    Resourcing(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("timer service failed: {0}")]
    Timer(String),

    #[error("engine has been shut down")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
