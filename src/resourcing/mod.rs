//! Resource dispatch contract.
//!
//! The engine only knows how to ask for participants; who they are, how
//! filters are interpreted and how work is distributed belongs to the
//! [`ResourceDispatch`] implementation.

pub mod directory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runtime::net::TaskId;
use crate::runtime::runner::CaseId;
use crate::runtime::work_item::{ParticipantId, WorkItemId};

pub type RoleId = String;

/// Per-task resourcing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcingSpec {
    #[serde(default)]
    pub roles: Vec<RoleId>,
    /// Participants named directly, in addition to role members.
    #[serde(default)]
    pub participants: Vec<ParticipantId>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    /// Separation of duty: whoever completed one of these tasks in the same
    /// case may not receive this one.
    #[serde(default)]
    pub four_eyes: Vec<TaskId>,
    #[serde(default)]
    pub distribution: DistributionStrategy,
    #[serde(default)]
    pub initial: InitialAction,
    #[serde(default = "default_available_only")]
    pub available_only: bool,
}

fn default_available_only() -> bool {
    true
}

impl Default for ResourcingSpec {
    fn default() -> Self {
        Self {
            roles: Vec::new(),
            participants: Vec::new(),
            filters: Vec::new(),
            four_eyes: Vec::new(),
            distribution: DistributionStrategy::default(),
            initial: InitialAction::default(),
            available_only: true,
        }
    }
}

/// An opaque filter, interpreted by the dispatch implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Offer to every remaining candidate.
    #[default]
    All,
    First,
    Random,
    RoundRobin,
    ShortestQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialAction {
    #[default]
    Offer,
    /// Allocate straight to the first distributed candidate.
    Allocate,
}

/// A completed work item, kept per case for four-eyes checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub task_id: TaskId,
    pub work_item_id: WorkItemId,
    pub participant: ParticipantId,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResourcingContext {
    pub case_id: CaseId,
    pub work_item_id: WorkItemId,
    pub task_id: TaskId,
    pub data: Map<String, Value>,
}

/// Live work per participant (allocated or started items).
#[derive(Debug, Clone, Default)]
pub struct DistributionMetrics {
    pub queue_lengths: HashMap<ParticipantId, usize>,
}

impl DistributionMetrics {
    pub fn queue_length(&self, participant: &str) -> usize {
        self.queue_lengths.get(participant).copied().unwrap_or(0)
    }
}

#[async_trait]
pub trait ResourceDispatch: Send + Sync {
    async fn find_candidates(&self, role_ids: &[RoleId], available_only: bool) -> Result<Vec<ParticipantId>>;

    async fn apply_filters(
        &self,
        filters: &[FilterSpec],
        context: &ResourcingContext,
        candidates: Vec<ParticipantId>,
    ) -> Result<Vec<ParticipantId>>;

    async fn apply_four_eyes(
        &self,
        candidates: Vec<ParticipantId>,
        case_id: CaseId,
        excluded_task_ids: &[TaskId],
        history: &[CompletionRecord],
    ) -> Result<Vec<ParticipantId>>;

    async fn apply_distribution(
        &self,
        candidates: Vec<ParticipantId>,
        strategy: DistributionStrategy,
        task_id: &str,
        context: &ResourcingContext,
        metrics: &DistributionMetrics,
    ) -> Result<Vec<ParticipantId>>;
}

/// Drops every candidate who completed one of `excluded_task_ids` in `history`.
pub fn exclude_previous_performers(
    candidates: Vec<ParticipantId>,
    excluded_task_ids: &[TaskId],
    history: &[CompletionRecord],
) -> Vec<ParticipantId> {
    candidates
        .into_iter()
        .filter(|p| {
            !history
                .iter()
                .any(|r| &r.participant == p && excluded_task_ids.contains(&r.task_id))
        })
        .collect()
}
