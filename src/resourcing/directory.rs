use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::resourcing::{
    exclude_previous_performers, CompletionRecord, DistributionMetrics, DistributionStrategy, FilterSpec,
    ResourceDispatch, ResourcingContext, RoleId,
};
use crate::runtime::net::TaskId;
use crate::runtime::runner::CaseId;
use crate::runtime::work_item::ParticipantId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    #[serde(default)]
    pub roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl Participant {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            roles: BTreeSet::new(),
            capabilities: BTreeSet::new(),
            available: true,
        }
    }

    pub fn role(mut self, role: &str) -> Self {
        self.roles.insert(role.to_string());
        self
    }

    pub fn capability(mut self, capability: &str) -> Self {
        self.capabilities.insert(capability.to_string());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

/// In-memory participant directory.
///
/// Filters understood:
/// - `capability` with `{"capability": "<name>"}`: keep holders of the capability;
/// - `available`: keep available participants;
/// - `data_equals` with `{"variable": "<key>"}`: keep the participant whose id
///   equals the case data value under `key`.
///
/// Unknown filters are ignored with a warning.
#[derive(Default)]
pub struct StaticDirectory {
    participants: DashMap<ParticipantId, Participant>,
    round_robin: DashMap<TaskId, usize>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, participant: Participant) -> Self {
        self.add(participant);
        self
    }

    pub fn add(&self, participant: Participant) {
        self.participants.insert(participant.id.clone(), participant);
    }

    pub fn set_available(&self, id: &str, available: bool) {
        if let Some(mut p) = self.participants.get_mut(id) {
            p.available = available;
        }
    }

    pub fn participant(&self, id: &str) -> Option<Participant> {
        self.participants.get(id).map(|p| p.value().clone())
    }

    fn matches_filter(&self, filter: &FilterSpec, context: &ResourcingContext, participant: &Participant) -> bool {
        match filter.name.as_str() {
            "capability" => match filter.params.get("capability").and_then(|v| v.as_str()) {
                Some(cap) => participant.capabilities.contains(cap),
                None => {
                    warn!(task = %context.task_id, "capability filter without 'capability' param");
                    true
                }
            },
            "available" => participant.available,
            "data_equals" => filter
                .params
                .get("variable")
                .and_then(|v| v.as_str())
                .and_then(|key| context.data.get(key))
                .and_then(|v| v.as_str())
                .map(|expected| expected == participant.id)
                .unwrap_or(false),
            other => {
                warn!(filter = %other, task = %context.task_id, "unknown resource filter ignored");
                true
            }
        }
    }
}

#[async_trait]
impl ResourceDispatch for StaticDirectory {
    async fn find_candidates(&self, role_ids: &[RoleId], available_only: bool) -> Result<Vec<ParticipantId>> {
        let mut found: Vec<ParticipantId> = self
            .participants
            .iter()
            .filter(|p| p.roles.iter().any(|r| role_ids.contains(r)))
            .filter(|p| p.available || !available_only)
            .map(|p| p.id.clone())
            .collect();
        found.sort();
        Ok(found)
    }

    async fn apply_filters(
        &self,
        filters: &[FilterSpec],
        context: &ResourcingContext,
        candidates: Vec<ParticipantId>,
    ) -> Result<Vec<ParticipantId>> {
        if filters.is_empty() {
            return Ok(candidates);
        }
        Ok(candidates
            .into_iter()
            .filter(|id| match self.participants.get(id) {
                Some(p) => filters.iter().all(|f| self.matches_filter(f, context, &p)),
                // named directly but unknown to the directory
                None => false,
            })
            .collect())
    }

    async fn apply_four_eyes(
        &self,
        candidates: Vec<ParticipantId>,
        _case_id: CaseId,
        excluded_task_ids: &[TaskId],
        history: &[CompletionRecord],
    ) -> Result<Vec<ParticipantId>> {
        Ok(exclude_previous_performers(candidates, excluded_task_ids, history))
    }

    async fn apply_distribution(
        &self,
        candidates: Vec<ParticipantId>,
        strategy: DistributionStrategy,
        task_id: &str,
        _context: &ResourcingContext,
        metrics: &DistributionMetrics,
    ) -> Result<Vec<ParticipantId>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let picked = match strategy {
            DistributionStrategy::All => return Ok(candidates),
            DistributionStrategy::First => candidates[0].clone(),
            DistributionStrategy::Random => {
                let idx = (Uuid::new_v4().as_u128() % candidates.len() as u128) as usize;
                candidates[idx].clone()
            }
            DistributionStrategy::RoundRobin => {
                let mut cursor = self.round_robin.entry(task_id.to_string()).or_insert(0);
                let idx = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                candidates[idx].clone()
            }
            DistributionStrategy::ShortestQueue => candidates
                .iter()
                .min_by_key(|p| (metrics.queue_length(p), (*p).clone()))
                .cloned()
                .unwrap_or_else(|| candidates[0].clone()),
        };
        Ok(vec![picked])
    }
}
