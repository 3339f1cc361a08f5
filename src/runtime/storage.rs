use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::runtime::case::CaseSnapshot;
use crate::runtime::runner::CaseId;

/// Persistence hook called by the engine at the end of every mutating
/// case operation. A failing `save` rolls the operation back.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn save(&self, snapshot: &CaseSnapshot) -> Result<()>;
    async fn remove(&self, case_id: CaseId) -> Result<()>;
    async fn load(&self, case_id: CaseId) -> Result<Option<CaseSnapshot>>;
}

#[derive(Default)]
pub struct InMemoryCaseStore {
    cases: DashMap<CaseId, CaseSnapshot>,
}

impl InMemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

#[async_trait]
impl CaseStore for InMemoryCaseStore {
    async fn save(&self, snapshot: &CaseSnapshot) -> Result<()> {
        self.cases.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn remove(&self, case_id: CaseId) -> Result<()> {
        self.cases.remove(&case_id);
        Ok(())
    }

    async fn load(&self, case_id: CaseId) -> Result<Option<CaseSnapshot>> {
        Ok(self.cases.get(&case_id).map(|s| s.value().clone()))
    }
}
