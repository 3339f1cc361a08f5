use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;

use crate::runtime::case::CaseSnapshot;
use crate::runtime::runner::CaseId;
use crate::runtime::storage::CaseStore;

/// Stores each case snapshot as one JSON string under `tokenflow:case:<id>`.
pub struct RedisCaseStore {
    client: redis::Client,
}

impl RedisCaseStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::new(redis::Client::open(url)?))
    }

    fn case_key(&self, case_id: CaseId) -> String {
        format!("tokenflow:case:{}", case_id)
    }
}

#[async_trait]
impl CaseStore for RedisCaseStore {
    async fn save(&self, snapshot: &CaseSnapshot) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(snapshot)?;
        let _: () = conn.set(self.case_key(snapshot.id), serialized).await?;
        Ok(())
    }

    async fn remove(&self, case_id: CaseId) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(self.case_key(case_id)).await?;
        Ok(())
    }

    async fn load(&self, case_id: CaseId) -> Result<Option<CaseSnapshot>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.case_key(case_id)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }
}
