use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

pub mod builtin;

/// 插件接口：自动任务执行的代码单元 (Codelet)
///
/// Runs the work of an automated task. `input` is the work item input
/// (runner data plus per-instance values); the returned map becomes the
/// work item output and is merged into the runner data when the task fires.
#[async_trait]
pub trait Codelet: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn validate(&self, params: &Value) -> Result<()>;
    async fn execute(&self, params: Value, input: &Map<String, Value>) -> Result<Map<String, Value>>;
}

#[derive(Debug, Default)]
pub struct CodeletRegistry {
    codelets: DashMap<String, Arc<dyn Codelet>>,
}

impl CodeletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `log` and `assign`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(builtin::LogCodelet));
        registry.register(Arc::new(builtin::AssignCodelet));
        registry
    }

    pub fn register(&self, codelet: Arc<dyn Codelet>) {
        self.codelets.insert(codelet.name().to_string(), codelet);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Codelet>> {
        self.codelets.get(name).map(|c| c.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.codelets.contains_key(name)
    }
}
