//! Engine configuration.
//!
//! Defaults read `TOKENFLOW_*` environment variables so containers can
//! configure the engine without a file.

use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fire and resource work items as soon as they are created. When
    /// false, items wait in ENABLED until `fire_work_item` is called.
    #[serde(default = "default_resource_on_enable")]
    pub resource_on_enable: bool,
    #[serde(default)]
    pub store: StoreConfig,
    /// Capacity of the timer expiry channel.
    #[serde(default = "default_timer_capacity")]
    pub timer_channel_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    None,
    Memory,
    Redis { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        match std::env::var("TOKENFLOW_STORE").as_deref() {
            Ok("memory") => StoreConfig::Memory,
            Ok("redis") => StoreConfig::Redis {
                url: std::env::var("TOKENFLOW_REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string()),
            },
            _ => StoreConfig::None,
        }
    }
}

fn default_resource_on_enable() -> bool {
    std::env::var("TOKENFLOW_RESOURCE_ON_ENABLE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(true)
}

fn default_timer_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resource_on_enable: default_resource_on_enable(),
            store: StoreConfig::default(),
            timer_channel_capacity: default_timer_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}
