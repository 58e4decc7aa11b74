use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub object_store_root: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,

    // Feature configs
    pub buckets: Option<BucketsConfig>,
    pub scheduler: Option<SchedulerConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct BucketsConfig {
    pub checkpoint_bucket: Option<String>,
    pub training_bucket: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_heartbeat_age_secs: Option<u64>,
    pub max_stored_checkpoints: Option<usize>,
    pub max_failed_attempts: Option<u32>,
    pub max_claim_attempts_per_poll: Option<u32>,
    pub ban_ttl_secs: Option<u64>,
    pub ban_prune_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
