mod file_config;

pub use file_config::{BucketsConfig, FileConfig, SchedulerConfig};

use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub object_store_root: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_path: PathBuf,
    pub object_store_root: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,

    // Feature configs (with defaults)
    pub buckets: BucketSettings,
    pub scheduler: SchedulerSettings,
}

/// Names of the two buckets jobs read from and write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSettings {
    pub checkpoint_bucket: String,
    pub training_bucket: String,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            checkpoint_bucket: "checkpoints".to_string(),
            training_bucket: "training-data".to_string(),
        }
    }
}

impl BucketSettings {
    /// Case-insensitive lookup of a bucket named by a worker. Returns the
    /// configured spelling, or None for buckets jobs never use.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        [&self.checkpoint_bucket, &self.training_bucket]
            .into_iter()
            .find(|bucket| bucket.eq_ignore_ascii_case(name))
            .map(|bucket| bucket.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// A running job whose last heartbeat is older than this is abandoned.
    pub max_heartbeat_age_secs: u64,
    /// Checkpoints kept per job by retention.
    pub max_stored_checkpoints: usize,
    /// Failure reports after which a job is marked failed.
    pub max_failed_attempts: u32,
    /// Candidates tried per poll before answering "no work".
    pub max_claim_attempts_per_poll: u32,
    pub ban_ttl_secs: u64,
    pub ban_prune_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_heartbeat_age_secs: 300,
            max_stored_checkpoints: 3,
            max_failed_attempts: 3,
            max_claim_attempts_per_poll: 5,
            ban_ttl_secs: 86400, // 24 hours
            ban_prune_interval_secs: 3600,
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_stored_checkpoints == 0 {
            bail!("max_stored_checkpoints must be at least 1");
        }
        if self.max_failed_attempts == 0 {
            bail!("max_failed_attempts must be at least 1");
        }
        if self.max_claim_attempts_per_poll == 0 {
            bail!("max_claim_attempts_per_poll must be at least 1");
        }
        Ok(())
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }
        let db_dir = match db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !db_dir.is_dir() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }

        let object_store_root = file
            .object_store_root
            .map(PathBuf::from)
            .or_else(|| cli.object_store_root.clone())
            .unwrap_or_else(|| db_dir.join("objects"));

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        // Bucket names - merge file config with defaults
        let buckets_file = file.buckets.unwrap_or_default();
        let default_buckets = BucketSettings::default();
        let buckets = BucketSettings {
            checkpoint_bucket: buckets_file
                .checkpoint_bucket
                .unwrap_or(default_buckets.checkpoint_bucket),
            training_bucket: buckets_file
                .training_bucket
                .unwrap_or(default_buckets.training_bucket),
        };
        if buckets.checkpoint_bucket.is_empty() || buckets.training_bucket.is_empty() {
            bail!("Bucket names must not be empty");
        }
        if buckets
            .checkpoint_bucket
            .eq_ignore_ascii_case(&buckets.training_bucket)
        {
            bail!(
                "checkpoint_bucket and training_bucket must differ (both are {:?})",
                buckets.checkpoint_bucket
            );
        }

        // Scheduler settings - merge file config with defaults
        let sched_file = file.scheduler.unwrap_or_default();
        let defaults = SchedulerSettings::default();
        let scheduler = SchedulerSettings {
            max_heartbeat_age_secs: sched_file
                .max_heartbeat_age_secs
                .unwrap_or(defaults.max_heartbeat_age_secs),
            max_stored_checkpoints: sched_file
                .max_stored_checkpoints
                .unwrap_or(defaults.max_stored_checkpoints),
            max_failed_attempts: sched_file
                .max_failed_attempts
                .unwrap_or(defaults.max_failed_attempts),
            max_claim_attempts_per_poll: sched_file
                .max_claim_attempts_per_poll
                .unwrap_or(defaults.max_claim_attempts_per_poll),
            ban_ttl_secs: sched_file.ban_ttl_secs.unwrap_or(defaults.ban_ttl_secs),
            ban_prune_interval_secs: sched_file
                .ban_prune_interval_secs
                .unwrap_or(defaults.ban_prune_interval_secs),
        };
        scheduler.validate()?;

        Ok(Self {
            db_path,
            object_store_root,
            port,
            metrics_port,
            logging_level,
            buckets,
            scheduler,
        })
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
