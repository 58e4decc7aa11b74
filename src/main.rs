use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt::Debug, path::PathBuf};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dreambooth_dispatch::config;
use dreambooth_dispatch::dispatch::{DispatchManager, SqliteJobStore};
use dreambooth_dispatch::object_store::FsObjectStore;
use dreambooth_dispatch::server::{metrics, run_server, RequestsLoggingLevel, ServerConfig};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite job database file. Created if missing.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Directory holding one sub-directory per bucket.
    /// Defaults to `objects/` next to the database.
    #[clap(long, value_parser = parse_path)]
    pub object_store_root: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_path: args.db_path.clone(),
            object_store_root: args.object_store_root.clone(),
            port: args.port,
            metrics_port: args.metrics_port,
            logging_level: args.logging_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_path: {:?}", app_config.db_path);
    info!("  object_store_root: {:?}", app_config.object_store_root);
    info!("  port: {}", app_config.port);
    info!(
        "  buckets: checkpoints={}, training={}",
        app_config.buckets.checkpoint_bucket, app_config.buckets.training_bucket
    );
    info!("  scheduler: {:?}", app_config.scheduler);

    info!("Initializing metrics...");
    metrics::init_metrics();

    if !app_config.db_path.exists() {
        info!("Creating new job database at {:?}", app_config.db_path);
    }
    let store = Arc::new(SqliteJobStore::new(&app_config.db_path)?);
    let objects = Arc::new(FsObjectStore::new(&app_config.object_store_root)?);

    let manager = Arc::new(DispatchManager::new(
        store.clone(),
        store.clone(),
        store,
        objects,
        app_config.buckets.clone(),
        app_config.scheduler.clone(),
    ));

    // Spawn background task for ban pruning
    let prune_interval_secs = app_config.scheduler.ban_prune_interval_secs;
    if prune_interval_secs > 0 {
        let pruning_manager = manager.clone();
        info!("Pruning expired worker bans every {}s", prune_interval_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(prune_interval_secs));

            // Skip the first immediate tick, wait for the first interval
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = pruning_manager.prune_expired_bans() {
                    error!("Failed to prune expired bans: {}", e);
                }
            }
        });
    }

    let server_config = ServerConfig {
        requests_logging_level: app_config.logging_level.clone(),
        port: app_config.port,
        metrics_port: app_config.metrics_port,
    };
    run_server(server_config, manager).await
}
