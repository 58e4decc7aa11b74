//! Test server lifecycle management
//!
//! This module manages spawning and shutting down test HTTP servers.
//! Each test gets an isolated server with its own database, object store
//! directory and clock.

use super::constants::*;
use super::fixtures::{list_keys, put_object};
use dreambooth_dispatch::config::{BucketSettings, SchedulerSettings};
use dreambooth_dispatch::dispatch::{DispatchManager, SqliteJobStore};
use dreambooth_dispatch::object_store::FsObjectStore;
use dreambooth_dispatch::server::{make_app, RequestsLoggingLevel, ServerConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance with isolated storage
///
/// When dropped, the server gracefully shuts down and temp resources are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Root of the filesystem object store
    pub object_root: PathBuf,

    clock: Arc<AtomicI64>,

    // Private fields - keep resources alive until drop
    _temp_dir: TempDir,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a new test server on a random port with the test scheduler
    /// settings from [`constants`](super::constants).
    pub async fn spawn() -> Self {
        Self::spawn_with(SchedulerSettings {
            max_heartbeat_age_secs: MAX_HEARTBEAT_AGE_SECS,
            max_stored_checkpoints: MAX_STORED_CHECKPOINTS,
            max_failed_attempts: MAX_FAILED_ATTEMPTS,
            ..Default::default()
        })
        .await
    }

    /// Spawns a new test server with custom scheduler settings
    ///
    /// # Panics
    ///
    /// Panics if storage cannot be created, the port cannot be bound, or the
    /// server does not become ready in time.
    pub async fn spawn_with(settings: SchedulerSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("dispatch.db");
        let object_root = temp_dir.path().join("objects");

        let store = Arc::new(SqliteJobStore::new(&db_path).expect("Failed to open job store"));
        let objects =
            Arc::new(FsObjectStore::new(&object_root).expect("Failed to open object store"));

        let clock = Arc::new(AtomicI64::new(START_TIME));
        let ticks = clock.clone();
        let manager = DispatchManager::new(
            store.clone(),
            store.clone(),
            store,
            objects,
            BucketSettings {
                checkpoint_bucket: CHECKPOINT_BUCKET.to_string(),
                training_bucket: TRAINING_BUCKET.to_string(),
            },
            settings,
        )
        .with_clock(Arc::new(move || ticks.load(Ordering::SeqCst)));

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");

        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let base_url = format!("http://127.0.0.1:{}", port);

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let config = ServerConfig {
            port,
            requests_logging_level: RequestsLoggingLevel::None,
            ..Default::default()
        };
        let app = make_app(config, Arc::new(manager));

        // Spawn server in background task with graceful shutdown
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            object_root,
            clock,
            _temp_dir: temp_dir,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Moves the server clock forward
    pub fn advance_clock(&self, secs: i64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }

    /// Current server time (Unix seconds)
    pub fn now(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Uploads a checkpoint for `job_id`, as a worker would
    pub fn upload_checkpoint(&self, job_id: &str, name: &str, uploaded_at_secs: u64) -> String {
        let key = format!("loras/{}/{}", job_id, name);
        put_object(&self.object_root, CHECKPOINT_BUCKET, &key, uploaded_at_secs);
        key
    }

    /// Puts `count` images under [`INSTANCE_PREFIX`] in the training bucket
    pub fn seed_instance_images(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                let key = format!("{}{:03}.png", INSTANCE_PREFIX, i);
                put_object(&self.object_root, TRAINING_BUCKET, &key, 1);
                key
            })
            .collect()
    }

    /// Checkpoint keys currently stored for `job_id`
    pub fn checkpoint_keys(&self, job_id: &str) -> Vec<String> {
        list_keys(
            &self.object_root,
            CHECKPOINT_BUCKET,
            &format!("loras/{}/", job_id),
        )
    }

    /// Waits for the server to become ready by polling `/`
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => {
                    return;
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Send shutdown signal
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
