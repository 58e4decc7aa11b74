//! Shared constants for end-to-end tests

// ============================================================================
// Server Timing
// ============================================================================

/// Maximum time to wait for a spawned server to answer `/`
pub const SERVER_READY_TIMEOUT_MS: u64 = 5_000;

/// Delay between readiness polls
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 10;

/// Per-request timeout of the test client
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Scheduler Settings
// ============================================================================

/// Clock value every test server starts at (Unix seconds)
pub const START_TIME: i64 = 1_700_000_000;

/// Lease length used by test servers
pub const MAX_HEARTBEAT_AGE_SECS: u64 = 60;

/// Checkpoints kept per job by test servers
pub const MAX_STORED_CHECKPOINTS: usize = 2;

/// Failures before a job is marked failed on test servers
pub const MAX_FAILED_ATTEMPTS: u32 = 2;

// ============================================================================
// Buckets
// ============================================================================

pub const CHECKPOINT_BUCKET: &str = "checkpoints";

pub const TRAINING_BUCKET: &str = "training-data";

/// Instance images seeded by [`TestServer::seed_instance_images`](super::TestServer)
pub const INSTANCE_PREFIX: &str = "dogs/instance/";
