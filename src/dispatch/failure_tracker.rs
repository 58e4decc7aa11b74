//! Per-job failure counters and per-(worker, job) bans.
//!
//! A ban says "this worker can't do this job"; the counter reaching its cap
//! says "no worker can". Both are side records keyed by job id and are
//! dropped once the job reaches a terminal state.

use std::sync::Arc;

use rusqlite::{OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::error::DispatchResult;
use super::job_store::SqliteJobStore;

/// What storage did with one failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRecord {
    /// Counted, with the job's new attempt total.
    Counted(u32),
    /// The reporting worker is already banned from the job. Nothing changed.
    AlreadyBanned,
    /// The job is not running. Nothing changed.
    NotRunning,
}

/// Raw storage for failure counters and bans.
pub trait FailureStore: Send + Sync {
    /// Count one failure of a running job and ban `worker_id` from it until
    /// `ban_expires_at`, as a single step. A worker that still holds a live
    /// ban on the job is not counted again.
    fn record_failure(
        &self,
        job_id: &str,
        worker_id: Option<&str>,
        now: i64,
        ban_expires_at: i64,
    ) -> DispatchResult<FailureRecord>;

    fn failure_count(&self, job_id: &str) -> DispatchResult<u32>;

    /// Ban `worker_id` from `job_id` until `expires_at`. Re-banning keeps the
    /// later expiry.
    fn insert_ban(&self, worker_id: &str, job_id: &str, expires_at: i64) -> DispatchResult<()>;

    fn is_banned(&self, worker_id: &str, job_id: &str, now: i64) -> DispatchResult<bool>;

    /// Jobs `worker_id` is currently banned from.
    fn banned_jobs(&self, worker_id: &str, now: i64) -> DispatchResult<Vec<String>>;

    /// Drop the counter and every ban for a job.
    fn clear_job(&self, job_id: &str) -> DispatchResult<()>;

    /// Delete bans that expired at or before `now`. Returns how many went.
    fn prune_expired_bans(&self, now: i64) -> DispatchResult<usize>;
}

const UPSERT_BAN: &str = "INSERT INTO worker_bans (worker_id, job_id, expires_at) VALUES (?1, ?2, ?3) \
     ON CONFLICT(worker_id, job_id) DO UPDATE SET expires_at = MAX(expires_at, excluded.expires_at)";

const LIVE_BAN_EXISTS: &str = "SELECT EXISTS(SELECT 1 FROM worker_bans \
     WHERE worker_id = ?1 AND job_id = ?2 AND expires_at > ?3)";

impl FailureStore for SqliteJobStore {
    fn record_failure(
        &self,
        job_id: &str,
        worker_id: Option<&str>,
        now: i64,
        ban_expires_at: i64,
    ) -> DispatchResult<FailureRecord> {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM training_jobs WHERE id = ?1",
                [job_id],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() != Some("running") {
            return Ok(FailureRecord::NotRunning);
        }

        if let Some(worker_id) = worker_id {
            let banned = tx.query_row(
                LIVE_BAN_EXISTS,
                rusqlite::params![worker_id, job_id, now],
                |row| row.get::<_, bool>(0),
            )?;
            if banned {
                return Ok(FailureRecord::AlreadyBanned);
            }
        }

        let attempts = tx.query_row(
            "INSERT INTO job_failures (job_id, attempts, updated_at) VALUES (?1, 1, ?2) \
             ON CONFLICT(job_id) DO UPDATE SET attempts = attempts + 1, updated_at = ?2 \
             RETURNING attempts",
            rusqlite::params![job_id, now],
            |row| row.get::<_, u32>(0),
        )?;
        if let Some(worker_id) = worker_id {
            tx.execute(UPSERT_BAN, rusqlite::params![worker_id, job_id, ban_expires_at])?;
        }
        tx.commit()?;
        Ok(FailureRecord::Counted(attempts))
    }

    fn failure_count(&self, job_id: &str) -> DispatchResult<u32> {
        let conn = self.connection()?;
        let attempts = conn.query_row(
            "SELECT COALESCE(MAX(attempts), 0) FROM job_failures WHERE job_id = ?1",
            [job_id],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(attempts)
    }

    fn insert_ban(&self, worker_id: &str, job_id: &str, expires_at: i64) -> DispatchResult<()> {
        let conn = self.connection()?;
        conn.execute(UPSERT_BAN, rusqlite::params![worker_id, job_id, expires_at])?;
        Ok(())
    }

    fn is_banned(&self, worker_id: &str, job_id: &str, now: i64) -> DispatchResult<bool> {
        let conn = self.connection()?;
        let banned = conn.query_row(
            LIVE_BAN_EXISTS,
            rusqlite::params![worker_id, job_id, now],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(banned)
    }

    fn banned_jobs(&self, worker_id: &str, now: i64) -> DispatchResult<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT job_id FROM worker_bans WHERE worker_id = ?1 AND expires_at > ?2 ORDER BY job_id",
        )?;
        let jobs = stmt
            .query_map(rusqlite::params![worker_id, now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(jobs)
    }

    fn clear_job(&self, job_id: &str) -> DispatchResult<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM worker_bans WHERE job_id = ?1", [job_id])?;
        conn.execute("DELETE FROM job_failures WHERE job_id = ?1", [job_id])?;
        Ok(())
    }

    fn prune_expired_bans(&self, now: i64) -> DispatchResult<usize> {
        let conn = self.connection()?;
        let deleted = conn.execute("DELETE FROM worker_bans WHERE expires_at <= ?1", [now])?;
        Ok(deleted)
    }
}

/// Result of one worker-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted {
        attempts: u32,
        /// The job has used up its attempts and must be marked failed.
        exhausted: bool,
    },
    /// A retried report from a worker already banned from the job.
    Duplicate,
    /// The job left the running state before the report was recorded.
    NotRunning,
}

/// Applies the ban TTL and the attempt cap on top of a [`FailureStore`].
pub struct FailureTracker {
    store: Arc<dyn FailureStore>,
    max_failed_attempts: u32,
    ban_ttl_secs: i64,
}

impl FailureTracker {
    pub fn new(store: Arc<dyn FailureStore>, max_failed_attempts: u32, ban_ttl_secs: i64) -> Self {
        Self {
            store,
            max_failed_attempts,
            ban_ttl_secs,
        }
    }

    fn ban_expiry(&self, now: i64) -> i64 {
        now.saturating_add(self.ban_ttl_secs)
    }

    pub fn ban(&self, worker_id: &str, job_id: &str, now: i64) -> DispatchResult<()> {
        debug!("Banning worker {} from job {}", worker_id, job_id);
        self.store.insert_ban(worker_id, job_id, self.ban_expiry(now))
    }

    pub fn is_banned(&self, worker_id: &str, job_id: &str, now: i64) -> DispatchResult<bool> {
        self.store.is_banned(worker_id, job_id, now)
    }

    pub fn banned_jobs(&self, worker_id: &str, now: i64) -> DispatchResult<Vec<String>> {
        self.store.banned_jobs(worker_id, now)
    }

    pub fn attempts(&self, job_id: &str) -> DispatchResult<u32> {
        self.store.failure_count(job_id)
    }

    /// Counts the failure, bans the reporting worker if it identified itself,
    /// and says whether the job has run out of attempts. Anonymous reports
    /// always count.
    pub fn on_failure(
        &self,
        job_id: &str,
        worker_id: Option<&str>,
        now: i64,
    ) -> DispatchResult<FailureOutcome> {
        let attempts =
            match self
                .store
                .record_failure(job_id, worker_id, now, self.ban_expiry(now))?
            {
                FailureRecord::Counted(attempts) => attempts,
                FailureRecord::AlreadyBanned => {
                    debug!(
                        "Worker {} already reported job {}, not counting again",
                        worker_id.unwrap_or_default(),
                        job_id
                    );
                    return Ok(FailureOutcome::Duplicate);
                }
                FailureRecord::NotRunning => return Ok(FailureOutcome::NotRunning),
            };
        let exhausted = attempts >= self.max_failed_attempts;
        info!(
            "Job {} failure {}/{}{}",
            job_id,
            attempts,
            self.max_failed_attempts,
            worker_id
                .map(|w| format!(" reported by {}", w))
                .unwrap_or_default()
        );
        Ok(FailureOutcome::Counted {
            attempts,
            exhausted,
        })
    }

    /// Forget everything about a job that left the schedulable pool.
    pub fn clear(&self, job_id: &str) -> DispatchResult<()> {
        self.store.clear_job(job_id)
    }

    pub fn prune_expired(&self, now: i64) -> DispatchResult<usize> {
        let pruned = self.store.prune_expired_bans(now)?;
        if pruned > 0 {
            info!("Pruned {} expired worker bans", pruned);
        }
        Ok(pruned)
    }
}
