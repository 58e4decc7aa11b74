//! Job record storage and persistence.
//!
//! SQLite-backed source of truth for the job state machine. Every mutation
//! is a single conditional `UPDATE`, so the status and the timestamp that
//! goes with it always land together and concurrent claimants cannot both
//! win.

use super::error::{DispatchError, DispatchResult};
use super::models::{Job, JobStatus};
use super::schema::DISPATCH_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::validate_and_migrate;
use anyhow::{anyhow, Context, Result};
use rusqlite::{types::Type, Connection, OptionalExtension, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, status, created_at, started_at, completed_at, canceled_at, \
     failed_at, last_heartbeat, data_bucket, checkpoint_bucket, checkpoint_prefix, \
     instance_data_prefix, class_data_prefix, model_bucket, model_key, params";

/// Trait for job record storage operations.
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateId` if the id is taken.
    fn create_job(&self, job: &Job) -> DispatchResult<()>;

    /// Get a job by id.
    fn get_job(&self, id: &str) -> DispatchResult<Job>;

    /// List jobs, oldest first, optionally restricted to one status.
    fn list_jobs(&self, status: Option<JobStatus>) -> DispatchResult<Vec<Job>>;

    /// Move a job along the state machine, setting the timestamp that goes
    /// with the new status. Returns the updated job.
    fn set_status(&self, id: &str, status: JobStatus, now: i64) -> DispatchResult<Job>;

    /// Extend the lease of a running job.
    fn touch_heartbeat(&self, id: &str, now: i64) -> DispatchResult<()>;

    /// Mark a running job complete and record where its model was written.
    fn set_completion(
        &self,
        id: &str,
        model_bucket: &str,
        model_key: &str,
        now: i64,
    ) -> DispatchResult<Job>;

    /// Best candidate for the next claim: the most overdue abandoned running
    /// job whose lease anchor is older than `stale_before`, else the oldest
    /// pending job. Jobs listed in `skip` are never returned.
    fn find_candidate(&self, stale_before: i64, skip: &[String]) -> DispatchResult<Option<Job>>;

    /// Atomically claim `candidate` if it is still in the state it was read
    /// in. Returns false when another claimant got there first.
    fn try_claim(&self, candidate: &Job, now: i64) -> DispatchResult<bool>;
}

/// SQLite-backed job store.
///
/// Also implements [`EventLog`](super::event_log::EventLog) and
/// [`FailureStore`](super::failure_tracker::FailureStore) over the same
/// database file.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Opens an existing database or creates a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| format!("Failed to open {:?}", db_path.as_ref()))?
        } else {
            let conn = Connection::open(&db_path)?;
            DISPATCH_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new dispatch database at {:?}", db_path.as_ref());
            conn
        };

        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        validate_and_migrate(&conn, DISPATCH_VERSIONED_SCHEMAS)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        DISPATCH_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the shared connection.
    pub(crate) fn connection(&self) -> DispatchResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| DispatchError::StorageUnavailable(anyhow!("connection mutex poisoned")))
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status_str: String = row.get("status")?;
        let status = JobStatus::from_str(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Text,
                format!("unknown job status '{}'", status_str).into(),
            )
        })?;
        let params_json: String = row.get("params")?;
        let params = serde_json::from_str(&params_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(15, Type::Text, Box::new(e))
        })?;

        Ok(Job {
            id: row.get("id")?,
            status,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            canceled_at: row.get("canceled_at")?,
            failed_at: row.get("failed_at")?,
            last_heartbeat: row.get("last_heartbeat")?,
            data_bucket: row.get("data_bucket")?,
            checkpoint_bucket: row.get("checkpoint_bucket")?,
            checkpoint_prefix: row.get("checkpoint_prefix")?,
            instance_data_prefix: row.get("instance_data_prefix")?,
            class_data_prefix: row.get("class_data_prefix")?,
            model_bucket: row.get("model_bucket")?,
            model_key: row.get("model_key")?,
            params,
        })
    }

    fn query_job(conn: &Connection, id: &str) -> DispatchResult<Option<Job>> {
        let job = conn
            .query_row(
                &format!("SELECT {} FROM training_jobs WHERE id = ?1", JOB_COLUMNS),
                [id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn require_job(conn: &Connection, id: &str) -> DispatchResult<Job> {
        Self::query_job(conn, id)?.ok_or_else(|| DispatchError::NotFound(id.to_string()))
    }

    /// First job matching `condition` in `order_by` order, skipping `skip`.
    fn first_matching(
        conn: &Connection,
        condition: &str,
        order_by: &str,
        mut params: Vec<Box<dyn ToSql>>,
        skip: &[String],
    ) -> DispatchResult<Option<Job>> {
        let mut sql = format!(
            "SELECT {} FROM training_jobs WHERE {}",
            JOB_COLUMNS, condition
        );
        if !skip.is_empty() {
            let placeholders = (0..skip.len())
                .map(|i| format!("?{}", params.len() + i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND id NOT IN ({})", placeholders));
            for id in skip {
                params.push(Box::new(id.clone()));
            }
        }
        sql.push_str(&format!(" ORDER BY {} LIMIT 1", order_by));

        let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let job = conn
            .query_row(&sql, params_refs.as_slice(), Self::row_to_job)
            .optional()?;
        Ok(job)
    }

    fn invalid_transition(id: &str, from: JobStatus, to: JobStatus) -> DispatchError {
        DispatchError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        }
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, job: &Job) -> DispatchResult<()> {
        let params_json = serde_json::to_string(&job.params)?;
        let conn = self.connection()?;
        let result = conn.execute(
            &format!(
                "INSERT INTO training_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                JOB_COLUMNS
            ),
            rusqlite::params![
                job.id,
                job.status.as_str(),
                job.created_at,
                job.started_at,
                job.completed_at,
                job.canceled_at,
                job.failed_at,
                job.last_heartbeat,
                job.data_bucket,
                job.checkpoint_bucket,
                job.checkpoint_prefix,
                job.instance_data_prefix,
                job.class_data_prefix,
                job.model_bucket,
                job.model_key,
                params_json,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Err(DispatchError::DuplicateId(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_job(&self, id: &str) -> DispatchResult<Job> {
        let conn = self.connection()?;
        Self::require_job(&conn, id)
    }

    fn list_jobs(&self, status: Option<JobStatus>) -> DispatchResult<Vec<Job>> {
        let conn = self.connection()?;
        let mut sql = format!("SELECT {} FROM training_jobs", JOB_COLUMNS);
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" WHERE status = ?1");
            params.push(Box::new(status.as_str()));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params_refs.as_slice(), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn set_status(&self, id: &str, status: JobStatus, now: i64) -> DispatchResult<Job> {
        let conn = self.connection()?;
        let current = Self::require_job(&conn, id)?;
        if !current.status.can_transition_to(status) {
            return Err(Self::invalid_transition(id, current.status, status));
        }

        let assignments = match (current.status, status) {
            (JobStatus::Pending, JobStatus::Running) => {
                "status = ?1, started_at = ?2, last_heartbeat = ?2"
            }
            (JobStatus::Running, JobStatus::Running) => {
                "status = ?1, last_heartbeat = MAX(COALESCE(last_heartbeat, 0), ?2)"
            }
            (_, JobStatus::Complete) => "status = ?1, completed_at = ?2",
            (_, JobStatus::Failed) => "status = ?1, failed_at = ?2",
            (_, JobStatus::Canceled) => "status = ?1, canceled_at = ?2",
            (from, to) => return Err(Self::invalid_transition(id, from, to)),
        };

        // Guarded on the status we validated against, in case another
        // connection moved the job in between.
        let changed = conn.execute(
            &format!(
                "UPDATE training_jobs SET {} WHERE id = ?3 AND status = ?4",
                assignments
            ),
            rusqlite::params![status.as_str(), now, id, current.status.as_str()],
        )?;
        if changed == 0 {
            let latest = Self::require_job(&conn, id)?;
            return Err(Self::invalid_transition(id, latest.status, status));
        }

        debug!("Job {} moved {} -> {}", id, current.status, status);
        Self::require_job(&conn, id)
    }

    fn touch_heartbeat(&self, id: &str, now: i64) -> DispatchResult<()> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE training_jobs SET last_heartbeat = MAX(COALESCE(last_heartbeat, 0), ?1) \
             WHERE id = ?2 AND status = 'running'",
            rusqlite::params![now, id],
        )?;
        if changed == 0 {
            Self::require_job(&conn, id)?;
            return Err(DispatchError::NotRunning(id.to_string()));
        }
        Ok(())
    }

    fn set_completion(
        &self,
        id: &str,
        model_bucket: &str,
        model_key: &str,
        now: i64,
    ) -> DispatchResult<Job> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE training_jobs \
             SET status = 'complete', completed_at = ?1, model_bucket = ?2, model_key = ?3 \
             WHERE id = ?4 AND status = 'running'",
            rusqlite::params![now, model_bucket, model_key, id],
        )?;
        if changed == 0 {
            let job = Self::require_job(&conn, id)?;
            return Err(Self::invalid_transition(id, job.status, JobStatus::Complete));
        }
        Self::require_job(&conn, id)
    }

    fn find_candidate(&self, stale_before: i64, skip: &[String]) -> DispatchResult<Option<Job>> {
        let conn = self.connection()?;

        let abandoned = Self::first_matching(
            &conn,
            "status = 'running' AND COALESCE(last_heartbeat, created_at) < ?1",
            "COALESCE(last_heartbeat, created_at) ASC, id ASC",
            vec![Box::new(stale_before)],
            skip,
        )?;
        if abandoned.is_some() {
            return Ok(abandoned);
        }

        Self::first_matching(
            &conn,
            "status = 'pending'",
            "created_at ASC, id ASC",
            Vec::new(),
            skip,
        )
    }

    fn try_claim(&self, candidate: &Job, now: i64) -> DispatchResult<bool> {
        let conn = self.connection()?;
        let changed = match candidate.status {
            JobStatus::Pending => conn.execute(
                "UPDATE training_jobs SET status = 'running', started_at = ?1, last_heartbeat = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![now, candidate.id],
            )?,
            JobStatus::Running => conn.execute(
                "UPDATE training_jobs SET last_heartbeat = MAX(COALESCE(last_heartbeat, 0), ?1) \
                 WHERE id = ?2 AND status = 'running' AND last_heartbeat IS ?3",
                rusqlite::params![now, candidate.id, candidate.last_heartbeat],
            )?,
            other => {
                return Err(Self::invalid_transition(
                    &candidate.id,
                    other,
                    JobStatus::Running,
                ))
            }
        };
        Ok(changed == 1)
    }
}
