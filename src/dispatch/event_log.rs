//! Append-only audit trail of job state changes.

use std::sync::Arc;

use rusqlite::types::Type;

use super::error::DispatchResult;
use super::job_store::SqliteJobStore;
use super::models::{EventType, Job, JobEvent, WorkerInfo};

/// Raw event storage.
pub trait EventLog: Send + Sync {
    /// Append one event. Returns its id.
    fn append_event(
        &self,
        job_id: &str,
        event_type: EventType,
        event_data: &WorkerInfo,
        now: i64,
    ) -> DispatchResult<i64>;

    /// All events of a job, oldest first.
    fn list_events(&self, job_id: &str) -> DispatchResult<Vec<JobEvent>>;
}

impl EventLog for SqliteJobStore {
    fn append_event(
        &self,
        job_id: &str,
        event_type: EventType,
        event_data: &WorkerInfo,
        now: i64,
    ) -> DispatchResult<i64> {
        let data_json = serde_json::to_string(event_data)?;
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO job_events (job_id, event_type, event_data, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![job_id, event_type.as_str(), data_json, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_events(&self, job_id: &str) -> DispatchResult<Vec<JobEvent>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, event_type, event_data, created_at FROM job_events \
             WHERE job_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let events = stmt
            .query_map([job_id], |row| {
                let type_str: String = row.get(2)?;
                let event_type = EventType::from_str(&type_str).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        Type::Text,
                        format!("unknown event type '{}'", type_str).into(),
                    )
                })?;
                let data_json: String = row.get(3)?;
                let event_data = serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                })?;
                Ok(JobEvent {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    event_type,
                    event_data,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

/// Records lifecycle events for jobs.
///
/// Every logical transition goes through exactly one method here, so callers
/// cannot forget which event type belongs to which transition.
pub struct EventLogger {
    log: Arc<dyn EventLog>,
}

impl EventLogger {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    pub fn log_created(&self, job: &Job, now: i64) -> DispatchResult<()> {
        self.append(job, EventType::Created, &WorkerInfo::default(), now)
    }

    /// A worker claimed a pending job.
    pub fn log_started(&self, job: &Job, worker: &WorkerInfo, now: i64) -> DispatchResult<()> {
        self.append(job, EventType::Started, worker, now)
    }

    /// A worker extended its lease, or reclaimed an abandoned job.
    pub fn log_heartbeat(&self, job: &Job, worker: &WorkerInfo, now: i64) -> DispatchResult<()> {
        self.append(job, EventType::Heartbeat, worker, now)
    }

    pub fn log_failed(&self, job: &Job, worker: &WorkerInfo, now: i64) -> DispatchResult<()> {
        self.append(job, EventType::Failed, worker, now)
    }

    pub fn log_complete(&self, job: &Job, worker: &WorkerInfo, now: i64) -> DispatchResult<()> {
        self.append(job, EventType::Complete, worker, now)
    }

    pub fn log_canceled(&self, job: &Job, now: i64) -> DispatchResult<()> {
        self.append(job, EventType::Canceled, &WorkerInfo::default(), now)
    }

    pub fn events_for(&self, job_id: &str) -> DispatchResult<Vec<JobEvent>> {
        self.log.list_events(job_id)
    }

    fn append(
        &self,
        job: &Job,
        event_type: EventType,
        worker: &WorkerInfo,
        now: i64,
    ) -> DispatchResult<()> {
        self.log.append_event(&job.id, event_type, worker, now)?;
        Ok(())
    }
}
