//! Facade over the dispatch core, one method per request-layer operation.

use std::sync::Arc;

use serde_json::Map;
use tracing::{debug, info, warn};

use super::checkpoints::CheckpointIndex;
use super::error::{DispatchError, DispatchResult};
use super::event_log::{EventLog, EventLogger};
use super::failure_tracker::{FailureOutcome, FailureStore, FailureTracker};
use super::job_store::JobStore;
use super::models::{
    GcReport, Job, JobEvent, JobSpec, JobStatus, WebhookPayload, WorkItem, WorkerInfo,
    RESERVED_JOB_FIELDS,
};
use super::scheduler::LeaseScheduler;
use crate::config::{BucketSettings, SchedulerSettings};
use crate::object_store::ObjectStore;
use crate::server::metrics;

/// Source of "now", in Unix seconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp())
}

pub struct DispatchManager {
    jobs: Arc<dyn JobStore>,
    events: Arc<EventLogger>,
    failures: Arc<FailureTracker>,
    checkpoints: Arc<CheckpointIndex>,
    scheduler: LeaseScheduler,
    buckets: BucketSettings,
    settings: SchedulerSettings,
    clock: Clock,
}

impl DispatchManager {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        events: Arc<dyn EventLog>,
        failures: Arc<dyn FailureStore>,
        objects: Arc<dyn ObjectStore>,
        buckets: BucketSettings,
        settings: SchedulerSettings,
    ) -> Self {
        let events = Arc::new(EventLogger::new(events));
        let failures = Arc::new(FailureTracker::new(
            failures,
            settings.max_failed_attempts,
            i64::try_from(settings.ban_ttl_secs).unwrap_or(i64::MAX),
        ));
        let checkpoints = Arc::new(CheckpointIndex::new(objects));
        let scheduler = LeaseScheduler::new(
            jobs.clone(),
            events.clone(),
            failures.clone(),
            checkpoints.clone(),
            settings.max_heartbeat_age_secs,
            settings.max_claim_attempts_per_poll,
        );
        Self {
            jobs,
            events,
            failures,
            checkpoints,
            scheduler,
            buckets,
            settings,
            clock: system_clock(),
        }
    }

    /// Replace the wall clock, for callers that need deterministic time.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn create_job(&self, spec: JobSpec) -> DispatchResult<Job> {
        validate_spec(&spec)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = self.now();
        let job = Job::new(
            id,
            spec,
            &self.buckets.training_bucket,
            &self.buckets.checkpoint_bucket,
            now,
        );
        self.jobs.create_job(&job)?;
        self.events.log_created(&job, now)?;
        metrics::record_job_created();
        info!("Created job {} ({})", job.id, job.instance_data_prefix);
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> DispatchResult<Job> {
        self.jobs.get_job(id)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> DispatchResult<Vec<Job>> {
        self.jobs.list_jobs(status)
    }

    /// Cancel a pending or running job. Canceling twice is a no-op.
    pub fn cancel_job(&self, id: &str) -> DispatchResult<Job> {
        let job = self.jobs.get_job(id)?;
        if job.status == JobStatus::Canceled {
            return Ok(job);
        }
        let now = self.now();
        let job = self.jobs.set_status(id, JobStatus::Canceled, now)?;
        self.events.log_canceled(&job, now)?;
        self.failures.clear(id)?;
        info!("Canceled job {}", id);
        Ok(job)
    }

    pub fn claim_next_job(&self, worker: &WorkerInfo) -> DispatchResult<Option<WorkItem>> {
        self.scheduler.claim_next(worker, self.now())
    }

    pub fn peek_next_job(&self) -> DispatchResult<Option<WorkItem>> {
        self.scheduler.peek(self.now())
    }

    pub fn heartbeat(&self, id: &str, worker: &WorkerInfo) -> DispatchResult<()> {
        self.scheduler.heartbeat(id, worker, self.now())
    }

    /// A worker uploaded a checkpoint. Only retention runs; unknown jobs are
    /// ignored.
    pub fn report_progress(&self, webhook: &WebhookPayload) -> DispatchResult<GcReport> {
        let job = match self.jobs.get_job(&webhook.job_id) {
            Ok(job) => job,
            Err(DispatchError::NotFound(_)) => {
                debug!("Progress for unknown job {}, ignoring", webhook.job_id);
                return Ok(GcReport::default());
            }
            Err(e) => return Err(e),
        };
        Ok(self.collect_garbage(&job))
    }

    /// Mark a running job complete with the model the webhook points at.
    pub fn report_complete(&self, webhook: &WebhookPayload) -> DispatchResult<Job> {
        let (bucket, key) = match (webhook.bucket_name.as_deref(), webhook.key.as_deref()) {
            (Some(bucket), Some(key)) if !key.is_empty() => (bucket, key),
            _ => {
                return Err(DispatchError::ValidationFailed(
                    "completion requires bucket_name and key".to_string(),
                ))
            }
        };
        let bucket = self.buckets.resolve(bucket).ok_or_else(|| {
            DispatchError::ValidationFailed(format!("unknown bucket: {}", bucket))
        })?;

        let current = self.jobs.get_job(&webhook.job_id)?;
        if current.status == JobStatus::Complete {
            debug!("Job {} already complete", current.id);
            self.collect_garbage(&current);
            return Ok(current);
        }

        let now = self.now();
        let job = self
            .jobs
            .set_completion(&webhook.job_id, bucket, key, now)?;
        self.events.log_complete(&job, &webhook.worker, now)?;
        self.failures.clear(&job.id)?;
        info!("Job {} complete: {}/{}", job.id, bucket, key);
        self.collect_garbage(&job);
        Ok(job)
    }

    /// Count a failure against the job, ban the reporting worker from it, and
    /// fail the job once it runs out of attempts.
    ///
    /// A retry from a worker already banned from the job is not counted
    /// again. Reports for finished jobs are ignored.
    pub fn report_failure(&self, webhook: &WebhookPayload) -> DispatchResult<Job> {
        let job = self.jobs.get_job(&webhook.job_id)?;
        let now = self.now();

        let (attempts, exhausted) =
            match self
                .failures
                .on_failure(&job.id, webhook.worker.identity(), now)?
            {
                FailureOutcome::Counted {
                    attempts,
                    exhausted,
                } => (attempts, exhausted),
                FailureOutcome::Duplicate => return self.jobs.get_job(&job.id),
                FailureOutcome::NotRunning => {
                    let current = self.jobs.get_job(&job.id)?;
                    if current.status.is_terminal() {
                        debug!("Failure for {} job {}, ignoring", current.status, current.id);
                        return Ok(current);
                    }
                    return Err(DispatchError::InvalidTransition {
                        id: current.id,
                        from: current.status,
                        to: JobStatus::Failed,
                    });
                }
            };

        self.events.log_failed(&job, &webhook.worker, now)?;
        metrics::record_failure_reported(exhausted);

        if exhausted {
            return self.fail_permanently(&job.id, attempts, now);
        }

        let current = self.jobs.get_job(&job.id)?;
        if current.status.is_terminal() {
            // Finished while the report was being recorded
            self.failures.clear(&current.id)?;
        }
        Ok(current)
    }

    fn fail_permanently(&self, job_id: &str, attempts: u32, now: i64) -> DispatchResult<Job> {
        let failed = match self.jobs.set_status(job_id, JobStatus::Failed, now) {
            Ok(failed) => {
                warn!(
                    "Job {} failed permanently after {} attempts",
                    job_id, attempts
                );
                failed
            }
            // Canceled, completed or failed by a concurrent request
            Err(DispatchError::InvalidTransition { from, .. }) if from.is_terminal() => {
                self.jobs.get_job(job_id)?
            }
            Err(e) => return Err(e),
        };
        self.failures.clear(job_id)?;
        Ok(failed)
    }

    pub fn list_events(&self, job_id: &str) -> DispatchResult<Vec<JobEvent>> {
        self.jobs.get_job(job_id)?;
        self.events.events_for(job_id)
    }

    pub fn prune_expired_bans(&self) -> DispatchResult<usize> {
        self.failures.prune_expired(self.now())
    }

    fn collect_garbage(&self, job: &Job) -> GcReport {
        self.checkpoints
            .enforce_retention(job, self.settings.max_stored_checkpoints)
    }
}

fn validate_spec(spec: &JobSpec) -> DispatchResult<()> {
    if spec.instance_data_prefix.trim().is_empty() {
        return Err(DispatchError::ValidationFailed(
            "instance_data_prefix must not be empty".to_string(),
        ));
    }
    if let Some(field) = reserved_field(&spec.params) {
        return Err(DispatchError::ValidationFailed(format!(
            "parameter {:?} is reserved",
            field
        )));
    }
    Ok(())
}

fn reserved_field(params: &Map<String, serde_json::Value>) -> Option<&str> {
    params
        .keys()
        .map(String::as_str)
        .find(|key| RESERVED_JOB_FIELDS.contains(key))
}
