//! Lease scheduler.
//!
//! Answers "what should this worker do next?". Abandoned running jobs are
//! offered before pending ones, most overdue first; pending jobs go out in
//! creation order. A worker is never offered a job it is banned from.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::checkpoints::CheckpointIndex;
use super::error::DispatchResult;
use super::event_log::EventLogger;
use super::failure_tracker::FailureTracker;
use super::job_store::JobStore;
use super::models::{Job, JobStatus, WorkItem, WorkerInfo};
use crate::server::metrics::{self, claim_outcome};

pub struct LeaseScheduler {
    jobs: Arc<dyn JobStore>,
    events: Arc<EventLogger>,
    failures: Arc<FailureTracker>,
    checkpoints: Arc<CheckpointIndex>,
    max_heartbeat_age_secs: i64,
    max_claim_attempts: u32,
}

impl LeaseScheduler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        events: Arc<EventLogger>,
        failures: Arc<FailureTracker>,
        checkpoints: Arc<CheckpointIndex>,
        max_heartbeat_age_secs: u64,
        max_claim_attempts: u32,
    ) -> Self {
        Self {
            jobs,
            events,
            failures,
            checkpoints,
            max_heartbeat_age_secs: i64::try_from(max_heartbeat_age_secs).unwrap_or(i64::MAX),
            max_claim_attempts: max_claim_attempts.max(1),
        }
    }

    fn stale_before(&self, now: i64) -> i64 {
        now.saturating_sub(self.max_heartbeat_age_secs)
    }

    /// Claim the next job for `worker`, or None when there is nothing it may
    /// take.
    ///
    /// Candidates that turn out to be banned, or that another worker claims
    /// first, are skipped; at most `max_claim_attempts` candidates are tried.
    pub fn claim_next(&self, worker: &WorkerInfo, now: i64) -> DispatchResult<Option<WorkItem>> {
        let identity = worker.identity();
        let mut skip = match identity {
            Some(worker_id) => self.failures.banned_jobs(worker_id, now)?,
            None => Vec::new(),
        };
        let stale_before = self.stale_before(now);

        for attempt in 1..=self.max_claim_attempts {
            let Some(candidate) = self.jobs.find_candidate(stale_before, &skip)? else {
                metrics::record_claim(claim_outcome::EMPTY);
                return Ok(None);
            };

            if let Some(worker_id) = identity {
                if self.failures.is_banned(worker_id, &candidate.id, now)? {
                    debug!("Worker {} is banned from job {}", worker_id, candidate.id);
                    metrics::record_claim(claim_outcome::BANNED_SKIP);
                    skip.push(candidate.id);
                    continue;
                }
            }

            // Hydrate before claiming so an object store outage does not
            // leave a claimed job nobody received.
            let hydrated = self.hydrate(candidate.clone())?;

            if !self.jobs.try_claim(&candidate, now)? {
                debug!(
                    "Lost claim race for job {} (attempt {}/{})",
                    candidate.id, attempt, self.max_claim_attempts
                );
                metrics::record_claim(claim_outcome::RACE_LOST);
                skip.push(candidate.id);
                continue;
            }

            let job = self.jobs.get_job(&candidate.id)?;
            let reclaimed = candidate.status == JobStatus::Running;
            let logged = if reclaimed {
                info!(
                    "Reclaimed abandoned job {} for worker {:?} (idle for {}s)",
                    job.id,
                    identity,
                    now - candidate.lease_anchor()
                );
                metrics::record_claim(claim_outcome::RECLAIMED);
                self.events.log_heartbeat(&job, worker, now)
            } else {
                info!("Job {} started by worker {:?}", job.id, identity);
                metrics::record_claim(claim_outcome::CLAIMED);
                self.events.log_started(&job, worker, now)
            };
            if let Err(e) = logged {
                warn!("Failed to record claim event for job {}: {}", job.id, e);
            }

            return Ok(Some(WorkItem { job, ..hydrated }));
        }

        warn!(
            "Gave up after {} claim attempts for worker {:?}",
            self.max_claim_attempts, identity
        );
        Ok(None)
    }

    /// What the next claim would return, without claiming it.
    pub fn peek(&self, now: i64) -> DispatchResult<Option<WorkItem>> {
        self.jobs
            .find_candidate(self.stale_before(now), &[])?
            .map(|job| self.hydrate(job))
            .transpose()
    }

    /// Extend the lease of a running job.
    pub fn heartbeat(&self, job_id: &str, worker: &WorkerInfo, now: i64) -> DispatchResult<()> {
        self.jobs.touch_heartbeat(job_id, now)?;
        let job = self.jobs.get_job(job_id)?;
        self.events.log_heartbeat(&job, worker, now)
    }

    fn hydrate(&self, job: Job) -> DispatchResult<WorkItem> {
        let resume_from = self.checkpoints.latest_checkpoint(&job)?;
        let instance_data_keys = self.checkpoints.instance_data_keys(&job)?;
        let class_data_keys = self.checkpoints.class_data_keys(&job)?;
        Ok(WorkItem {
            job,
            resume_from,
            instance_data_keys,
            class_data_keys,
        })
    }
}
