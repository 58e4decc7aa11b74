mod checkpoints;
mod error;
mod event_log;
mod failure_tracker;
mod job_store;
mod manager;
mod models;
mod scheduler;
mod schema;

pub use checkpoints::CheckpointIndex;
pub use error::{DispatchError, DispatchResult};
pub use event_log::{EventLog, EventLogger};
pub use failure_tracker::{FailureOutcome, FailureRecord, FailureStore, FailureTracker};
pub use job_store::{JobStore, SqliteJobStore};
pub use manager::{Clock, DispatchManager};
pub use models::{
    checkpoint_prefix_for, EventType, GcReport, Job, JobEvent, JobSpec, JobStatus,
    WebhookPayload, WorkItem, WorkerInfo, RESERVED_JOB_FIELDS,
};
pub use scheduler::LeaseScheduler;
pub use schema::DISPATCH_VERSIONED_SCHEMAS;
