//! Data models for the training job dispatcher.
//!
//! Jobs, their lifecycle statuses, audit events, worker metadata and the
//! payloads exchanged with workers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Complete, // terminal
    Failed,   // terminal
    Canceled, // terminal
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "complete" => Some(JobStatus::Complete),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    /// Returns true once the job can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// `Running -> Running` is the heartbeat self-loop. A pending job may be
    /// canceled before any worker picks it up.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, Running)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entry in a job's audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Started,
    Heartbeat,
    Failed,
    Complete,
    Canceled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Started => "started",
            EventType::Heartbeat => "heartbeat",
            EventType::Failed => "failed",
            EventType::Complete => "complete",
            EventType::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventType::Created),
            "started" => Some(EventType::Started),
            "heartbeat" => Some(EventType::Heartbeat),
            "failed" => Some(EventType::Failed),
            "complete" => Some(EventType::Complete),
            "canceled" => Some(EventType::Canceled),
            _ => None,
        }
    }
}

/// Environment metadata a worker reports about itself.
///
/// Every field is optional; workers outside a managed container platform may
/// send none of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_group_id: Option<String>,
}

impl WorkerInfo {
    /// Identity used for per-worker bans: the machine id, falling back to the
    /// container group id.
    pub fn identity(&self) -> Option<&str> {
        self.machine_id
            .as_deref()
            .or(self.container_group_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Field names owned by the job record. Hyperparameters may not reuse them.
pub const RESERVED_JOB_FIELDS: &[&str] = &[
    "id",
    "status",
    "created_at",
    "started_at",
    "completed_at",
    "canceled_at",
    "failed_at",
    "last_heartbeat",
    "data_bucket",
    "checkpoint_bucket",
    "checkpoint_prefix",
    "instance_data_prefix",
    "class_data_prefix",
    "model_bucket",
    "model_key",
    "resume_from",
    "instance_data_keys",
    "class_data_keys",
];

/// A training job as stored in the job record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub last_heartbeat: Option<i64>,
    pub data_bucket: String,
    pub checkpoint_bucket: String,
    pub checkpoint_prefix: String,
    pub instance_data_prefix: String,
    pub class_data_prefix: Option<String>,
    pub model_bucket: Option<String>,
    pub model_key: Option<String>,
    /// Training hyperparameters, passed through untouched.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Job {
    /// Builds a new pending job from a creation request.
    pub fn new(
        id: String,
        spec: JobSpec,
        data_bucket: &str,
        checkpoint_bucket: &str,
        now: i64,
    ) -> Self {
        let checkpoint_prefix = checkpoint_prefix_for(&id);
        Job {
            id,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            canceled_at: None,
            failed_at: None,
            last_heartbeat: None,
            data_bucket: data_bucket.to_string(),
            checkpoint_bucket: checkpoint_bucket.to_string(),
            checkpoint_prefix,
            instance_data_prefix: spec.instance_data_prefix,
            class_data_prefix: spec.class_data_prefix,
            model_bucket: None,
            model_key: None,
            params: spec.params,
        }
    }

    /// Timestamp the lease is measured from.
    pub fn lease_anchor(&self) -> i64 {
        self.last_heartbeat.unwrap_or(self.created_at)
    }
}

/// Object-store prefix under which a job's checkpoints live.
pub fn checkpoint_prefix_for(job_id: &str) -> String {
    format!("loras/{}/", job_id)
}

/// Request to create a new job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub instance_data_prefix: String,
    #[serde(default)]
    pub class_data_prefix: Option<String>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// One entry of a job's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: String,
    pub event_type: EventType,
    pub event_data: WorkerInfo,
    pub created_at: i64,
}

/// Job handed to a worker, hydrated with resume and input data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    #[serde(flatten)]
    pub job: Job,
    pub resume_from: Option<String>,
    pub instance_data_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_data_keys: Option<Vec<String>>,
}

/// Body of the progress, complete and fail webhooks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub worker: WorkerInfo,
}

/// Outcome of a checkpoint retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub listed: usize,
    pub deleted: usize,
    pub failed: usize,
}
