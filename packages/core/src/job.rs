//! Job domain types for work items handed to the queue backend.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

/// Opaque handle to an enqueued job, using ULID for chronological sorting.
///
/// This is the `task_id` stored on a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend status of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be claimed by a worker.
    #[default]
    Pending,
    /// Job has been claimed and is executing.
    Running {
        started_at: DateTime<Utc>,
        worker_id: String,
    },
    /// Job body returned a result.
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        result: JobResult,
    },
    /// Job body raised an unrecoverable error (retries exhausted).
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
        attempts: u32,
    },
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }

    /// Get a simple status string for display and filtering.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running { .. } => "running",
            JobStatus::Completed { .. } => "completed",
            JobStatus::Failed { .. } => "failed",
        }
    }

    /// When the job reached its terminal state, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobStatus::Completed { completed_at, .. } => Some(*completed_at),
            JobStatus::Failed { failed_at, .. } => Some(*failed_at),
            _ => None,
        }
    }
}

/// Payload returned by a completed job.
///
/// Serializes as a flat mapping with at least a `success` flag, e.g.
/// `{"success": true, "hazard_path": "/home/realtime/ashmaps/.../ash_fall.tif"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl JobResult {
    pub fn success() -> Self {
        Self {
            success: true,
            fields: Map::new(),
        }
    }

    pub fn unsuccessful(reason: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("error".to_string(), Value::String(reason.into()));
        Self {
            success: false,
            fields,
        }
    }

    /// Add a field to the payload.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Read a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn hazard_path(&self) -> Option<&str> {
        self.get_str("hazard_path")
    }

    pub fn impact_path(&self) -> Option<&str> {
        self.get_str("impact_path")
    }
}

/// How long past its timeout a running job stays with the worker that
/// claimed it. After that any process sharing the store may take it back.
pub const LEASE_GRACE_SECS: i64 = 60;

/// A job represents a unit of work dispatched to a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Name of the queue this job was routed to.
    pub queue: String,
    /// Type of job (used for routing and handler lookup).
    pub job_type: String,
    /// Job arguments as JSON.
    pub payload: Value,
    /// Current backend status.
    pub status: JobStatus,
    /// Number of attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Timeout in seconds for job execution.
    pub timeout_secs: u64,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
    /// After this instant a terminal job's result may be purged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_retries: 0,
            timeout_secs: 1800,
            created_at: now,
            updated_at: now,
            result_expires_at: None,
        }
    }

    /// Set the max retries for this job.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the timeout for this job.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// A job that failed before and went back to pending is being retried.
    pub fn is_retrying(&self) -> bool {
        matches!(self.status, JobStatus::Pending) && self.attempts > 0
    }

    /// When the claim on a running job lapses: its start plus the timeout and
    /// [`LEASE_GRACE_SECS`]. `None` unless the job is running.
    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            JobStatus::Running { started_at, .. } => {
                let timeout = i64::from(u32::try_from(self.timeout_secs).unwrap_or(u32::MAX));
                Some(*started_at + Duration::seconds(timeout + LEASE_GRACE_SECS))
            }
            _ => None,
        }
    }

    /// A running job whose worker would have given up on it by `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at().is_some_and(|at| at <= now)
    }

    /// Read a string argument from the payload.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_serializes_as_flat_mapping() {
        let result = JobResult::success().with(
            "hazard_path",
            "/home/realtime/ashmaps/201702211904+0700_Merapi/ash_fall.tif",
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "success": true,
                "hazard_path": "/home/realtime/ashmaps/201702211904+0700_Merapi/ash_fall.tif"
            })
        );

        let back: JobResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
        assert_eq!(
            back.hazard_path(),
            Some("/home/realtime/ashmaps/201702211904+0700_Merapi/ash_fall.tif")
        );
    }

    #[test]
    fn nested_payloads_survive_serialization() {
        let payload = json!({
            "hazard_path": "/tmp/hazard.tif",
            "options": {"locale": "id", "aggregation": {"enabled": false}},
        });
        let job = Job::new("inasafe-headless-analysis", "inasafe.headless.run_analysis", payload.clone());

        let text = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&text).unwrap();
        assert_eq!(back.payload, payload);
        assert_eq!(back.arg_str("hazard_path"), Some("/tmp/hazard.tif"));
    }

    #[test]
    fn retrying_means_pending_after_an_attempt() {
        let mut job = Job::new("q", "t", json!({}));
        assert!(!job.is_retrying());
        job.attempts = 1;
        assert!(job.is_retrying());
        job.status = JobStatus::Failed {
            started_at: Utc::now(),
            failed_at: Utc::now(),
            error: "boom".into(),
            attempts: 1,
        };
        assert!(!job.is_retrying());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn running_job_lease_follows_its_timeout() {
        let mut job = Job::new("q", "t", json!({})).with_timeout(60);
        assert!(job.lease_expires_at().is_none());
        assert!(!job.lease_expired(Utc::now() + Duration::days(1)));

        let started_at = Utc::now();
        job.status = JobStatus::Running {
            started_at,
            worker_id: "w".into(),
        };
        assert_eq!(
            job.lease_expires_at(),
            Some(started_at + Duration::seconds(60 + LEASE_GRACE_SECS))
        );
        assert!(!job.lease_expired(started_at + Duration::seconds(61)));
        assert!(job.lease_expired(started_at + Duration::seconds(60 + LEASE_GRACE_SECS)));
    }
}
