//! Events broadcast by the queue backend after each persisted state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Job, JobId, JobResult, Queue};

/// Events emitted by the queue backend.
///
/// An event is only broadcast once the change it describes has been written
/// to the job store, so a subscriber reading the store after receiving an
/// event never sees an older state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A queue was registered with its worker policy.
    QueueCreated {
        queue: Queue,
        timestamp: DateTime<Utc>,
    },
    /// A job was accepted by a queue.
    JobEnqueued { job: Job, timestamp: DateTime<Utc> },
    /// A worker claimed a job.
    JobStarted {
        job_id: JobId,
        queue: String,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A job body returned.
    JobCompleted {
        job_id: JobId,
        queue: String,
        result: JobResult,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job body raised an error or timed out.
    JobFailed {
        job_id: JobId,
        queue: String,
        error: String,
        attempts: u32,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    /// A failed job went back to pending for another attempt.
    JobRetrying {
        job_id: JobId,
        queue: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::QueueCreated { timestamp, .. }
            | JobEvent::JobEnqueued { timestamp, .. }
            | JobEvent::JobStarted { timestamp, .. }
            | JobEvent::JobCompleted { timestamp, .. }
            | JobEvent::JobFailed { timestamp, .. }
            | JobEvent::JobRetrying { timestamp, .. } => *timestamp,
        }
    }

    /// Name of the queue the event happened on.
    pub fn queue(&self) -> &str {
        match self {
            JobEvent::QueueCreated { queue, .. } => &queue.name,
            JobEvent::JobEnqueued { job, .. } => &job.queue,
            JobEvent::JobStarted { queue, .. }
            | JobEvent::JobCompleted { queue, .. }
            | JobEvent::JobFailed { queue, .. }
            | JobEvent::JobRetrying { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::QueueCreated { .. } => None,
            JobEvent::JobEnqueued { job, .. } => Some(job.id),
            JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::JobRetrying { job_id, .. } => Some(*job_id),
        }
    }

    /// Whether the job reached a state it will never leave.
    pub fn is_terminal(&self) -> bool {
        match self {
            JobEvent::JobCompleted { .. } => true,
            JobEvent::JobFailed { will_retry, .. } => !will_retry,
            _ => false,
        }
    }

    /// Short description for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::QueueCreated { queue, .. } => format!("Queue '{}' created", queue.name),
            JobEvent::JobEnqueued { job, .. } => {
                format!("Job {} ({}) enqueued on '{}'", job.id, job.job_type, job.queue)
            }
            JobEvent::JobStarted {
                job_id, worker_id, ..
            } => format!("Job {} started by {}", job_id, worker_id),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobFailed {
                job_id,
                error,
                will_retry,
                ..
            } => {
                let retry = if *will_retry { " (will retry)" } else { "" };
                format!("Job {} failed: {}{}", job_id, error, retry)
            }
            JobEvent::JobRetrying {
                job_id, attempt, ..
            } => format!("Job {} retrying (attempt {})", job_id, attempt),
        }
    }
}
