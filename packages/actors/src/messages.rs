//! Message types for actor communication.

use realtime_core::{Job, JobEvent, JobId, JobResult, Queue, WorkerPolicy};
use ractor::RpcReplyPort;

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Persist and accept a new job.
    Enqueue {
        job: Box<Job>,
        reply: RpcReplyPort<Result<Job, String>>,
    },

    /// An idle worker asks for the next job.
    RequestJob {
        worker_id: String,
        reply: RpcReplyPort<Option<Job>>,
    },

    /// The job body returned. Answered once the outcome is stored.
    JobCompleted {
        job_id: JobId,
        worker_id: String,
        result: JobResult,
        reply: RpcReplyPort<()>,
    },

    /// The job body raised, panicked or timed out. Answered once the outcome
    /// is stored.
    JobFailed {
        job_id: JobId,
        worker_id: String,
        error: String,
        reply: RpcReplyPort<()>,
    },

    /// Get a job known to this queue.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<Job>>,
    },

    GetInfo { reply: RpcReplyPort<Queue> },

    Shutdown,

    /// Periodic housekeeping: drop expired results and adopt jobs nobody
    /// is working on.
    Tick,
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Execute a claimed job.
    ProcessJob { job: Box<Job> },

    IsIdle { reply: RpcReplyPort<bool> },

    Shutdown,

    /// Poll tick: an idle worker asks its queue for work.
    Heartbeat,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Start a queue with its workers, or return the running one.
    EnsureQueue {
        name: String,
        policy: WorkerPolicy,
        reply: RpcReplyPort<Result<Queue, String>>,
    },

    /// Enqueue a job on a named queue.
    EnqueueJob {
        queue: String,
        job: Job,
        reply: RpcReplyPort<Result<Job, String>>,
    },

    /// Look a job up in the running queues, then in the job store.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<Job>>,
    },

    /// Forward every backend event to `sender`.
    Subscribe {
        sender: tokio::sync::broadcast::Sender<JobEvent>,
    },

    Shutdown,

    /// Periodic housekeeping: purge expired results.
    Tick,
}
