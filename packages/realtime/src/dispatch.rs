//! Routing jobs onto the queue backend.

use std::sync::Arc;

use actors::{ActorRef, SupervisorMessage};
use realtime_core::{Job, JobEvent, JobId, Queue, RoutingTable};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::backoff::{RetryPolicy, retry};
use crate::error::PipelineError;

/// Why a single enqueue attempt failed.
#[derive(Debug)]
enum EnqueueFailure {
    /// The backend answered with an error (e.g. the store refused the write).
    Rejected(String),
    /// The supervisor is gone.
    Unreachable(String),
}

impl std::fmt::Display for EnqueueFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueFailure::Rejected(reason) | EnqueueFailure::Unreachable(reason) => {
                f.write_str(reason)
            }
        }
    }
}

/// Hands jobs to the queue their type is routed to.
///
/// Cheap to clone; the routing table is shared read-only.
#[derive(Clone)]
pub struct Dispatcher {
    supervisor: ActorRef<SupervisorMessage>,
    routing: Arc<RoutingTable>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(supervisor: ActorRef<SupervisorMessage>, routing: Arc<RoutingTable>) -> Self {
        Self {
            supervisor,
            routing,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn supervisor(&self) -> &ActorRef<SupervisorMessage> {
        &self.supervisor
    }

    /// Start every queue the routing table can send jobs to.
    pub async fn ensure_queues(&self) -> Result<Vec<Queue>, PipelineError> {
        let mut started = Vec::new();
        for name in self.routing.queue_names() {
            let policy = self.routing.policy_for(&name);
            let (tx, rx) = actors::concurrency::oneshot();
            self.supervisor
                .send_message(SupervisorMessage::EnsureQueue {
                    name: name.clone(),
                    policy,
                    reply: tx.into(),
                })
                .map_err(|e| PipelineError::Backend(e.to_string()))?;

            let queue = rx
                .await
                .map_err(|_| PipelineError::Backend(format!("no reply starting queue {name}")))?
                .map_err(PipelineError::Backend)?;
            tracing::info!(queue = %queue.name, policy = ?queue.policy, "Queue ready");
            started.push(queue);
        }
        Ok(started)
    }

    /// Build a job for `job_type` on its routed queue with that queue's
    /// timeout and retry defaults.
    pub fn job_for(&self, job_type: &str, payload: Value) -> Job {
        let queue = self.routing.queue_for(job_type);
        if !self.routing.is_registered(job_type) {
            tracing::debug!(job_type, queue, "No route for job type, using the default queue");
        }
        let policy = self.routing.policy_for(queue);
        Job::new(queue, job_type, payload)
            .with_timeout(policy.timeout_secs)
            .with_max_retries(policy.max_retries)
    }

    /// Route and enqueue a job, retrying transient backend failures.
    pub async fn dispatch(&self, job_type: &str, payload: Value) -> Result<Job, PipelineError> {
        let job = self.job_for(job_type, payload);
        self.enqueue(job).await
    }

    /// Enqueue an already-built job on its queue.
    pub async fn enqueue(&self, job: Job) -> Result<Job, PipelineError> {
        let job_type = job.job_type.clone();
        let result = retry(
            &self.retry,
            &job_type,
            |e: &EnqueueFailure| matches!(e, EnqueueFailure::Rejected(_)),
            || self.try_enqueue(job.clone()),
        )
        .await;

        match result {
            Ok(job) => {
                tracing::debug!(job_id = %job.id, job_type = %job.job_type, queue = %job.queue, "Dispatched job");
                Ok(job)
            }
            Err(e) => {
                let attempts = e.attempts();
                Err(PipelineError::Dispatch {
                    job_type,
                    attempts,
                    reason: e.into_inner().to_string(),
                })
            }
        }
    }

    async fn try_enqueue(&self, job: Job) -> Result<Job, EnqueueFailure> {
        let (tx, rx) = actors::concurrency::oneshot();
        self.supervisor
            .send_message(SupervisorMessage::EnqueueJob {
                queue: job.queue.clone(),
                job,
                reply: tx.into(),
            })
            .map_err(|e| EnqueueFailure::Unreachable(e.to_string()))?;

        match rx.await {
            Ok(Ok(job)) => Ok(job),
            Ok(Err(reason)) => Err(EnqueueFailure::Rejected(reason)),
            Err(_) => Err(EnqueueFailure::Unreachable("supervisor dropped the reply".into())),
        }
    }

    /// Look a job up in the running backend, falling back to the store.
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, PipelineError> {
        let (tx, rx) = actors::concurrency::oneshot();
        self.supervisor
            .send_message(SupervisorMessage::GetJob {
                job_id,
                reply: tx.into(),
            })
            .map_err(|e| PipelineError::Backend(e.to_string()))?;
        rx.await
            .map_err(|_| PipelineError::Backend("supervisor dropped the reply".into()))
    }

    /// Subscribe to job events from every queue.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<JobEvent>, PipelineError> {
        let (tx, rx) = broadcast::channel(1024);
        self.supervisor
            .send_message(SupervisorMessage::Subscribe { sender: tx })
            .map_err(|e| PipelineError::Backend(e.to_string()))?;
        Ok(rx)
    }

    pub fn shutdown(&self) {
        let _ = self.supervisor.send_message(SupervisorMessage::Shutdown);
    }
}
