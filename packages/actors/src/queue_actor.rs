//! Queue actor for managing jobs in a single named queue.

use std::collections::{HashMap, VecDeque};

use chrono::{Duration, Utc};
use db::repositories::JobRepository;
use realtime_core::{Job, JobEvent, JobId, JobResult, JobStatus, Queue};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;

use crate::messages::QueueMessage;

/// State for the queue actor.
pub struct QueueActorState {
    pub queue: Queue,
    /// Jobs waiting for a worker, oldest first.
    pending: VecDeque<Job>,
    /// Jobs handed to a worker.
    running: HashMap<JobId, Job>,
    /// Every job this actor has seen, until its result expires.
    jobs: HashMap<JobId, Job>,
    /// How long terminal results stay queryable.
    result_expires: Duration,
    event_tx: Option<broadcast::Sender<JobEvent>>,
}

impl QueueActorState {
    pub fn new(queue: Queue) -> Self {
        Self {
            queue,
            pending: VecDeque::new(),
            running: HashMap::new(),
            jobs: HashMap::new(),
            result_expires: Duration::hours(24),
            event_tx: None,
        }
    }

    pub fn with_event_tx(mut self, tx: broadcast::Sender<JobEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_result_expires(mut self, result_expires: Duration) -> Self {
        self.result_expires = result_expires;
        self
    }

    fn broadcast(&self, event: JobEvent) {
        tracing::debug!(queue = %self.queue.name, "{}", event.description());
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn refresh_stats(&mut self) {
        self.queue.stats.pending = self.pending.len() as u64;
        self.queue.stats.running = self.running.len() as u64;
    }

    /// Whether another job may be claimed under the queue's worker policy.
    fn has_capacity(&self) -> bool {
        self.running.len() < self.queue.policy.reservation_limit()
    }

    /// Take over stored jobs of this queue that nobody here holds: pending
    /// jobs accepted by any process, and running jobs whose lease expired.
    ///
    /// Running jobs with a live lease belong to a worker that may still be
    /// busy with them, possibly in another process, and are left alone.
    async fn adopt(&mut self) {
        let unfinished = match JobRepository::unfinished_for_queue(&self.queue.name).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(queue = %self.queue.name, "Failed to load unfinished jobs: {}", e);
                return;
            }
        };

        let now = Utc::now();
        let mut adopted = 0usize;
        for mut job in unfinished {
            if self.jobs.get(&job.id).is_some_and(|known| !known.status.is_terminal()) {
                continue;
            }
            if let JobStatus::Running { worker_id, .. } = &job.status {
                if !job.lease_expired(now) {
                    continue;
                }
                let held_by = worker_id.clone();
                let attempts = job.attempts;
                job.status = JobStatus::Pending;
                match JobRepository::release(&job, &held_by, attempts).await {
                    Ok(Some(released)) => {
                        tracing::info!(job_id = %job.id, worker = %held_by, "Took back abandoned job");
                        job = released;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("Failed to reset abandoned job {}: {}", job.id, e);
                        continue;
                    }
                }
            }
            self.jobs.insert(job.id, job.clone());
            self.pending.push_back(job);
            adopted += 1;
        }

        if adopted > 0 {
            tracing::info!(queue = %self.queue.name, adopted, "Adopted unfinished jobs");
        }
        self.refresh_stats();
    }

    /// Persist a terminal job and schedule its result for expiry.
    async fn finish(&mut self, job: Job) -> Job {
        let job = match JobRepository::save(&job).await {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!("Failed to update job {} status: {}", job.id, e);
                job
            }
        };
        let job = match JobRepository::archive(&job, self.result_expires).await {
            Ok(archived) => archived,
            Err(e) => {
                tracing::warn!("Failed to archive job {}: {}", job.id, e);
                job
            }
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    async fn complete(&mut self, job_id: JobId, result: JobResult) {
        let Some(mut job) = self.running.remove(&job_id) else {
            return;
        };

        let now = Utc::now();
        let started_at = match &job.status {
            JobStatus::Running { started_at, .. } => *started_at,
            _ => now,
        };
        let duration_ms = u64::try_from((now - started_at).num_milliseconds()).unwrap_or(0);

        job.status = JobStatus::Completed {
            started_at,
            completed_at: now,
            result: result.clone(),
        };
        self.finish(job).await;
        self.queue.stats.completed += 1;

        self.broadcast(JobEvent::JobCompleted {
            job_id,
            queue: self.queue.name.clone(),
            result,
            duration_ms,
            timestamp: now,
        });
        self.refresh_stats();
    }

    async fn fail(&mut self, job_id: JobId, error: String) {
        let Some(mut job) = self.running.remove(&job_id) else {
            return;
        };

        let now = Utc::now();
        let started_at = match &job.status {
            JobStatus::Running { started_at, .. } => *started_at,
            _ => now,
        };
        let attempts = job.attempts;
        let will_retry = attempts <= job.max_retries;

        if will_retry {
            job.status = JobStatus::Pending;
            match JobRepository::save(&job).await {
                Ok(saved) => job = saved,
                Err(e) => tracing::warn!("Failed to mark job {} pending: {}", job_id, e),
            }
            self.jobs.insert(job_id, job.clone());
            self.pending.push_back(job);
        } else {
            job.status = JobStatus::Failed {
                started_at,
                failed_at: now,
                error: error.clone(),
                attempts,
            };
            self.finish(job).await;
            self.queue.stats.failed += 1;
        }

        self.broadcast(JobEvent::JobFailed {
            job_id,
            queue: self.queue.name.clone(),
            error,
            attempts,
            will_retry,
            timestamp: now,
        });
        if will_retry {
            self.broadcast(JobEvent::JobRetrying {
                job_id,
                queue: self.queue.name.clone(),
                attempt: attempts + 1,
                timestamp: now,
            });
        }
        self.refresh_stats();
    }
}

/// Queue actor that manages a single queue.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        mut args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            queue = %args.queue.name,
            concurrency = args.queue.policy.concurrency,
            prefetch = args.queue.policy.prefetch_multiplier,
            exclusive = args.queue.policy.exclusive,
            "Starting queue actor"
        );
        args.adopt().await;
        Ok(args)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue { job, reply } => {
                let mut job = *job;
                job.queue = state.queue.name.clone();

                if let Err(e) = JobRepository::create(&job).await {
                    let _ = reply.send(Err(format!("Failed to persist job: {}", e)));
                    return Ok(());
                }

                state.jobs.insert(job.id, job.clone());
                state.pending.push_back(job.clone());

                state.broadcast(JobEvent::JobEnqueued {
                    job: job.clone(),
                    timestamp: Utc::now(),
                });
                state.refresh_stats();

                let _ = reply.send(Ok(job));
            }

            QueueMessage::RequestJob { worker_id, reply } => {
                if !state.has_capacity() {
                    let _ = reply.send(None);
                    return Ok(());
                }

                let now = Utc::now();
                let job = loop {
                    let Some(mut job) = state.pending.pop_front() else {
                        state.refresh_stats();
                        let _ = reply.send(None);
                        return Ok(());
                    };

                    let previous = (job.status.clone(), job.attempts);
                    job.attempts = job.attempts.saturating_add(1);
                    job.status = JobStatus::Running {
                        started_at: now,
                        worker_id: worker_id.clone(),
                    };

                    match JobRepository::claim(&job).await {
                        Ok(Some(claimed)) => break claimed,
                        Ok(None) => {
                            tracing::debug!(job_id = %job.id, "Job was claimed by another worker");
                            state.jobs.remove(&job.id);
                        }
                        Err(e) => {
                            tracing::warn!("Failed to mark job {} running: {}", job.id, e);
                            (job.status, job.attempts) = previous;
                            state.pending.push_front(job);
                            let _ = reply.send(None);
                            return Ok(());
                        }
                    }
                };

                state.jobs.insert(job.id, job.clone());
                state.running.insert(job.id, job.clone());

                state.broadcast(JobEvent::JobStarted {
                    job_id: job.id,
                    queue: state.queue.name.clone(),
                    worker_id,
                    timestamp: now,
                });
                state.refresh_stats();

                let _ = reply.send(Some(job));
            }

            QueueMessage::JobCompleted {
                job_id,
                worker_id: _,
                result,
                reply,
            } => {
                state.complete(job_id, result).await;
                let _ = reply.send(());
            }

            QueueMessage::JobFailed {
                job_id,
                worker_id,
                error,
                reply,
            } => {
                tracing::warn!(%job_id, %worker_id, "Job failed: {}", error);
                state.fail(job_id, error).await;
                let _ = reply.send(());
            }

            QueueMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.jobs.get(&job_id).cloned());
            }

            QueueMessage::GetInfo { reply } => {
                let _ = reply.send(state.queue.clone());
            }

            QueueMessage::Shutdown => {
                tracing::info!("Shutting down queue: {}", state.queue.name);
                myself.stop(None);
            }

            QueueMessage::Tick => {
                let now = Utc::now();
                state
                    .jobs
                    .retain(|_, job| job.result_expires_at.is_none_or(|expires| expires > now));
                state.adopt().await;
            }
        }

        Ok(())
    }
}
