//! Worker actor for executing jobs.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use realtime_core::{Job, JobId};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::guard::{NativeLibraryGuard, NativeLibraryPermit};
use crate::handler::{HandlerResult, JobHandlerRegistry};
use crate::messages::{QueueMessage, WorkerMessage};

/// State for the worker actor.
pub struct WorkerActorState {
    pub worker_id: String,
    pub queue_name: String,
    /// Job claimed from the queue and not yet reported back.
    pub current_job: Option<JobId>,
    pub queue: ActorRef<QueueMessage>,
    pub handlers: Arc<JobHandlerRegistry>,
    /// Set for workers of exclusive queues.
    guard: Option<NativeLibraryGuard>,
    permit: Option<NativeLibraryPermit>,
    running: bool,
}

impl WorkerActorState {
    pub fn is_idle(&self) -> bool {
        self.current_job.is_none()
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub queue_name: String,
    pub queue: ActorRef<QueueMessage>,
    pub handlers: Arc<JobHandlerRegistry>,
    pub guard: Option<NativeLibraryGuard>,
    /// Delay between requests for work while idle.
    pub poll_interval: Duration,
}

/// How long a worker waits for its queue to store a job's outcome.
const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a job body, turning errors, panics and timeouts into a failure message.
async fn execute(handlers: &JobHandlerRegistry, job: &Job) -> HandlerResult {
    let Some(handler) = handlers.get(&job.job_type) else {
        return Err(format!("No handler for job type: {}", job.job_type));
    };

    let timeout = Duration::from_secs(job.timeout_secs);
    let body = AssertUnwindSafe(handler.handle(job)).catch_unwind();

    match tokio::time::timeout(timeout, body).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(format!("Job body panicked ({})", job.job_type)),
        Err(_) => Err(format!("Job timed out after {}s", job.timeout_secs)),
    }
}

/// Worker actor that executes jobs one at a time.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(worker = %args.worker_id, queue = %args.queue_name, "Starting worker");

        let ticker = myself.clone();
        let interval = args.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if ticker.send_message(WorkerMessage::Heartbeat).is_err() {
                    break;
                }
            }
        });

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            queue_name: args.queue_name,
            current_job: None,
            queue: args.queue,
            handlers: args.handlers,
            guard: args.guard,
            permit: None,
            running: true,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::ProcessJob { job } => {
                let job_id = job.id;
                let outcome = execute(&state.handlers, &job).await;
                let worker_id = state.worker_id.clone();

                // the permit is held until the outcome is stored, so the next
                // native job never starts while this one still reads as running
                let stored = ractor::rpc::call(
                    &state.queue,
                    move |reply| match outcome {
                        Ok(result) => QueueMessage::JobCompleted {
                            job_id,
                            worker_id,
                            result,
                            reply,
                        },
                        Err(error) => QueueMessage::JobFailed {
                            job_id,
                            worker_id,
                            error,
                            reply,
                        },
                    },
                    Some(REPORT_TIMEOUT),
                )
                .await;
                match stored {
                    Ok(ractor::rpc::CallResult::Success(())) => {}
                    Ok(_) => tracing::warn!(%job_id, "Queue did not confirm the job outcome"),
                    Err(e) => tracing::warn!(%job_id, "Failed to report job outcome: {}", e),
                }

                state.current_job = None;
                state.permit = None;
            }

            WorkerMessage::IsIdle { reply } => {
                let _ = reply.send(state.is_idle());
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                state.running = false;
                myself.stop(None);
            }

            WorkerMessage::Heartbeat => {
                if !state.running {
                    myself.stop(None);
                    return Ok(());
                }
                if !state.is_idle() {
                    return Ok(());
                }

                let permit = match &state.guard {
                    Some(guard) => match guard.try_acquire() {
                        Some(permit) => Some(permit),
                        None => return Ok(()),
                    },
                    None => None,
                };

                let result = ractor::rpc::call(
                    &state.queue,
                    |reply| QueueMessage::RequestJob {
                        worker_id: state.worker_id.clone(),
                        reply,
                    },
                    Some(Duration::from_secs(5)),
                )
                .await;

                if let Ok(ractor::rpc::CallResult::Success(Some(job))) = result {
                    // busy from the moment of the claim, so a queued heartbeat
                    // cannot reserve a second job
                    state.current_job = Some(job.id);
                    state.permit = permit;
                    myself.send_message(WorkerMessage::ProcessJob { job: Box::new(job) })?;
                }
            }
        }

        Ok(())
    }
}
