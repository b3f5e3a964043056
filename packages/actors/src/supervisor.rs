//! Supervisor actor for managing all queues and workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::repositories::{JobRepository, QueueRepository};
use realtime_core::{JobEvent, Queue};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::guard::NativeLibraryGuard;
use crate::handler::JobHandlerRegistry;
use crate::messages::{QueueMessage, SupervisorMessage, WorkerMessage};
use crate::queue_actor::{QueueActor, QueueActorState};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long terminal job results stay queryable.
    pub result_expires: chrono::Duration,
    /// Period of the housekeeping tick.
    pub housekeeping_interval: Duration,
    /// Delay between requests for work while a worker is idle.
    pub worker_poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            result_expires: chrono::Duration::hours(24),
            housekeeping_interval: Duration::from_secs(30),
            worker_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub handlers: JobHandlerRegistry,
    pub config: SupervisorConfig,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    /// Queue actors by queue name.
    pub queues: HashMap<String, ActorRef<QueueMessage>>,
    workers: Vec<ActorRef<WorkerMessage>>,
    pub event_tx: broadcast::Sender<JobEvent>,
    pub handlers: Arc<JobHandlerRegistry>,
    /// Shared by the workers of every exclusive queue.
    guard: NativeLibraryGuard,
    config: SupervisorConfig,
    /// Tells this supervisor's workers apart from other processes' ones.
    instance: String,
    worker_counter: u64,
}

impl SupervisorState {
    pub fn new(args: SupervisorArgs) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            queues: HashMap::new(),
            workers: Vec::new(),
            event_tx,
            handlers: Arc::new(args.handlers),
            guard: NativeLibraryGuard::new(),
            config: args.config,
            instance: Ulid::new().to_string(),
            worker_counter: 0,
        }
    }

    /// Unique across every process sharing the job store.
    fn next_worker_id(&mut self) -> String {
        self.worker_counter += 1;
        format!("worker-{}-{}", self.instance, self.worker_counter)
    }
}

async fn queue_info(queue_ref: &ActorRef<QueueMessage>) -> Option<Queue> {
    let (tx, rx) = ractor::concurrency::oneshot();
    queue_ref
        .send_message(QueueMessage::GetInfo { reply: tx.into() })
        .ok()?;
    rx.await.ok()
}

async fn spawn_queue_actor(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
    queue: Queue,
) -> Result<ActorRef<QueueMessage>, ActorProcessingErr> {
    let queue_state = QueueActorState::new(queue.clone())
        .with_event_tx(state.event_tx.clone())
        .with_result_expires(state.config.result_expires);

    let (actor, _handle) = Actor::spawn_linked(
        Some(format!("queue-{}-{}", queue.id, state.instance)),
        QueueActor,
        queue_state,
        myself.get_cell(),
    )
    .await
    .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn queue: {}", e)))?;

    let guard = queue.policy.exclusive.then(|| state.guard.clone());
    for _ in 0..queue.policy.concurrency {
        let args = WorkerArgs {
            worker_id: state.next_worker_id(),
            queue_name: queue.name.clone(),
            queue: actor.clone(),
            handlers: state.handlers.clone(),
            guard: guard.clone(),
            poll_interval: state.config.worker_poll_interval,
        };

        match Actor::spawn_linked(None, WorkerActor, args, myself.get_cell()).await {
            Ok((worker, _)) => state.workers.push(worker),
            Err(e) => tracing::error!(queue = %queue.name, "Failed to spawn worker: {}", e),
        }
    }

    state.queues.insert(queue.name.clone(), actor.clone());

    Ok(actor)
}

/// Supervisor actor that manages all queues.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(handlers = ?args.handlers.job_types(), "Starting queue supervisor");

        let ticker = myself.clone();
        let period = args.config.housekeeping_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if ticker.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(SupervisorState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::EnsureQueue {
                name,
                policy,
                reply,
            } => {
                if let Err(e) = policy.validate() {
                    let _ = reply.send(Err(format!("Invalid policy for queue '{}': {}", name, e)));
                    return Ok(());
                }

                if let Some(queue_ref) = state.queues.get(&name) {
                    let info = queue_info(queue_ref).await;
                    let _ = reply.send(info.ok_or_else(|| format!("Queue '{}' is not responding", name)));
                    return Ok(());
                }

                let queue = match QueueRepository::ensure(&name, &policy).await {
                    Ok(queue) => queue,
                    Err(e) => {
                        let _ = reply.send(Err(format!("Failed to register queue: {}", e)));
                        return Ok(());
                    }
                };

                if let Err(e) = spawn_queue_actor(&myself, state, queue.clone()).await {
                    let _ = reply.send(Err(format!("Failed to spawn queue: {}", e)));
                    return Ok(());
                }

                let _ = state.event_tx.send(JobEvent::QueueCreated {
                    queue: queue.clone(),
                    timestamp: Utc::now(),
                });

                let _ = reply.send(Ok(queue));
            }

            SupervisorMessage::EnqueueJob { queue, job, reply } => {
                let Some(queue_ref) = state.queues.get(&queue) else {
                    let _ = reply.send(Err(format!("Queue '{}' is not registered", queue)));
                    return Ok(());
                };

                let (tx, rx) = ractor::concurrency::oneshot();
                queue_ref.send_message(QueueMessage::Enqueue {
                    job: Box::new(job),
                    reply: tx.into(),
                })?;
                match rx.await {
                    Ok(result) => {
                        let _ = reply.send(result);
                    }
                    Err(_) => {
                        let _ = reply.send(Err("Failed to enqueue job".into()));
                    }
                }
            }

            SupervisorMessage::GetJob { job_id, reply } => {
                for queue_ref in state.queues.values() {
                    let (tx, rx) = ractor::concurrency::oneshot();
                    if queue_ref
                        .send_message(QueueMessage::GetJob {
                            job_id,
                            reply: tx.into(),
                        })
                        .is_ok()
                        && let Ok(Some(job)) = rx.await
                    {
                        let _ = reply.send(Some(job));
                        return Ok(());
                    }
                }
                let _ = reply.send(JobRepository::get(job_id).await.ok());
            }

            SupervisorMessage::Subscribe { sender } => {
                let mut rx = state.event_tx.subscribe();
                tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(event) => {
                                if sender.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "Event subscriber lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                for worker in &state.workers {
                    let _ = worker.send_message(WorkerMessage::Shutdown);
                }
                for queue_ref in state.queues.values() {
                    let _ = queue_ref.send_message(QueueMessage::Shutdown);
                }
                myself.stop(None);
            }

            SupervisorMessage::Tick => {
                match JobRepository::purge_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "Purged expired job results"),
                    Err(e) => tracing::warn!("Failed to purge expired jobs: {}", e),
                }
                for queue_ref in state.queues.values() {
                    let _ = queue_ref.send_message(QueueMessage::Tick);
                }
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::debug!(
                    "Child actor {} terminated: {:?}",
                    cell.get_name().unwrap_or_default(),
                    reason
                );
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                tracing::error!(
                    "Child actor {} failed: {}",
                    cell.get_name().unwrap_or_default(),
                    error
                );
            }
            _ => {}
        }
        Ok(())
    }
}

/// Start the supervisor with the given handler registry.
pub async fn start_supervisor(
    handlers: JobHandlerRegistry,
    config: SupervisorConfig,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    Actor::spawn(None, Supervisor, SupervisorArgs { handlers, config }).await
}
