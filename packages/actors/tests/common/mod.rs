#![allow(dead_code)]

use std::sync::LazyLock;
use std::time::Duration;

use actors::{
    ActorRef, JobHandlerRegistry, SupervisorConfig, SupervisorMessage, start_supervisor,
};
use db::{DbConfig, DbError};
use realtime_core::{Job, JobEvent, JobId, Queue, WorkerPolicy};
use tokio::sync::{Mutex, MutexGuard, broadcast};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Owns the embedded database's background tasks. Every `#[tokio::test]` gets
/// its own runtime, so the shared connection is opened here instead.
static DB_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("test-db")
        .enable_all()
        .build()
        .expect("database runtime")
});

pub async fn setup_db() -> Result<MutexGuard<'static, ()>, DbError> {
    let guard = TEST_LOCK.lock().await;
    DB_RUNTIME
        .spawn(db::init(DbConfig::memory()))
        .await
        .expect("database init task")?;
    let db_conn = db::get_db()?;
    db_conn
        .query("DELETE job_history; DELETE job; DELETE queue; DELETE job_record;")
        .await?
        .check()?;
    Ok(guard)
}

/// Number of archived outcomes stored for a job.
pub async fn history_len(job_id: JobId) -> Result<usize, DbError> {
    let mut response = db::get_db()?
        .query("SELECT count() AS count FROM job_history WHERE job_id = $job_id GROUP ALL")
        .bind(("job_id", job_id.to_string()))
        .await?;
    let count: Option<i64> = response.take((0, "count"))?;
    Ok(count.map_or(0, |n| n as usize))
}

pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        worker_poll_interval: Duration::from_millis(10),
        ..SupervisorConfig::default()
    }
}

pub async fn start(
    handlers: JobHandlerRegistry,
) -> (ActorRef<SupervisorMessage>, broadcast::Receiver<JobEvent>) {
    let (supervisor, _) = start_supervisor(handlers, fast_config())
        .await
        .expect("supervisor starts");
    let (tx, rx) = broadcast::channel(1024);
    supervisor
        .send_message(SupervisorMessage::Subscribe { sender: tx })
        .expect("subscribe");
    (supervisor, rx)
}

pub async fn ensure_queue(
    supervisor: &ActorRef<SupervisorMessage>,
    name: &str,
    policy: WorkerPolicy,
) -> Result<Queue, String> {
    let (tx, rx) = actors::concurrency::oneshot();
    supervisor
        .send_message(SupervisorMessage::EnsureQueue {
            name: name.to_string(),
            policy,
            reply: tx.into(),
        })
        .map_err(|e| e.to_string())?;
    rx.await.map_err(|_| "no reply".to_string())?
}

pub async fn enqueue(supervisor: &ActorRef<SupervisorMessage>, job: Job) -> Result<Job, String> {
    let (tx, rx) = actors::concurrency::oneshot();
    supervisor
        .send_message(SupervisorMessage::EnqueueJob {
            queue: job.queue.clone(),
            job,
            reply: tx.into(),
        })
        .map_err(|e| e.to_string())?;
    rx.await.map_err(|_| "no reply".to_string())?
}

/// Collect events until `count` jobs reached a final outcome.
pub async fn until_terminal(rx: &mut broadcast::Receiver<JobEvent>, count: usize) -> Vec<JobEvent> {
    let mut events = Vec::new();
    let mut terminal = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while terminal < count {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("jobs finish in time")
            .expect("event stream open");
        if event.is_terminal() {
            terminal += 1;
        }
        events.push(event);
    }
    events
}

pub fn shutdown(supervisor: ActorRef<SupervisorMessage>) {
    let _ = supervisor.send_message(SupervisorMessage::Shutdown);
}
