//! Polling for job outcomes.
//!
//! [`Poller::wait`] sleeps between polls and always returns: with the job's
//! payload, with its failure, with `NotFound` for a record that does not
//! exist, or with a retryable `TimedOut` or `CommunicationError`. A timeout never cancels the job; dropping the
//! future only abandons the wait.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use db::DbError;
use db::repositories::{JobRepository, RecordRepository};
use realtime_core::{JobId, JobResult, Observation, RecordId, Stage, TaskStatus};
use tokio::time::Instant;

use crate::backoff::RetryPolicy;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("status source unreachable: {0}")]
    Unreachable(String),
    #[error("no such record: {0}")]
    UnknownRecord(RecordId),
}

impl From<DbError> for SourceError {
    fn from(e: DbError) -> Self {
        SourceError::Unreachable(e.to_string())
    }
}

/// What to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollTarget {
    /// A job handle (`task_id`).
    Task(JobId),
    /// One stage of a record.
    Record(RecordId, Stage),
}

/// Where observations come from.
pub trait StatusSource: Send + Sync {
    fn observe(
        &self,
        target: PollTarget,
    ) -> impl Future<Output = Result<Observation, SourceError>> + Send;
}

/// Reads the record store first and the job backend second.
///
/// Once a record stage is terminal the record is authoritative; before that
/// the backend is fresher. Unknown jobs read as `PENDING`, the way a queue
/// backend reports a handle it has not seen.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStatusSource;

impl StoreStatusSource {
    async fn backend(task_id: JobId) -> Result<Observation, SourceError> {
        match JobRepository::get(task_id).await {
            Ok(job) => Ok(Observation::from_job(&job)),
            Err(DbError::NotFound(_)) => Ok(Observation::pending()),
            Err(e) => Err(e.into()),
        }
    }
}

impl StatusSource for StoreStatusSource {
    async fn observe(&self, target: PollTarget) -> Result<Observation, SourceError> {
        match target {
            PollTarget::Task(task_id) => {
                if let Some((record, stage)) = RecordRepository::find_by_task(task_id).await?
                    && let Some(observed) = record.observation(stage)
                    && observed.is_terminal()
                {
                    return Ok(observed);
                }
                Self::backend(task_id).await
            }
            PollTarget::Record(id, stage) => {
                let record = match RecordRepository::get(id).await {
                    Ok(record) => record,
                    Err(DbError::NotFound(_)) => return Err(SourceError::UnknownRecord(id)),
                    Err(e) => return Err(e.into()),
                };
                if let Some(observed) = record.observation(stage)
                    && observed.is_terminal()
                {
                    return Ok(observed);
                }
                match record.task_id_for(stage) {
                    Some(task_id) => Self::backend(task_id).await,
                    None => Ok(Observation::pending()),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between polls while the job is not terminal.
    pub interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
    /// Give up after this many polls, if set.
    pub max_attempts: Option<u32>,
    /// Source errors tolerated in a row before giving up.
    pub max_consecutive_errors: u32,
    /// Delay growth between polls that failed.
    pub error_backoff: RetryPolicy,
    /// Terminal observations kept per poller; the oldest go first.
    pub max_settled: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            max_attempts: None,
            max_consecutive_errors: 5,
            error_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
            max_settled: 1024,
        }
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Success(JobResult),
    Failure(String),
    /// The record polled for does not exist.
    NotFound(String),
    /// Still not terminal when the wait ran out. The job keeps running.
    TimedOut { last_status: Option<TaskStatus> },
    /// The source failed too many times in a row.
    CommunicationError { attempts: u32, last_error: String },
}

impl PollOutcome {
    /// Waiting again later may produce a terminal outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PollOutcome::TimedOut { .. } | PollOutcome::CommunicationError { .. }
        )
    }

    fn terminal(observed: Observation) -> Self {
        match observed.status {
            TaskStatus::Success => PollOutcome::Success(observed.result.unwrap_or_else(JobResult::success)),
            _ => PollOutcome::Failure(observed.error.unwrap_or_else(|| "job failed".to_string())),
        }
    }
}

/// Terminal observations in the order they settled.
#[derive(Default)]
struct Settled {
    observed: HashMap<PollTarget, Observation>,
    order: VecDeque<PollTarget>,
}

pub struct Poller<S> {
    source: S,
    config: PollConfig,
    /// Once a target is terminal it stays that way while it is remembered.
    settled: Mutex<Settled>,
}

impl<S: StatusSource> Poller<S> {
    pub fn new(source: S, config: PollConfig) -> Self {
        Self {
            source,
            config,
            settled: Mutex::new(Settled::default()),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    fn cached(&self, target: PollTarget) -> Option<Observation> {
        match self.settled.lock() {
            Ok(settled) => settled.observed.get(&target).cloned(),
            Err(poisoned) => poisoned.into_inner().observed.get(&target).cloned(),
        }
    }

    fn remember(&self, target: PollTarget, observed: &Observation) {
        let mut settled = match self.settled.lock() {
            Ok(settled) => settled,
            Err(poisoned) => poisoned.into_inner(),
        };
        if settled.observed.contains_key(&target) {
            return;
        }
        settled.observed.insert(target, observed.clone());
        settled.order.push_back(target);
        while settled.order.len() > self.config.max_settled {
            if let Some(oldest) = settled.order.pop_front() {
                settled.observed.remove(&oldest);
            }
        }
    }

    /// Current status of `target` and, once terminal, its payload or
    /// diagnostic.
    pub async fn poll_once(&self, target: PollTarget) -> Result<Observation, SourceError> {
        if let Some(observed) = self.cached(target) {
            return Ok(observed);
        }
        let observed = self.source.observe(target).await?;
        if observed.is_terminal() {
            self.remember(target, &observed);
            // a concurrent poll may have settled first
            return Ok(self.cached(target).unwrap_or(observed));
        }
        Ok(observed)
    }

    /// Poll until `target` is terminal or the wait runs out.
    pub async fn wait(&self, target: PollTarget) -> PollOutcome {
        let deadline = Instant::now() + self.config.timeout;
        let mut attempts = 0u32;
        let mut consecutive_errors = 0u32;
        let mut last_status = None;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let delay = match tokio::time::timeout(remaining, self.poll_once(target)).await {
                Err(_) => return PollOutcome::TimedOut { last_status },
                Ok(Ok(observed)) if observed.is_terminal() => return PollOutcome::terminal(observed),
                Ok(Ok(observed)) => {
                    consecutive_errors = 0;
                    last_status = Some(observed.status);
                    self.config.interval
                }
                Ok(Err(e @ SourceError::UnknownRecord(_))) => return PollOutcome::NotFound(e.to_string()),
                Ok(Err(e)) => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.config.max_consecutive_errors {
                        tracing::warn!(?target, attempts, error = %e, "Giving up polling");
                        return PollOutcome::CommunicationError {
                            attempts,
                            last_error: e.to_string(),
                        };
                    }
                    tracing::debug!(?target, attempts, error = %e, "Poll failed");
                    self.config.error_backoff.delay_after(consecutive_errors)
                }
            };

            if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                return PollOutcome::TimedOut { last_status };
            }
            let now = Instant::now();
            if now >= deadline {
                return PollOutcome::TimedOut { last_status };
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted observations; the last one repeats forever.
    struct Scripted {
        script: Mutex<VecDeque<Result<Observation, SourceError>>>,
        calls: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<Observation, SourceError>>) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let source = Self {
                script: Mutex::new(script.into()),
                calls: calls.clone(),
            };
            (source, calls)
        }
    }

    impl StatusSource for Scripted {
        async fn observe(&self, _target: PollTarget) -> Result<Observation, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    fn config() -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            max_attempts: None,
            max_consecutive_errors: 2,
            error_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(4),
                multiplier: 2.0,
            },
            max_settled: 16,
        }
    }

    fn target() -> PollTarget {
        PollTarget::Task(JobId::new())
    }

    fn success() -> Observation {
        Observation {
            status: TaskStatus::Success,
            result: Some(JobResult::success().with("hazard_path", "/tmp/hazard.tif")),
            error: None,
        }
    }

    fn down() -> Result<Observation, SourceError> {
        Err(SourceError::Unreachable("connection refused".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_payload_once_terminal() {
        let (source, calls) = Scripted::new(vec![
            Ok(Observation::pending()),
            Ok(Observation::status(TaskStatus::Started)),
            Ok(success()),
        ]);
        let poller = Poller::new(source, config());
        let started = Instant::now();

        let outcome = poller.wait(target()).await;
        assert_eq!(
            outcome,
            PollOutcome::Success(JobResult::success().with("hazard_path", "/tmp/hazard.tif"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_carries_the_diagnostic() {
        let failed = Observation {
            status: TaskStatus::Failure,
            result: None,
            error: Some("grid.xml is not a shake grid".into()),
        };
        let (source, _) = Scripted::new(vec![Ok(failed)]);
        let outcome = Poller::new(source, config()).wait(target()).await;
        assert_eq!(outcome, PollOutcome::Failure("grid.xml is not a shake grid".into()));
        assert!(!outcome.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_distinctly_and_keeps_last_status() {
        let (source, calls) = Scripted::new(vec![Ok(Observation::status(TaskStatus::Started))]);
        let poller = Poller::new(source, config());
        let started = Instant::now();

        let outcome = poller.wait(target()).await;
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                last_status: Some(TaskStatus::Started)
            }
        );
        assert!(outcome.is_retryable());
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        // polls at 0, 5, ..., 60
        assert_eq!(calls.load(Ordering::SeqCst), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn max_attempts_bounds_the_wait() {
        let (source, calls) = Scripted::new(vec![Ok(Observation::pending())]);
        let poller = Poller::new(
            source,
            PollConfig {
                max_attempts: Some(3),
                ..config()
            },
        );
        let outcome = poller.wait(target()).await;
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                last_status: Some(TaskStatus::Pending)
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_with_backoff() {
        let (source, calls) = Scripted::new(vec![down(), down(), Ok(success())]);
        let poller = Poller::new(source, config());
        let started = Instant::now();

        let outcome = poller.wait(target()).await;
        assert!(matches!(outcome, PollOutcome::Success(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s then 2s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_errors_are_a_communication_error() {
        let (source, _) = Scripted::new(vec![Ok(Observation::pending()), down()]);
        let outcome = Poller::new(source, config()).wait(target()).await;
        assert_eq!(
            outcome,
            PollOutcome::CommunicationError {
                attempts: 4,
                last_error: "status source unreachable: connection refused".into(),
            }
        );
        assert!(outcome.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_observations_never_regress() {
        let (source, calls) = Scripted::new(vec![Ok(success()), Ok(Observation::pending())]);
        let poller = Poller::new(source, config());
        let target = target();

        let first = poller.poll_once(target).await.unwrap();
        assert_eq!(first.status, TaskStatus::Success);
        let second = poller.poll_once(target).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // other targets are still read from the source
        let other = poller.poll_once(PollTarget::Task(JobId::new())).await.unwrap();
        assert_eq!(other.status, TaskStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_cache_keeps_only_the_newest_targets() {
        let (source, calls) = Scripted::new(vec![Ok(success())]);
        let poller = Poller::new(
            source,
            PollConfig {
                max_settled: 2,
                ..config()
            },
        );
        let targets: Vec<PollTarget> = (0..3).map(|_| target()).collect();
        for target in &targets {
            poller.poll_once(*target).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // the two newest are answered from memory
        poller.poll_once(targets[1]).await.unwrap();
        poller.poll_once(targets[2]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // the oldest was evicted and is read again
        let again = poller.poll_once(targets[0]).await.unwrap();
        assert_eq!(again.status, TaskStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let settled = poller.settled.lock().unwrap();
        assert_eq!(settled.observed.len(), 2);
        assert_eq!(settled.order.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_record_is_not_found_rather_than_failed() {
        let id = RecordId::new();
        let (source, calls) = Scripted::new(vec![Err(SourceError::UnknownRecord(id))]);
        let poller = Poller::new(source, config());
        let started = Instant::now();

        let outcome = poller.wait(PollTarget::Record(id, Stage::Hazard)).await;
        assert_eq!(outcome, PollOutcome::NotFound(format!("no such record: {id}")));
        assert!(!outcome.is_retryable());
        assert!(!matches!(outcome, PollOutcome::Failure(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
