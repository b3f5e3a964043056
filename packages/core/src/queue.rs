//! Queue domain types and the worker execution policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(pub Ulid);

impl QueueId {
    /// Create a new unique queue ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a queue ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised when a worker policy is not admissible.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("prefetch multiplier must be at least 1")]
    ZeroPrefetch,
    #[error("exclusive queues require concurrency 1 and prefetch 1 (got concurrency {concurrency}, prefetch {prefetch})")]
    ExclusiveNotSingle { concurrency: u32, prefetch: u32 },
}

/// How the workers attached to a queue consume jobs.
///
/// Queues whose job bodies drive the native rendering/analysis library MUST
/// use [`WorkerPolicy::single_threaded`]: that library keeps process-global
/// state that is not thread safe, and running two jobs at once inside one
/// process corrupts it silently instead of failing. `exclusive = true` makes
/// this mandatory and [`WorkerPolicy::validate`] rejects anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPolicy {
    /// Max jobs executing at once for this queue in one process.
    pub concurrency: u32,
    /// Jobs a worker may reserve per execution slot. 1 = no look-ahead.
    pub prefetch_multiplier: u32,
    /// Job bodies use the process-wide non-thread-safe native library.
    pub exclusive: bool,
    /// Default timeout for jobs in this queue (seconds).
    pub timeout_secs: u64,
    /// Default max retries for jobs in this queue.
    pub max_retries: u32,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            concurrency: 4,
            prefetch_multiplier: 1,
            exclusive: false,
            timeout_secs: 1800,
            max_retries: 0,
        }
    }
}

impl WorkerPolicy {
    /// One job at a time, nothing reserved ahead of completion.
    pub fn single_threaded() -> Self {
        Self {
            concurrency: 1,
            prefetch_multiplier: 1,
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Maximum number of jobs claimed (running or reserved) at once.
    pub fn reservation_limit(&self) -> usize {
        (self.concurrency as usize).saturating_mul(self.prefetch_multiplier as usize)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.concurrency == 0 {
            return Err(PolicyError::ZeroConcurrency);
        }
        if self.prefetch_multiplier == 0 {
            return Err(PolicyError::ZeroPrefetch);
        }
        if self.exclusive && (self.concurrency != 1 || self.prefetch_multiplier != 1) {
            return Err(PolicyError::ExclusiveNotSingle {
                concurrency: self.concurrency,
                prefetch: self.prefetch_multiplier,
            });
        }
        Ok(())
    }
}

/// Statistics for a queue's current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Number of pending jobs.
    pub pending: u64,
    /// Number of running jobs.
    pub running: u64,
    /// Number of completed jobs (since start).
    pub completed: u64,
    /// Number of failed jobs (since start).
    pub failed: u64,
}

/// A named channel that workers subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub id: QueueId,
    /// Queue name, unique across the system.
    pub name: String,
    pub policy: WorkerPolicy,
    pub stats: QueueStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Queue {
    /// Create a new queue with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: QueueId::new(),
            name: name.into(),
            policy: WorkerPolicy::default(),
            stats: QueueStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the worker policy for this queue.
    pub fn with_policy(mut self, policy: WorkerPolicy) -> Self {
        self.policy = policy;
        self
    }
}
