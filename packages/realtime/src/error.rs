use db::DbError;
use realtime_core::{RoutingError, TransitionError};
use storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("store error: {0}")]
    Db(#[from] DbError),

    #[error("artifact storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The job could not be handed to the queue backend.
    #[error("dispatch of {job_type} failed after {attempts} attempt(s): {reason}")]
    Dispatch {
        job_type: String,
        attempts: u32,
        reason: String,
    },

    #[error("queue backend unavailable: {0}")]
    Backend(String),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// The failure came from talking to the store or the queue backend, and
    /// trying again later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Db(e) => e.is_communication(),
            PipelineError::Dispatch { .. } | PipelineError::Backend(_) => true,
            _ => false,
        }
    }
}
