//! Realtime hazard pipeline.
//!
//! Ties the queue backend (`actors`), the store (`db`) and the artifact
//! storage (`storage`) together:
//!
//! - `ingest` - turns ash forecasts and shake grids into records and jobs
//! - `watcher` - picks up shake grids dropped in the monitored directory
//! - `dispatch` - routes jobs to their queue
//! - `tasks` - the job bodies run by the workers
//! - `tracker` / `reconcile` - keep records in step with the backend
//! - `poller` - bounded waiting for a job's outcome
//!
//! # Usage
//!
//! ```ignore
//! let pipeline = Pipeline::start(PipelineConfig::from_env()?).await?;
//! let submission = pipeline.submit_ash(event).await?;
//! let task_id = submission.record.task_id.unwrap();
//! match pipeline.poller().wait(PollTarget::Task(task_id)).await {
//!     PollOutcome::Success(result) => println!("{:?}", result.hazard_path()),
//!     other => println!("{other:?}"),
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod poller;
pub mod reconcile;
pub mod tasks;
pub mod tracker;
pub mod watcher;

pub use backoff::{RetryError, RetryPolicy, retry};
pub use config::PipelineConfig;
pub use dispatch::Dispatcher;
pub use error::PipelineError;
pub use ingest::{AnalysisRequest, AshEvent, Ingestor, ShakeEvent, Submission};
pub use pipeline::Pipeline;
pub use poller::{PollConfig, PollOutcome, PollTarget, Poller, SourceError, StatusSource, StoreStatusSource};
pub use reconcile::{FailureAlert, ReconcileReport, Reconciler};
pub use tasks::{ArtifactProcessor, HazardProcessor, ProcessFuture, TaskContext};
pub use tracker::CompletionTracker;
pub use watcher::ShakeDirWatcher;
