//! Core domain types for the realtime hazard pipeline.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and JobResult for work handed to the queue backend
//! - Queue and WorkerPolicy for queue consumption rules
//! - RoutingTable mapping job types to queues
//! - JobRecord for the persisted per-event processing row
//! - Events for backend state changes

mod events;
mod job;
mod queue;
pub mod record;
pub mod routing;

pub use events::JobEvent;
pub use job::{Job, JobId, JobResult, JobStatus, LEASE_GRACE_SECS};
pub use queue::{PolicyError, Queue, QueueId, QueueStats, WorkerPolicy};
pub use record::{
    JobRecord, Observation, RecordId, RecordState, Stage, Subject, SubjectKind, TaskStatus,
    TransitionError,
};
pub use routing::{Route, RoutingError, RoutingTable, job_types, queues};
