//! Repository implementations for database operations.

mod job_repo;
mod queue_repo;
mod record_repo;

pub use job_repo::JobRepository;
pub use queue_repo::QueueRepository;
pub use record_repo::RecordRepository;
