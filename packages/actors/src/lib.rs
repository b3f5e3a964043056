//! Actor system forming the in-process queue backend.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor that starts queue actors and their workers
//! - `QueueActor` - Owns one named queue: FIFO pending jobs, claims, outcomes
//! - `WorkerActor` - Executes one job at a time from its queue
//!
//! Every state change is written to the job store before it is broadcast.
//!
//! # Usage
//!
//! ```ignore
//! use actors::{SupervisorConfig, SupervisorMessage, start_supervisor};
//!
//! let (supervisor, handle) = start_supervisor(handlers, SupervisorConfig::default()).await?;
//! supervisor.send_message(SupervisorMessage::EnsureQueue { ... })?;
//! ```

mod guard;
mod handler;
mod messages;
mod queue_actor;
mod supervisor;
mod worker_actor;

pub use guard::{NativeLibraryGuard, NativeLibraryPermit};
pub use handler::{FnHandler, HandlerFuture, HandlerResult, JobHandler, JobHandlerRegistry};
pub use messages::{QueueMessage, SupervisorMessage, WorkerMessage};
pub use queue_actor::{QueueActor, QueueActorState};
pub use supervisor::{Supervisor, SupervisorArgs, SupervisorConfig, SupervisorState, start_supervisor};
pub use worker_actor::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
