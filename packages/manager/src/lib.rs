//! Job lifecycle manager.
//!
//! This crate drives jobs through their lifecycle and makes every change
//! durable before anyone is told about it.
//!
//! # Architecture
//!
//! - `Engine` - Owns the jobs, applies events and dispatches follow-up actions
//! - `BatchScheduler` - Groups eventlog writes into timed commit batches
//! - `AllocQueue` - Priority-ordered queue of jobs waiting for resources
//! - `JobManagerActor` - Serializes engine access and runs the commit pipeline
//!
//! # Usage
//!
//! ```ignore
//! use job_manager::{
//!     BroadcastBus, JobManagerArgs, ManagerConfig, SubmitRequest, start_job_manager,
//! };
//!
//! let bus = Arc::new(BroadcastBus::default());
//! let args = JobManagerArgs::new(ManagerConfig::default(), store, bus);
//! let (manager, handle) = start_job_manager(args).await?;
//!
//! // Returns once the submit entry is durable
//! manager.submit(SubmitRequest::new(JobId(1), 1000)).await?;
//! ```

mod action;
mod alloc;
mod batch;
mod bus;
mod config;
mod engine;
mod error;
mod jobtap;
mod links;
mod manager_actor;
mod memory_store;
mod messages;

pub use alloc::AllocQueue;
pub use batch::{
    BatchId, BatchScheduler, BatchTxn, Commit, CommitTimer, DeferredResponse, FinishedBatch,
    ManualCommit,
};
pub use bus::{BroadcastBus, BusError, BusFuture, EventBus, Published};
pub use config::ManagerConfig;
pub use engine::{
    AllocOutcome, Engine, EngineStats, PostFlags, QueuedPost, StartOutcome, SubmitRequest,
};
pub use error::{ManagerError, ManagerResult};
pub use jobtap::{
    FnPriority, HookContext, Jobtap, JobtapPlugin, PRIORITY_MAX, PRIORITY_MIN, PluginError,
    PluginRegistry, default_priority,
};
pub use links::{
    BroadcastJournal, Discard, ExecLink, Journal, LinkError, Links, SchedulerLink,
    SchedulerRequest, StartRequest, WaitNotice, WaitNotifier,
};
pub use manager_actor::{JobManagerActor, JobManagerArgs, JobManagerHandle, start_job_manager};
pub use memory_store::MemoryEventlogStore;
pub use messages::ManagerMessage;

// Re-export commonly used ractor types
pub use ractor::{Actor, ActorRef, RpcReplyPort};
