//! Message types for the job manager actor.

use job_core::{Context, Job, JobId};
use ractor::RpcReplyPort;

use crate::batch::BatchId;
use crate::bus::BusError;
use crate::engine::{AllocOutcome, EngineStats, PostFlags, StartOutcome, SubmitRequest};
use crate::error::ManagerError;

/// Messages for the JobManagerActor.
#[derive(Debug)]
pub enum ManagerMessage {
    /// Accept a new job. Replies once the submit entry is durable.
    Submit {
        request: SubmitRequest,
        reply: RpcReplyPort<Result<(), ManagerError>>,
    },

    /// Post an event. Replies once the entry is durable.
    Post {
        job_id: JobId,
        name: String,
        context: Option<Context>,
        flags: PostFlags,
        reply: RpcReplyPort<Result<(), ManagerError>>,
    },

    /// Scheduler answered an alloc request.
    AllocResponse { job_id: JobId, outcome: AllocOutcome },

    /// Execution service answered a start request.
    StartResponse { job_id: JobId, outcome: StartOutcome },

    /// Scheduler acknowledged a free request.
    FreeResponse { job_id: JobId },

    /// Get a job by ID.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<Job>>,
    },

    /// Get engine counters.
    Stats { reply: RpcReplyPort<EngineStats> },

    /// Reply once no job is active.
    WaitDrained { reply: RpcReplyPort<()> },

    /// Commit the open batch now.
    Flush,

    /// The commit timer of a batch fired.
    CommitTimer { batch: BatchId },

    /// The writer finished a batch.
    CommitDone { batch: BatchId },

    /// A transition publish was rejected.
    PublishFailed { error: BusError },

    /// Flush everything and stop.
    Shutdown {
        reply: RpcReplyPort<Result<(), ManagerError>>,
    },
}
