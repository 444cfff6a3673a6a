//! Manager error type.

use job_core::{FsmError, JobId, StoreError};
use thiserror::Error;

use crate::bus::BusError;
use crate::links::LinkError;

/// Result type for engine operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

/// Errors returned by the lifecycle engine and its actor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("Job {0} has not been submitted")]
    NotReady(JobId),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Side-effect request failed: {0}")]
    Link(#[from] LinkError),

    #[error("Eventlog commit failed: {0}")]
    StoreFailure(#[from] StoreError),

    #[error("Publish failed: {0}")]
    PublishFailure(#[from] BusError),

    #[error("Actor error: {0}")]
    Actor(String),
}
