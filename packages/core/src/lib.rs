//! Core domain types for the job lifecycle engine.
//!
//! This crate contains the types shared by the manager, the store and the
//! daemon:
//! - Job, JobState and JobFlags for tracked jobs
//! - EventEntry and EventIndex for eventlog entries
//! - StateMachine for validating and applying entries
//! - Transition announcements and the durable store contract

mod entry;
mod error;
mod event_index;
mod events;
mod job;
mod state_machine;
mod store;

pub use entry::{Context, EventEntry, now_timestamp};
pub use error::FsmError;
pub use event_index::{EventId, EventIndex};
pub use events::{JournalEntry, StateTransition, TransitionBatch};
pub use job::{
    Dependencies, Job, JobFlags, JobId, JobState, URGENCY_DEFAULT, URGENCY_EXPEDITE,
    URGENCY_HOLD,
};
pub use state_machine::{EventKind, StateMachine, Transition};
pub use store::{AppendOp, EventlogStore, EventlogTxn, StoreError, StoreFuture};
