//! Durable eventlog store contract.
//!
//! One [`EventlogTxn`] is built per commit batch and handed to an
//! [`EventlogStore`], which must apply every operation or none of them.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::{EventEntry, JobId};

/// Errors reported by a durable store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("failed to encode entry: {0}")]
    Encode(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store is unavailable")]
    Unavailable,
}

/// Append one line to a job's eventlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOp {
    /// Store key of the eventlog, see [`JobId::eventlog_key`].
    pub key: String,
    pub job_id: JobId,
    /// Sequence number of the line within the job's eventlog.
    pub seq: u64,
    /// Encoded entry, newline terminated.
    pub line: String,
}

/// Ordered set of append operations committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventlogTxn {
    ops: Vec<AppendOp>,
}

impl EventlogTxn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `entry` and append it to `job_id`'s eventlog at `seq`.
    pub fn append(
        &mut self,
        job_id: JobId,
        seq: u64,
        entry: &EventEntry,
    ) -> Result<(), StoreError> {
        let line = entry
            .encode()
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        self.ops.push(AppendOp {
            key: job_id.eventlog_key(),
            job_id,
            seq,
            line,
        });
        Ok(())
    }

    pub fn ops(&self) -> &[AppendOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<AppendOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Boxed future returned by [`EventlogStore::commit`].
pub type StoreFuture = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send>>;

/// A durable key-value store that accepts eventlog transactions.
pub trait EventlogStore: Send + Sync + 'static {
    /// Apply every operation of `txn`, or none of them.
    fn commit(&self, txn: EventlogTxn) -> StoreFuture;
}
