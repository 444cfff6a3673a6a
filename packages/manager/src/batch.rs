//! Commit batching.
//!
//! Events from many jobs are collected into one open batch, which is
//! committed to the durable store as a single transaction when its timer
//! fires (or on an explicit flush). After the write completes the batch's
//! state transitions are published and only then are its deferred
//! responses released. Completions are processed strictly in batch order,
//! so a batch whose write finishes early waits for its predecessors.

use std::collections::BTreeMap;
use std::time::Duration;

use job_core::{
    EventEntry, EventlogTxn, JobId, JobState, StateTransition, StoreError, TransitionBatch,
};

/// Monotonic batch identifier.
pub type BatchId = u64;

/// A response released only after the owning batch is durable.
pub trait DeferredResponse: Send {
    fn respond(self: Box<Self>);
}

impl<F> DeferredResponse for F
where
    F: FnOnce() + Send,
{
    fn respond(self: Box<Self>) {
        (*self)()
    }
}

/// Arms the one-shot commit timer of an open batch.
pub trait CommitTimer: Send {
    fn arm(&mut self, batch: BatchId, delay: Duration);
}

/// Timer that never fires. Batches are only committed on request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualCommit;

impl CommitTimer for ManualCommit {
    fn arm(&mut self, _batch: BatchId, _delay: Duration) {}
}

/// What a batch needs to persist.
#[derive(Debug, Default)]
pub enum BatchTxn {
    #[default]
    Empty,
    WithTransaction(EventlogTxn),
}

struct Batch {
    id: BatchId,
    txn: BatchTxn,
    transitions: Vec<StateTransition>,
    responses: Vec<Box<dyn DeferredResponse>>,
}

impl Batch {
    fn new(id: BatchId) -> Self {
        Self {
            id,
            txn: BatchTxn::Empty,
            transitions: Vec::new(),
            responses: Vec::new(),
        }
    }
}

struct InFlight {
    batch: Batch,
    written: bool,
}

/// Work produced by committing the open batch.
pub enum Commit {
    /// Write this transaction, then report back with the batch id.
    Write { id: BatchId, txn: EventlogTxn },
    /// Nothing to write; these batches are complete.
    Ready(Vec<FinishedBatch>),
}

impl std::fmt::Debug for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Commit::Write { id, txn } => f
                .debug_struct("Write")
                .field("id", id)
                .field("ops", &txn.len())
                .finish(),
            Commit::Ready(batches) => f.debug_tuple("Ready").field(&batches.len()).finish(),
        }
    }
}

/// A durable batch whose announcements and responses are due.
///
/// Publish the transitions first, then call [`FinishedBatch::respond`].
pub struct FinishedBatch {
    pub id: BatchId,
    transitions: Vec<StateTransition>,
    responses: Vec<Box<dyn DeferredResponse>>,
}

impl FinishedBatch {
    /// Take the transition payload, if the batch has any.
    pub fn take_transitions(&mut self) -> Option<TransitionBatch> {
        if self.transitions.is_empty() {
            return None;
        }
        Some(TransitionBatch {
            transitions: std::mem::take(&mut self.transitions),
        })
    }

    pub fn response_count(&self) -> usize {
        self.responses.len()
    }

    /// Release deferred responses in the order they were queued.
    pub fn respond(self) {
        for response in self.responses {
            response.respond();
        }
    }
}

impl std::fmt::Debug for FinishedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinishedBatch")
            .field("id", &self.id)
            .field("transitions", &self.transitions.len())
            .field("responses", &self.responses.len())
            .finish()
    }
}

/// Owns the open batch and every batch still committing.
pub struct BatchScheduler {
    timeout: Duration,
    timer: Box<dyn CommitTimer>,
    next_id: BatchId,
    open: Option<Batch>,
    committing: BTreeMap<BatchId, InFlight>,
}

impl BatchScheduler {
    pub fn new(timeout: Duration, timer: Box<dyn CommitTimer>) -> Self {
        Self {
            timeout,
            timer,
            next_id: 1,
            open: None,
            committing: BTreeMap::new(),
        }
    }

    /// Open a batch if none is open and arm its timer.
    pub fn start(&mut self) -> BatchId {
        if let Some(batch) = &self.open {
            return batch.id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.open = Some(Batch::new(id));
        self.timer.arm(id, self.timeout);
        tracing::trace!("Opened batch {}", id);
        id
    }

    fn open_batch(&mut self) -> &mut Batch {
        self.start();
        self.open.get_or_insert_with(|| Batch::new(0))
    }

    /// Append `entry` to `job_id`'s eventlog at `seq` in the open batch.
    pub fn append_entry(
        &mut self,
        job_id: JobId,
        seq: u64,
        entry: &EventEntry,
    ) -> Result<(), StoreError> {
        let batch = self.open_batch();
        if let BatchTxn::Empty = batch.txn {
            batch.txn = BatchTxn::WithTransaction(EventlogTxn::new());
        }
        match &mut batch.txn {
            BatchTxn::WithTransaction(txn) => txn.append(job_id, seq, entry),
            BatchTxn::Empty => Ok(()),
        }
    }

    /// Record a transition to announce once the batch is durable.
    pub fn append_state_transition(&mut self, job_id: JobId, state: JobState, timestamp: f64) {
        self.open_batch()
            .transitions
            .push(StateTransition(job_id, state, timestamp));
    }

    /// Hold `response` until the open batch is durable.
    pub fn append_deferred_response(&mut self, response: Box<dyn DeferredResponse>) {
        self.open_batch().responses.push(response);
    }

    /// Close the open batch.
    ///
    /// Returns None if no batch is open. A batch with nothing to persist
    /// completes at once, unless earlier batches are still committing.
    pub fn commit(&mut self) -> Option<Commit> {
        let mut batch = self.open.take()?;
        let id = batch.id;
        match std::mem::take(&mut batch.txn) {
            BatchTxn::WithTransaction(txn) => {
                tracing::debug!("Committing batch {} ({} entries)", id, txn.len());
                self.committing.insert(
                    id,
                    InFlight {
                        batch,
                        written: false,
                    },
                );
                Some(Commit::Write { id, txn })
            }
            BatchTxn::Empty => {
                self.committing.insert(
                    id,
                    InFlight {
                        batch,
                        written: true,
                    },
                );
                Some(Commit::Ready(self.drain_ready()))
            }
        }
    }

    /// Timer callback. Stale timers for already committed batches are ignored.
    pub fn commit_on_timer(&mut self, batch: BatchId) -> Option<Commit> {
        match &self.open {
            Some(open) if open.id == batch => self.commit(),
            _ => None,
        }
    }

    /// The durable write for `batch` completed.
    ///
    /// On success, returns every batch that is now complete in order. A
    /// failed write is returned to the caller; there is no retry.
    pub fn commit_finished(
        &mut self,
        batch: BatchId,
        result: Result<(), StoreError>,
    ) -> Result<Vec<FinishedBatch>, StoreError> {
        result?;
        match self.committing.get_mut(&batch) {
            Some(in_flight) => in_flight.written = true,
            None => {
                tracing::warn!("Commit completion for unknown batch {}", batch);
                return Ok(Vec::new());
            }
        }
        Ok(self.drain_ready())
    }

    fn drain_ready(&mut self) -> Vec<FinishedBatch> {
        let mut ready = Vec::new();
        while let Some(entry) = self.committing.first_entry() {
            if !entry.get().written {
                break;
            }
            let InFlight { batch, .. } = entry.remove();
            ready.push(FinishedBatch {
                id: batch.id,
                transitions: batch.transitions,
                responses: batch.responses,
            });
        }
        ready
    }

    pub fn open_id(&self) -> Option<BatchId> {
        self.open.as_ref().map(|b| b.id)
    }

    pub fn committing_len(&self) -> usize {
        self.committing.len()
    }

    /// No batch is open or committing.
    pub fn is_idle(&self) -> bool {
        self.open.is_none() && self.committing.is_empty()
    }
}
