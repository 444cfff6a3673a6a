//! Alloc request queue.
//!
//! Jobs in SCHED wait here until their alloc request is sent to the
//! scheduler. Ordering: higher priority first, then older submissions,
//! then lower job id.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use job_core::{Job, JobId};

#[derive(Debug, Clone, Copy)]
struct QueueKey {
    priority: i64,
    t_submit: f64,
    id: JobId,
}

impl QueueKey {
    fn of(job: &Job) -> Self {
        Self {
            priority: job.priority,
            t_submit: job.t_submit,
            id: job.id,
        }
    }
}

impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey {}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        other
            .priority
            .cmp(&self.priority)
            // Older jobs first
            .then_with(|| self.t_submit.total_cmp(&other.t_submit))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// An ordered set with O(log n) removal by job id.
#[derive(Debug, Default)]
struct OrderedJobs {
    order: BTreeSet<QueueKey>,
    index: HashMap<JobId, QueueKey>,
}

impl OrderedJobs {
    fn insert(&mut self, job: &Job) -> bool {
        if self.index.contains_key(&job.id) {
            return false;
        }
        let key = QueueKey::of(job);
        self.order.insert(key);
        self.index.insert(job.id, key);
        true
    }

    fn remove(&mut self, id: JobId) -> bool {
        match self.index.remove(&id) {
            Some(key) => self.order.remove(&key),
            None => false,
        }
    }

    fn rekey(&mut self, job: &Job) -> bool {
        if self.remove(job.id) {
            self.insert(job);
            true
        } else {
            false
        }
    }

    fn pop_first(&mut self) -> Option<JobId> {
        let key = self.order.pop_first()?;
        self.index.remove(&key.id);
        Some(key.id)
    }

    fn first(&self) -> Option<&QueueKey> {
        self.order.first()
    }

    fn last(&self) -> Option<&QueueKey> {
        self.order.last()
    }

    fn contains(&self, id: JobId) -> bool {
        self.index.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Queued and outstanding alloc requests.
#[derive(Debug, Default)]
pub struct AllocQueue {
    queued: OrderedJobs,
    /// Sent to the scheduler, no cancel sent yet.
    pending: OrderedJobs,
    /// Sent to the scheduler, response not yet received.
    outstanding: usize,
}

impl AllocQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an alloc request. Returns false if already queued.
    pub fn enqueue(&mut self, job: &Job) -> bool {
        self.queued.insert(job)
    }

    /// Withdraw a queued request. Returns false if it was not queued.
    pub fn dequeue(&mut self, id: JobId) -> bool {
        self.queued.remove(id)
    }

    /// Re-sort a job after its priority changed.
    pub fn reorder(&mut self, job: &Job) -> bool {
        let queued = self.queued.rekey(job);
        let pending = self.pending.rekey(job);
        queued || pending
    }

    /// Take the best queued request if the outstanding limit allows it.
    pub fn send_next(&mut self, limit: Option<usize>) -> Option<JobId> {
        if limit.is_some_and(|limit| self.outstanding >= limit) {
            return None;
        }
        let id = self.queued.pop_first()?;
        self.outstanding += 1;
        Some(id)
    }

    /// Record the sent request's ordering key, used by [`Self::recalc_pending`].
    pub fn mark_pending(&mut self, job: &Job) {
        self.pending.insert(job);
    }

    /// A cancel was sent for `id`'s outstanding request.
    pub fn cancel_sent(&mut self, id: JobId) {
        self.pending.remove(id);
    }

    /// The scheduler answered `id`'s request.
    pub fn alloc_finished(&mut self, id: JobId) {
        self.pending.remove(id);
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// With a limit in force, find an outstanding request that a queued one
    /// outranks. Cancelling it lets the better job reach the scheduler.
    pub fn recalc_pending(&self, limit: Option<usize>) -> Option<JobId> {
        limit?;
        let best_queued = self.queued.first()?;
        let worst_pending = self.pending.last()?;
        (best_queued < worst_pending).then_some(worst_pending.id)
    }

    pub fn is_pending(&self, id: JobId) -> bool {
        self.pending.contains(id)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}
