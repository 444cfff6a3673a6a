//! In-memory eventlog store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use job_core::{EventEntry, EventlogStore, EventlogTxn, JobId, StoreError, StoreFuture};

#[derive(Debug, Default)]
struct Inner {
    logs: HashMap<String, Vec<String>>,
    commits: usize,
    fail: bool,
}

/// Eventlog store kept in process memory.
///
/// Transactions are validated as a whole before any line is written, and a
/// line is only accepted at the next sequence number of its eventlog.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventlogStore {
    inner: Arc<Mutex<Inner>>,
    delay: Option<Duration>,
}

impl MemoryEventlogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every commit, to widen the window between write and completion.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make subsequent commits fail.
    pub fn fail_commits(&self, fail: bool) {
        self.lock().fail = fail;
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Raw lines of `job_id`'s eventlog.
    pub fn lines(&self, job_id: JobId) -> Vec<String> {
        self.lock()
            .logs
            .get(&job_id.eventlog_key())
            .cloned()
            .unwrap_or_default()
    }

    /// Decoded entries of `job_id`'s eventlog.
    pub fn eventlog(&self, job_id: JobId) -> Result<Vec<EventEntry>, StoreError> {
        self.lines(job_id)
            .iter()
            .map(|line| EventEntry::decode(line).map_err(|e| StoreError::Encode(e.to_string())))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, txn: EventlogTxn) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail {
            return Err(StoreError::Unavailable);
        }

        let mut next: HashMap<&str, u64> = HashMap::new();
        for op in txn.ops() {
            let expected = next
                .entry(op.key.as_str())
                .or_insert_with(|| inner.logs.get(&op.key).map_or(0, |l| l.len() as u64));
            if op.seq != *expected {
                return Err(StoreError::Backend(format!(
                    "{}: expected seq {}, got {}",
                    op.key, expected, op.seq
                )));
            }
            *expected += 1;
        }

        for op in txn.into_ops() {
            inner.logs.entry(op.key).or_default().push(op.line);
        }
        inner.commits += 1;
        Ok(())
    }
}

impl EventlogStore for MemoryEventlogStore {
    fn commit(&self, txn: EventlogTxn) -> StoreFuture {
        let store = self.clone();
        Box::pin(async move {
            if let Some(delay) = store.delay {
                tokio::time::sleep(delay).await;
            }
            store.apply(txn)
        })
    }
}
