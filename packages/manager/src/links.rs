//! Links to the services the engine drives: scheduler, execution, waiters
//! and the live journal.
//!
//! Each link is a small trait so the engine can be exercised without the
//! real services. Channel-backed implementations are provided for the
//! daemon and for tests.

use job_core::{EventEntry, Job, JobId, JournalEntry};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// A side-effect request could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("{0} link is closed")]
    Closed(&'static str),
}

/// Requests sent to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerRequest {
    Alloc {
        job_id: JobId,
        priority: i64,
        userid: u32,
        t_submit: f64,
    },
    Cancel {
        job_id: JobId,
    },
    Free {
        job_id: JobId,
    },
}

impl SchedulerRequest {
    pub fn job_id(&self) -> JobId {
        match self {
            SchedulerRequest::Alloc { job_id, .. } => *job_id,
            SchedulerRequest::Cancel { job_id } => *job_id,
            SchedulerRequest::Free { job_id } => *job_id,
        }
    }
}

/// Request sent to the execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub job_id: JobId,
    pub userid: u32,
}

/// Notice sent to waiters when a waitable job goes inactive.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitNotice {
    pub job_id: JobId,
    pub end_event: Option<EventEntry>,
}

pub trait SchedulerLink: Send {
    fn send(&mut self, request: SchedulerRequest) -> Result<(), LinkError>;
}

pub trait ExecLink: Send {
    fn start(&mut self, request: StartRequest) -> Result<(), LinkError>;
}

pub trait WaitNotifier: Send {
    fn notify_inactive(&mut self, job: &Job);
}

/// Live journal consumer. Sees every posted entry before it is sequenced.
pub trait Journal: Send {
    fn process(
        &mut self,
        job_id: JobId,
        seq: Option<u64>,
        name: &str,
        entry: &EventEntry,
    ) -> Result<(), LinkError>;
}

impl SchedulerLink for mpsc::UnboundedSender<SchedulerRequest> {
    fn send(&mut self, request: SchedulerRequest) -> Result<(), LinkError> {
        mpsc::UnboundedSender::send(self, request).map_err(|_| LinkError::Closed("scheduler"))
    }
}

impl ExecLink for mpsc::UnboundedSender<StartRequest> {
    fn start(&mut self, request: StartRequest) -> Result<(), LinkError> {
        self.send(request).map_err(|_| LinkError::Closed("exec"))
    }
}

impl WaitNotifier for mpsc::UnboundedSender<WaitNotice> {
    fn notify_inactive(&mut self, job: &Job) {
        let notice = WaitNotice {
            job_id: job.id,
            end_event: job.end_event.clone(),
        };
        if self.send(notice).is_err() {
            tracing::warn!("No waiter listening for job {}", job.id);
        }
    }
}

impl Journal for mpsc::UnboundedSender<JournalEntry> {
    fn process(
        &mut self,
        job_id: JobId,
        seq: Option<u64>,
        name: &str,
        entry: &EventEntry,
    ) -> Result<(), LinkError> {
        self.send(JournalEntry {
            job_id,
            seq,
            name: name.to_string(),
            entry: entry.clone(),
        })
        .map_err(|_| LinkError::Closed("journal"))
    }
}

/// Journal that fans entries out to any number of subscribers.
///
/// Having no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastJournal {
    tx: broadcast::Sender<JournalEntry>,
}

impl BroadcastJournal {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JournalEntry> {
        self.tx.subscribe()
    }
}

impl Journal for BroadcastJournal {
    fn process(
        &mut self,
        job_id: JobId,
        seq: Option<u64>,
        name: &str,
        entry: &EventEntry,
    ) -> Result<(), LinkError> {
        let _ = self.tx.send(JournalEntry {
            job_id,
            seq,
            name: name.to_string(),
            entry: entry.clone(),
        });
        Ok(())
    }
}

/// Link that drops every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl SchedulerLink for Discard {
    fn send(&mut self, request: SchedulerRequest) -> Result<(), LinkError> {
        tracing::debug!("Dropping scheduler request for job {}", request.job_id());
        Ok(())
    }
}

impl ExecLink for Discard {
    fn start(&mut self, request: StartRequest) -> Result<(), LinkError> {
        tracing::debug!("Dropping start request for job {}", request.job_id);
        Ok(())
    }
}

impl WaitNotifier for Discard {
    fn notify_inactive(&mut self, _job: &Job) {}
}

impl Journal for Discard {
    fn process(
        &mut self,
        _job_id: JobId,
        _seq: Option<u64>,
        _name: &str,
        _entry: &EventEntry,
    ) -> Result<(), LinkError> {
        Ok(())
    }
}

/// The full set of links owned by the engine.
pub struct Links {
    pub scheduler: Box<dyn SchedulerLink>,
    pub exec: Box<dyn ExecLink>,
    pub wait: Box<dyn WaitNotifier>,
    pub journal: Box<dyn Journal>,
}

impl Default for Links {
    fn default() -> Self {
        Self {
            scheduler: Box::new(Discard),
            exec: Box::new(Discard),
            wait: Box::new(Discard),
            journal: Box::new(Discard),
        }
    }
}

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scheduler(mut self, link: impl SchedulerLink + 'static) -> Self {
        self.scheduler = Box::new(link);
        self
    }

    pub fn with_exec(mut self, link: impl ExecLink + 'static) -> Self {
        self.exec = Box::new(link);
        self
    }

    pub fn with_wait(mut self, notifier: impl WaitNotifier + 'static) -> Self {
        self.wait = Box::new(notifier);
        self
    }

    pub fn with_journal(mut self, journal: impl Journal + 'static) -> Self {
        self.journal = Box::new(journal);
        self
    }
}

impl std::fmt::Debug for Links {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Links").finish_non_exhaustive()
    }
}
