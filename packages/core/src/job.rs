//! Job domain types tracked by the lifecycle engine.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{EventEntry, EventId};

/// Numeric job identifier assigned at ingest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Durable store key of this job's eventlog.
    ///
    /// The id is split into four 16-bit groups so that jobs fan out
    /// across directories instead of piling into one.
    pub fn eventlog_key(&self) -> String {
        let id = self.0;
        format!(
            "job.{:04x}.{:04x}.{:04x}.{:04x}.eventlog",
            (id >> 48) & 0xffff,
            (id >> 32) & 0xffff,
            (id >> 16) & 0xffff,
            id & 0xffff
        )
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    #[default]
    New,
    Depend,
    Priority,
    Sched,
    Run,
    Cleanup,
    Inactive,
}

impl JobState {
    /// Upper-case state name used in transition announcements.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Depend => "DEPEND",
            JobState::Priority => "PRIORITY",
            JobState::Sched => "SCHED",
            JobState::Run => "RUN",
            JobState::Cleanup => "CLEANUP",
            JobState::Inactive => "INACTIVE",
        }
    }

    /// Plugin callback topic for entering this state.
    pub fn topic(&self) -> &'static str {
        match self {
            JobState::New => "job.state.new",
            JobState::Depend => "job.state.depend",
            JobState::Priority => "job.state.priority",
            JobState::Sched => "job.state.sched",
            JobState::Run => "job.state.run",
            JobState::Cleanup => "job.state.cleanup",
            JobState::Inactive => "job.state.inactive",
        }
    }

    /// RUN and CLEANUP form the "running" class.
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Run | JobState::Cleanup)
    }

    /// Everything short of INACTIVE counts as active.
    pub fn is_active(&self) -> bool {
        !matches!(self, JobState::Inactive)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job flag bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobFlags(pub u32);

impl JobFlags {
    pub const DEBUG: JobFlags = JobFlags(0x1);
    pub const WAITABLE: JobFlags = JobFlags(0x2);
    pub const NOVALIDATE: JobFlags = JobFlags(0x4);
    pub const IMMUTABLE: JobFlags = JobFlags(0x8);

    /// Look up a flag by the name used in `set-flags` events.
    pub fn from_name(name: &str) -> Option<JobFlags> {
        match name {
            "debug" => Some(Self::DEBUG),
            "waitable" => Some(Self::WAITABLE),
            "novalidate" => Some(Self::NOVALIDATE),
            "immutable" => Some(Self::IMMUTABLE),
            _ => None,
        }
    }

    pub fn contains(&self, other: JobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: JobFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for JobFlags {
    type Output = JobFlags;

    fn bitor(self, rhs: JobFlags) -> JobFlags {
        JobFlags(self.0 | rhs.0)
    }
}

/// Urgency value that holds a job.
pub const URGENCY_HOLD: i32 = 0;
/// Default urgency.
pub const URGENCY_DEFAULT: i32 = 16;
/// Urgency value that expedites a job.
pub const URGENCY_EXPEDITE: i32 = 31;

/// Outstanding dependencies of a job.
///
/// A description that has been added once can never be added again, even
/// after it was removed, so a late duplicate add cannot re-block the job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    outstanding: HashSet<String>,
    seen: HashSet<String>,
}

impl Dependencies {
    /// Add a dependency. Returns false if the description was seen before.
    pub fn add(&mut self, description: &str) -> bool {
        if !self.seen.insert(description.to_string()) {
            return false;
        }
        self.outstanding.insert(description.to_string());
        true
    }

    /// Remove an outstanding dependency. Returns false if it is not outstanding.
    pub fn remove(&mut self, description: &str) -> bool {
        self.outstanding.remove(description)
    }

    pub fn is_outstanding(&self, description: &str) -> bool {
        self.outstanding.contains(description)
    }

    /// Number of outstanding dependencies.
    pub fn count(&self) -> usize {
        self.outstanding.len()
    }
}

/// A job tracked by the lifecycle engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Current lifecycle state.
    pub state: JobState,
    /// Flag bitset.
    pub flags: JobFlags,
    /// User-supplied urgency hint.
    pub urgency: i32,
    /// Scheduler priority, set by the `priority` event.
    pub priority: i64,
    /// Submitting user.
    pub userid: u32,
    /// Submit timestamp (seconds since the epoch).
    pub t_submit: f64,
    /// Sequence number the next durable eventlog entry will get.
    pub eventlog_seq: u64,
    /// Outstanding dependencies.
    pub dependencies: Dependencies,
    /// The `depend` event has been posted.
    pub depend_posted: bool,
    /// The `clean` event has been posted.
    pub clean_posted: bool,
    /// Number of prolog/epilog actions in progress.
    pub perilog_active: u8,
    /// Resources are allocated to the job.
    pub has_resources: bool,
    /// An alloc request is outstanding at the scheduler.
    pub alloc_pending: bool,
    /// An alloc request is waiting in the local queue.
    pub alloc_queued: bool,
    /// Resources are managed outside the scheduler.
    pub alloc_bypass: bool,
    /// A cancel has been sent for the outstanding alloc request.
    pub alloc_cancel_sent: bool,
    /// The start request is still expecting responses.
    pub start_pending: bool,
    /// A free request is outstanding at the scheduler.
    pub free_pending: bool,
    /// First terminal entry seen: fatal exception or finish.
    pub end_event: Option<EventEntry>,
    /// User annotations merged from `memo` events.
    pub annotations: serde_json::Map<String, serde_json::Value>,
    /// Interned name of the last applied event.
    pub last_event: Option<EventId>,
    /// Member of the active-job index.
    pub active: bool,
    refcount: u32,
}

impl Job {
    /// Create a job in the NEW state.
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            state: JobState::New,
            flags: JobFlags::default(),
            urgency: URGENCY_DEFAULT,
            priority: 0,
            userid: 0,
            t_submit: 0.0,
            eventlog_seq: 0,
            dependencies: Dependencies::default(),
            depend_posted: false,
            clean_posted: false,
            perilog_active: 0,
            has_resources: false,
            alloc_pending: false,
            alloc_queued: false,
            alloc_bypass: false,
            alloc_cancel_sent: false,
            start_pending: false,
            free_pending: false,
            end_event: None,
            annotations: serde_json::Map::new(),
            last_event: None,
            active: true,
            refcount: 0,
        }
    }

    /// Take a temporary reference that keeps the job from being reaped.
    pub fn incref(&mut self) {
        self.refcount += 1;
    }

    /// Drop a temporary reference.
    pub fn decref(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
    }

    pub fn is_referenced(&self) -> bool {
        self.refcount > 0
    }

    /// True when no asynchronous request is outstanding for this job.
    pub fn trackers_clear(&self) -> bool {
        !self.alloc_pending && !self.alloc_queued && !self.start_pending && !self.free_pending
    }

    /// The job can be released from the arena.
    pub fn is_reapable(&self) -> bool {
        self.state == JobState::Inactive && !self.is_referenced() && self.trackers_clear()
    }
}
