//! The lifecycle engine.
//!
//! [`Engine`] owns every tracked job and runs the posting pipeline: journal
//! hand-off, state machine, sequencing, batching, plugin hooks and action
//! dispatch. It is synchronous and single-owner; the actor in
//! [`crate::manager_actor`] drives it and performs the async I/O it asks
//! for (durable writes and publishes).

use std::collections::{HashMap, VecDeque};

use job_core::{
    Context, EventEntry, EventIndex, Job, JobFlags, JobId, JobState, StateMachine, now_timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::alloc::AllocQueue;
use crate::batch::{
    BatchId, BatchScheduler, Commit, CommitTimer, DeferredResponse, FinishedBatch, ManualCommit,
};
use crate::config::ManagerConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::jobtap::{HookContext, Jobtap, PluginRegistry};
use crate::links::Links;

/// Flags accepted by [`Engine::post_entry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostFlags(u8);

impl PostFlags {
    /// Do not append the entry to the eventlog.
    pub const NO_COMMIT: PostFlags = PostFlags(0x1);
    /// Consume a sequence number even with NO_COMMIT.
    pub const FORCE_SEQUENCE: PostFlags = PostFlags(0x2);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, other: PostFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PostFlags {
    type Output = PostFlags;

    fn bitor(self, rhs: PostFlags) -> PostFlags {
        PostFlags(self.0 | rhs.0)
    }
}

/// A follow-up post waiting in the work queue.
#[derive(Debug, Clone)]
pub struct QueuedPost {
    pub job_id: JobId,
    pub entry: EventEntry,
    pub flags: PostFlags,
}

/// Pending pipeline work.
///
/// Posts made from hooks or dispatch are pushed to the front of the queue
/// in the order they were made, ahead of anything queued earlier, so work
/// runs in the same order nested posting would run it.
#[derive(Debug)]
enum Work {
    Post(QueuedPost),
    /// Dispatch for a job whose event was applied. `origin` marks the
    /// event of the outermost call, whose failure is returned to the caller.
    Act { job_id: JobId, origin: bool },
}

/// A new job handed over by ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub job_id: JobId,
    pub urgency: i32,
    pub userid: u32,
    #[serde(default)]
    pub flags: JobFlags,
    /// Submit time; defaults to now.
    #[serde(default)]
    pub t_submit: Option<f64>,
}

impl SubmitRequest {
    pub fn new(job_id: JobId, userid: u32) -> Self {
        Self {
            job_id,
            urgency: job_core::URGENCY_DEFAULT,
            userid,
            flags: JobFlags::default(),
            t_submit: None,
        }
    }

    pub fn with_urgency(mut self, urgency: i32) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_flags(mut self, flags: JobFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_t_submit(mut self, t_submit: f64) -> Self {
        self.t_submit = Some(t_submit);
        self
    }
}

/// Scheduler answer to an alloc request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocOutcome {
    Granted,
    Denied { note: String },
    Canceled,
}

/// Execution service answer to a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartOutcome {
    Finished { status: i64 },
    Released { ranks: String, is_final: bool },
    Exception { kind: String, severity: i64, note: String },
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub active_jobs: usize,
    pub running_jobs: usize,
    pub inactive_retained: usize,
    pub queued_allocs: usize,
    pub outstanding_allocs: usize,
    pub open_batch: Option<BatchId>,
    pub committing_batches: usize,
    pub event_names: usize,
}

/// Owns jobs and runs the posting pipeline.
pub struct Engine {
    pub(crate) config: ManagerConfig,
    pub(crate) jobs: HashMap<JobId, Job>,
    inactive: VecDeque<Job>,
    index: EventIndex,
    batch: BatchScheduler,
    pub(crate) alloc: AllocQueue,
    running: usize,
    pub(crate) active: usize,
    work: VecDeque<Work>,
    staged: Vec<Work>,
    drain_waiters: Vec<Box<dyn DeferredResponse>>,
    pub(crate) links: Links,
    jobtap: Box<dyn Jobtap>,
}

impl Engine {
    /// Create an engine with no timer, the built-in plugin registry and
    /// links that drop every request.
    pub fn new(config: ManagerConfig) -> Self {
        let batch = BatchScheduler::new(config.batch_timeout(), Box::new(ManualCommit));
        Self {
            config,
            jobs: HashMap::new(),
            inactive: VecDeque::new(),
            index: EventIndex::new(),
            batch,
            alloc: AllocQueue::new(),
            running: 0,
            active: 0,
            work: VecDeque::new(),
            staged: Vec::new(),
            drain_waiters: Vec::new(),
            links: Links::default(),
            jobtap: Box::new(PluginRegistry::new()),
        }
    }

    /// Set the batch commit timer.
    pub fn with_timer(mut self, timer: impl CommitTimer + 'static) -> Self {
        self.batch = BatchScheduler::new(self.config.batch_timeout(), Box::new(timer));
        self
    }

    /// Replace the plugin hooks.
    pub fn with_jobtap(mut self, jobtap: impl Jobtap + 'static) -> Self {
        self.jobtap = Box::new(jobtap);
        self
    }

    /// Replace the service links.
    pub fn with_links(mut self, links: Links) -> Self {
        self.links = links;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create a job and post its `submit` entry.
    pub fn submit(&mut self, request: SubmitRequest) -> ManagerResult<()> {
        let id = request.job_id;
        if self.jobs.contains_key(&id) || self.inactive.iter().any(|j| j.id == id) {
            return Err(ManagerError::DuplicateJob(id));
        }

        self.jobs.insert(id, Job::new(id));
        self.active += 1;

        let entry = EventEntry::new(
            request.t_submit.unwrap_or_else(now_timestamp),
            "submit",
            EventEntry::context_from(json!({
                "urgency": request.urgency,
                "userid": request.userid,
                "flags": request.flags.0,
            })),
        );

        let result = self.post_entry(id, entry, PostFlags::empty());
        if result.is_err()
            && self.jobs.get(&id).is_some_and(|job| job.state == JobState::New)
        {
            self.jobs.remove(&id);
            self.active = self.active.saturating_sub(1);
        }
        result
    }

    /// Post a named event stamped with the current time.
    pub fn post_event(
        &mut self,
        job_id: JobId,
        name: &str,
        context: Option<Context>,
        flags: PostFlags,
    ) -> ManagerResult<()> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(ManagerError::UnknownJob(job_id))?;
        if job.state == JobState::New {
            return Err(ManagerError::NotReady(job_id));
        }
        self.post_entry(job_id, EventEntry::now(name, context), flags)
    }

    /// Run `entry` through the pipeline, then every follow-up it causes.
    ///
    /// The result covers `entry` and its own dispatch only; failed
    /// follow-ups are logged.
    pub fn post_entry(
        &mut self,
        job_id: JobId,
        entry: EventEntry,
        flags: PostFlags,
    ) -> ManagerResult<()> {
        let result = self.process(job_id, entry, flags, true);
        self.run_work(result)
    }

    /// Post an `exception` event. Severity 0 is fatal to the job.
    pub fn raise_exception(
        &mut self,
        job_id: JobId,
        kind: &str,
        severity: i64,
        note: &str,
    ) -> ManagerResult<()> {
        let context = json!({ "type": kind, "severity": severity, "note": note });
        self.post_event(
            job_id,
            "exception",
            EventEntry::context_from(context),
            PostFlags::empty(),
        )
    }

    /// Post an `urgency` event. Plugins are asked for a new priority.
    pub fn set_urgency(&mut self, job_id: JobId, urgency: i32) -> ManagerResult<()> {
        let context = json!({ "urgency": urgency });
        self.post_event(job_id, "urgency", EventEntry::context_from(context), PostFlags::empty())
    }

    /// Post a `dependency-add` event.
    pub fn add_dependency(&mut self, job_id: JobId, description: &str) -> ManagerResult<()> {
        let context = json!({ "description": description });
        self.post_event(
            job_id,
            "dependency-add",
            EventEntry::context_from(context),
            PostFlags::empty(),
        )
    }

    /// Post a `dependency-remove` event.
    pub fn remove_dependency(&mut self, job_id: JobId, description: &str) -> ManagerResult<()> {
        let context = json!({ "description": description });
        self.post_event(
            job_id,
            "dependency-remove",
            EventEntry::context_from(context),
            PostFlags::empty(),
        )
    }

    /// The scheduler answered an alloc request.
    pub fn alloc_response(&mut self, job_id: JobId, outcome: AllocOutcome) -> ManagerResult<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(ManagerError::UnknownJob(job_id))?;
        if !job.alloc_pending {
            tracing::warn!("Ignoring alloc response for job {} with no request", job_id);
            return Ok(());
        }
        job.alloc_pending = false;
        job.alloc_cancel_sent = false;
        self.alloc.alloc_finished(job_id);

        let result = match outcome {
            AllocOutcome::Granted => {
                self.post_entry(job_id, EventEntry::now("alloc", None), PostFlags::empty())
            }
            AllocOutcome::Denied { note } => {
                let context = json!({ "type": "alloc", "severity": 0, "note": note });
                self.post_entry(
                    job_id,
                    EventEntry::now("exception", EventEntry::context_from(context)),
                    PostFlags::empty(),
                )
            }
            AllocOutcome::Canceled => self.dispatch(job_id),
        };
        // A free slot may let a queued request through.
        let pumped = self.dispatch_pump();
        result.and(pumped)
    }

    /// The execution service answered a start request.
    pub fn start_response(&mut self, job_id: JobId, outcome: StartOutcome) -> ManagerResult<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(ManagerError::UnknownJob(job_id))?;

        match outcome {
            StartOutcome::Finished { status } => {
                let context = json!({ "status": status });
                self.post_entry(
                    job_id,
                    EventEntry::now("finish", EventEntry::context_from(context)),
                    PostFlags::empty(),
                )
            }
            StartOutcome::Released { ranks, is_final } => {
                if is_final {
                    if !job.start_pending {
                        tracing::warn!("Ignoring final release for job {} with no start", job_id);
                        return Ok(());
                    }
                    job.start_pending = false;
                }
                let context = json!({ "ranks": ranks, "final": is_final });
                let result = self.post_entry(
                    job_id,
                    EventEntry::now("release", EventEntry::context_from(context)),
                    PostFlags::empty(),
                );
                if result.is_err()
                    && is_final
                    && let Some(job) = self.jobs.get_mut(&job_id)
                {
                    job.start_pending = true;
                }
                result
            }
            StartOutcome::Exception {
                kind,
                severity,
                note,
            } => {
                let context = json!({ "type": kind, "severity": severity, "note": note });
                self.post_entry(
                    job_id,
                    EventEntry::now("exception", EventEntry::context_from(context)),
                    PostFlags::empty(),
                )
            }
        }
    }

    /// The scheduler acknowledged a free request.
    pub fn free_response(&mut self, job_id: JobId) -> ManagerResult<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(ManagerError::UnknownJob(job_id))?;
        if !job.free_pending {
            tracing::warn!("Ignoring free response for job {} with no request", job_id);
            return Ok(());
        }
        job.free_pending = false;
        self.post_entry(job_id, EventEntry::now("free", None), PostFlags::empty())
    }

    /// Hold `response` until the open batch is durable.
    pub fn defer_response(&mut self, response: Box<dyn DeferredResponse>) {
        self.batch.append_deferred_response(response);
    }

    /// Release `response` once no job is active.
    pub fn wait_drained(&mut self, response: Box<dyn DeferredResponse>) {
        if self.active == 0 {
            response.respond();
        } else {
            self.drain_waiters.push(response);
        }
    }

    /// Close the open batch now.
    pub fn commit_batch(&mut self) -> Option<Commit> {
        self.batch.commit()
    }

    /// The timer of `batch` fired.
    pub fn commit_on_timer(&mut self, batch: BatchId) -> Option<Commit> {
        self.batch.commit_on_timer(batch)
    }

    /// The durable write of `batch` completed. A failure is fatal.
    pub fn commit_finished(
        &mut self,
        batch: BatchId,
        result: Result<(), job_core::StoreError>,
    ) -> ManagerResult<Vec<FinishedBatch>> {
        self.batch.commit_finished(batch, result).map_err(|e| {
            tracing::error!("Eventlog commit of batch {} failed: {}", batch, e);
            ManagerError::StoreFailure(e)
        })
    }

    /// Look up an active job or a retained inactive one.
    pub fn job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs
            .get(&job_id)
            .or_else(|| self.inactive.iter().find(|j| j.id == job_id))
    }

    /// Jobs in RUN or CLEANUP.
    pub fn running_jobs(&self) -> usize {
        self.running
    }

    /// Jobs that have not reached INACTIVE.
    pub fn active_jobs(&self) -> usize {
        self.active
    }

    pub fn event_index(&self) -> &EventIndex {
        &self.index
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_jobs: self.active,
            running_jobs: self.running,
            inactive_retained: self.inactive.len(),
            queued_allocs: self.alloc.queued_len(),
            outstanding_allocs: self.alloc.outstanding(),
            open_batch: self.batch.open_id(),
            committing_batches: self.batch.committing_len(),
            event_names: self.index.len(),
        }
    }

    /// No batch is open or committing.
    pub fn is_idle(&self) -> bool {
        self.batch.is_idle()
    }

    pub(crate) fn queue_post(&mut self, post: QueuedPost) {
        if let Some(job) = self.jobs.get_mut(&post.job_id) {
            job.incref();
        }
        self.staged.push(Work::Post(post));
    }

    fn flush_staged(&mut self) {
        for work in self.staged.drain(..).rev() {
            self.work.push_front(work);
        }
    }

    fn run_work(&mut self, mut result: ManagerResult<()>) -> ManagerResult<()> {
        while let Some(work) = self.work.pop_front() {
            match work {
                Work::Post(QueuedPost {
                    job_id,
                    entry,
                    flags,
                }) => {
                    let name = entry.name.clone();
                    if let Err(e) = self.process(job_id, entry, flags, false) {
                        tracing::error!(
                            "Follow-up event {} for job {} failed: {}",
                            name,
                            job_id,
                            e
                        );
                        self.followup_failed(job_id, &name);
                    }
                    self.unpin(job_id);
                }
                Work::Act { job_id, origin } => {
                    let acted = self.act(job_id);
                    self.flush_staged();
                    self.unpin(job_id);
                    if let Err(e) = acted {
                        tracing::error!("Action for job {} failed: {}", job_id, e);
                        if origin && result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
            }
        }
        result
    }

    /// Run dispatch for a job outside of a post.
    fn dispatch(&mut self, job_id: JobId) -> ManagerResult<()> {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return Err(ManagerError::UnknownJob(job_id));
        };
        job.incref();
        self.work.push_front(Work::Act {
            job_id,
            origin: true,
        });
        self.run_work(Ok(()))
    }

    fn dispatch_pump(&mut self) -> ManagerResult<()> {
        let result = self.pump_alloc_queue();
        self.run_work(result)
    }

    fn process(
        &mut self,
        job_id: JobId,
        entry: EventEntry,
        flags: PostFlags,
        origin: bool,
    ) -> ManagerResult<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(ManagerError::UnknownJob(job_id))?;

        let no_commit = flags.contains(PostFlags::NO_COMMIT);
        let sequenced = !no_commit || flags.contains(PostFlags::FORCE_SEQUENCE);
        let seq = sequenced.then_some(job.eventlog_seq);

        self.links
            .journal
            .process(job_id, seq, &entry.name, &entry)
            .map_err(|e| ManagerError::Journal(e.to_string()))?;

        let transition = StateMachine::apply(job, &entry).inspect_err(|e| {
            tracing::debug!("Rejected {} for job {}: {}", entry.name, job_id, e);
        })?;

        if seq.is_some() {
            job.eventlog_seq += 1;
        }
        job.last_event = Some(self.index.intern(&entry.name));

        if let (false, Some(seq)) = (no_commit, seq) {
            self.batch.append_entry(job_id, seq, &entry)?;
        }

        if transition.changed() {
            self.batch
                .append_state_transition(job_id, transition.to, entry.timestamp);
            tracing::debug!("Job {}: {} -> {}", job_id, transition.from, transition.to);
        }

        match (transition.from.is_running(), transition.to.is_running()) {
            (false, true) => self.running += 1,
            (true, false) => self.running = self.running.saturating_sub(1),
            _ => {}
        }

        job.incref();

        let mut hooks = HookContext::new();
        let prev = transition.changed().then_some(transition.from);
        self.call_hooks(job_id, &entry, prev, &mut hooks);
        for post in hooks.into_posts() {
            self.queue_post(post);
        }
        // The pin is released once dispatch has run.
        self.staged.push(Work::Act { job_id, origin });
        self.flush_staged();
        Ok(())
    }

    fn call_hooks(
        &mut self,
        job_id: JobId,
        entry: &EventEntry,
        prev: Option<JobState>,
        hooks: &mut HookContext,
    ) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };

        if let Err(e) = self.jobtap.on_event(job, entry, hooks) {
            tracing::warn!("Job {}: {} hook failed: {}", job_id, entry.name, e);
        }

        match prev {
            Some(prev) => {
                let topic = job.state.topic();
                if let Err(e) = self.jobtap.on_transition(job, entry, topic, prev, hooks) {
                    tracing::warn!("Job {}: {} hook failed: {}", job_id, topic, e);
                }
            }
            None if entry.name == "urgency" => self.reprioritize(job_id, hooks),
            None => {}
        }
    }

    /// Ask plugins for a fresh priority after an urgency change.
    fn reprioritize(&mut self, job_id: JobId, hooks: &mut HookContext) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let priority = match self.jobtap.get_priority(job) {
            Ok(Some(priority)) => priority,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Job {}: priority plugin failed: {}", job_id, e);
                return;
            }
        };
        let changed = match job.state {
            JobState::Sched => priority != job.priority,
            JobState::Priority => true,
            _ => false,
        };
        if changed {
            hooks.post_event(
                job_id,
                "priority",
                EventEntry::context_from(json!({ "priority": priority })),
            );
        }
    }

    fn unpin(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        job.decref();
        if !job.active && job.is_reapable() {
            self.reap(job_id);
        }
    }

    /// Move a finished job into the bounded inactive list.
    fn reap(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.remove(&job_id) else {
            return;
        };
        tracing::debug!("Reaping job {}", job_id);
        self.inactive.push_back(job);
        while self.inactive.len() > self.config.inactive_num_limit {
            if let Some(old) = self.inactive.pop_front() {
                tracing::debug!("Purging inactive job {}", old.id);
            }
        }
    }

    /// Release drain waiters if no job is active.
    pub(crate) fn check_drain(&mut self) {
        if self.active == 0 {
            for waiter in self.drain_waiters.drain(..) {
                waiter.respond();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobtap::{FnPriority, JobtapPlugin, PluginError};
    use crate::links::{Journal, LinkError, SchedulerRequest, StartRequest, WaitNotice};
    use job_core::{FsmError, JournalEntry, StateTransition};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    struct Harness {
        engine: Engine,
        sched: mpsc::UnboundedReceiver<SchedulerRequest>,
        exec: mpsc::UnboundedReceiver<StartRequest>,
        wait: mpsc::UnboundedReceiver<WaitNotice>,
        journal: mpsc::UnboundedReceiver<JournalEntry>,
    }

    fn harness_with(config: ManagerConfig, registry: PluginRegistry) -> Harness {
        let (sched_tx, sched) = mpsc::unbounded_channel();
        let (exec_tx, exec) = mpsc::unbounded_channel();
        let (wait_tx, wait) = mpsc::unbounded_channel();
        let (journal_tx, journal) = mpsc::unbounded_channel();
        let links = Links::new()
            .with_scheduler(sched_tx)
            .with_exec(exec_tx)
            .with_wait(wait_tx)
            .with_journal(journal_tx);
        let engine = Engine::new(config).with_links(links).with_jobtap(registry);
        Harness {
            engine,
            sched,
            exec,
            wait,
            journal,
        }
    }

    fn harness() -> Harness {
        harness_with(ManagerConfig::default(), PluginRegistry::new())
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn commit_all(engine: &mut Engine) -> (Vec<(JobId, u64, String)>, Vec<StateTransition>) {
        let mut ops = Vec::new();
        let mut transitions = Vec::new();
        let finished = match engine.commit_batch() {
            Some(Commit::Write { id, txn }) => {
                for op in txn.ops() {
                    let entry = EventEntry::decode(&op.line).unwrap();
                    ops.push((op.job_id, op.seq, entry.name));
                }
                engine.commit_finished(id, Ok(())).unwrap()
            }
            Some(Commit::Ready(finished)) => finished,
            None => Vec::new(),
        };
        for mut batch in finished {
            if let Some(payload) = batch.take_transitions() {
                transitions.extend(payload.transitions);
            }
            batch.respond();
        }
        (ops, transitions)
    }

    /// Submit a job and drive it to RUN with an alloc grant.
    fn running_job(h: &mut Harness, id: u64) -> JobId {
        let id = JobId(id);
        h.engine
            .submit(SubmitRequest::new(id, 100).with_t_submit(id.0 as f64))
            .unwrap();
        h.engine.alloc_response(id, AllocOutcome::Granted).unwrap();
        assert_eq!(h.engine.job(id).unwrap().state, JobState::Run);
        id
    }

    #[test]
    fn submit_walks_to_sched_with_gap_free_sequence() {
        let mut h = harness();
        let id = JobId(1);
        h.engine.submit(SubmitRequest::new(id, 100)).unwrap();

        let job = h.engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Sched);
        assert_eq!(job.eventlog_seq, 3);
        assert_eq!(job.priority, 16);

        let (ops, transitions) = commit_all(&mut h.engine);
        assert_eq!(
            ops,
            vec![
                (id, 0, "submit".to_string()),
                (id, 1, "depend".to_string()),
                (id, 2, "priority".to_string()),
            ]
        );
        let states: Vec<JobState> = transitions.iter().map(|t| t.state()).collect();
        assert_eq!(states, vec![JobState::Depend, JobState::Priority, JobState::Sched]);

        let requests = drain(&mut h.sched);
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            requests[0],
            SchedulerRequest::Alloc { job_id, priority: 16, .. } if job_id == id
        ));
        assert!(h.engine.job(id).unwrap().alloc_pending);

        let journal = drain(&mut h.journal);
        let seqs: Vec<Option<u64>> = journal.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn duplicate_submit_is_rejected() {
        let mut h = harness();
        h.engine.submit(SubmitRequest::new(JobId(1), 1)).unwrap();
        assert_eq!(
            h.engine.submit(SubmitRequest::new(JobId(1), 1)),
            Err(ManagerError::DuplicateJob(JobId(1)))
        );
    }

    #[test]
    fn post_to_unknown_job() {
        let mut h = harness();
        assert_eq!(
            h.engine.set_urgency(JobId(5), 3),
            Err(ManagerError::UnknownJob(JobId(5)))
        );
    }

    #[test]
    fn dependencies_hold_job_in_depend() {
        struct Blocker;
        impl JobtapPlugin for Blocker {
            fn name(&self) -> &str {
                "blocker"
            }
            fn on_transition(
                &mut self,
                job: &Job,
                _entry: &EventEntry,
                _topic: &str,
                _prev: JobState,
                hooks: &mut HookContext,
            ) -> Result<(), PluginError> {
                if job.state == JobState::Depend {
                    hooks.post_event(
                        job.id,
                        "dependency-add",
                        EventEntry::context_from(json!({"description": "after:1"})),
                    );
                }
                Ok(())
            }
        }

        let plugins = PluginRegistry::new().with_plugin(Blocker);
        let mut h = harness_with(ManagerConfig::default(), plugins);
        let id = JobId(2);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        let job = h.engine.job(id).unwrap();
        // The hook's add runs before dispatch's depend.
        assert_eq!(job.state, JobState::Depend);
        assert_eq!(job.dependencies.count(), 1);

        h.engine.remove_dependency(id, "after:1").unwrap();
        assert_eq!(h.engine.job(id).unwrap().state, JobState::Sched);
    }

    #[test]
    fn transition_hook_sees_triggering_entry() {
        struct Recorder(Arc<Mutex<Vec<(String, JobState)>>>);
        impl JobtapPlugin for Recorder {
            fn name(&self) -> &str {
                "recorder"
            }
            fn on_transition(
                &mut self,
                job: &Job,
                entry: &EventEntry,
                _topic: &str,
                _prev: JobState,
                _hooks: &mut HookContext,
            ) -> Result<(), PluginError> {
                self.0.lock().unwrap().push((entry.name.clone(), job.state));
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let plugins = PluginRegistry::new().with_plugin(Recorder(seen.clone()));
        let mut h = harness_with(ManagerConfig::default(), plugins);
        h.engine.submit(SubmitRequest::new(JobId(4), 1)).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("submit".to_string(), JobState::Depend),
                ("depend".to_string(), JobState::Priority),
                ("priority".to_string(), JobState::Sched),
            ]
        );
    }

    #[test]
    fn invalid_event_leaves_job_untouched() {
        let mut h = harness();
        let id = JobId(3);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        let before = h.engine.job(id).unwrap().clone();
        let err = h
            .engine
            .post_event(id, "clean", None, PostFlags::empty())
            .unwrap_err();
        assert_eq!(
            err,
            ManagerError::Fsm(FsmError::InvalidTransition {
                event: "clean".into(),
                state: JobState::Sched,
            })
        );
        assert_eq!(h.engine.job(id).unwrap(), &before);
    }

    #[test]
    fn no_commit_skips_eventlog_and_sequence() {
        let mut h = harness();
        let id = JobId(4);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        commit_all(&mut h.engine);
        let memo = EventEntry::context_from(json!({"note": "hi"}));
        h.engine
            .post_event(id, "memo", memo.clone(), PostFlags::NO_COMMIT)
            .unwrap();
        assert_eq!(h.engine.job(id).unwrap().eventlog_seq, 3);
        h.engine
            .post_event(id, "memo", memo, PostFlags::NO_COMMIT | PostFlags::FORCE_SEQUENCE)
            .unwrap();
        assert_eq!(h.engine.job(id).unwrap().eventlog_seq, 4);

        let (ops, _) = commit_all(&mut h.engine);
        assert!(ops.is_empty());
        let seqs: Vec<Option<u64>> = drain(&mut h.journal).iter().map(|e| e.seq).collect();
        assert_eq!(seqs[3..], [None, Some(3)]);
    }

    #[test]
    fn full_lifecycle_reaches_inactive() {
        let mut h = harness();

        let id = JobId(10);
        h.engine
            .submit(SubmitRequest::new(id, 1).with_flags(JobFlags::WAITABLE))
            .unwrap();
        h.engine.alloc_response(id, AllocOutcome::Granted).unwrap();
        assert_eq!(h.engine.running_jobs(), 1);
        let starts = drain(&mut h.exec);
        assert_eq!(starts, vec![StartRequest { job_id: id, userid: 1 }]);
        assert!(h.engine.job(id).unwrap().start_pending);

        h.engine
            .start_response(id, StartOutcome::Finished { status: 0 })
            .unwrap();
        assert_eq!(h.engine.job(id).unwrap().state, JobState::Cleanup);
        assert_eq!(h.engine.running_jobs(), 1);
        // Resources stay until the final release.
        assert!(drain(&mut h.sched).iter().all(|r| !matches!(r, SchedulerRequest::Free { .. })));

        h.engine
            .start_response(
                id,
                StartOutcome::Released {
                    ranks: "all".into(),
                    is_final: true,
                },
            )
            .unwrap();
        let frees = drain(&mut h.sched);
        assert_eq!(frees, vec![SchedulerRequest::Free { job_id: id }]);

        h.engine.free_response(id).unwrap();
        assert_eq!(h.engine.running_jobs(), 0);
        assert_eq!(h.engine.active_jobs(), 0);
        let job = h.engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Inactive);
        assert_eq!(job.end_event.as_ref().map(|e| e.name.as_str()), Some("finish"));
        assert_eq!(drain(&mut h.wait).len(), 1);
        assert_eq!(h.engine.stats().inactive_retained, 1);

        let (ops, _) = commit_all(&mut h.engine);
        let names: Vec<&str> = ops.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["submit", "depend", "priority", "alloc", "finish", "release", "free", "clean"]
        );
        let seqs: Vec<u64> = ops.iter().map(|(_, s, _)| *s).collect();
        assert_eq!(seqs, (0..8).collect::<Vec<u64>>());
    }

    #[test]
    fn exception_in_run_captures_end_event_once() {
        let mut h = harness();
        let id = running_job(&mut h, 20);
        h.engine.raise_exception(id, "cancel", 0, "user").unwrap();
        h.engine
            .start_response(id, StartOutcome::Finished { status: 15 })
            .unwrap();
        let job = h.engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Cleanup);
        let end = job.end_event.as_ref().unwrap();
        assert_eq!(end.name, "exception");
        assert_eq!(end.get("type"), Some(&json!("cancel")));
    }

    #[test]
    fn exception_in_sched_cancels_alloc() {
        let mut h = harness();
        let id = JobId(21);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        drain(&mut h.sched);

        h.engine.raise_exception(id, "cancel", 0, "").unwrap();
        assert_eq!(drain(&mut h.sched), vec![SchedulerRequest::Cancel { job_id: id }]);
        // Dispatch is idempotent: a second pass sends nothing new.
        let context = EventEntry::context_from(json!({"a": 1}));
        h.engine
            .post_event(id, "memo", context, PostFlags::empty())
            .unwrap();
        assert!(drain(&mut h.sched).is_empty());

        h.engine.alloc_response(id, AllocOutcome::Canceled).unwrap();
        let job = h.engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Inactive);
        assert!(job.trackers_clear());
    }

    #[test]
    fn denied_alloc_raises_exception() {
        let mut h = harness();
        let id = JobId(22);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        h.engine
            .alloc_response(id, AllocOutcome::Denied { note: "unsatisfiable".into() })
            .unwrap();
        let job = h.engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Inactive);
        assert_eq!(job.end_event.as_ref().unwrap().get("note"), Some(&json!("unsatisfiable")));
    }

    #[test]
    fn prolog_holds_start_request() {
        struct Prolog;
        impl JobtapPlugin for Prolog {
            fn name(&self) -> &str {
                "prolog"
            }
            fn on_event(
                &mut self,
                job: &Job,
                entry: &EventEntry,
                hooks: &mut HookContext,
            ) -> Result<(), PluginError> {
                if entry.name == "alloc" {
                    hooks.post_event(job.id, "prolog-start", None);
                }
                Ok(())
            }
        }

        let plugins = PluginRegistry::new().with_plugin(Prolog);
        let mut h = harness_with(ManagerConfig::default(), plugins);
        let id = JobId(30);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        h.engine.alloc_response(id, AllocOutcome::Granted).unwrap();
        // The hook's prolog-start is applied before dispatch for alloc runs.
        assert!(drain(&mut h.exec).is_empty());
        assert_eq!(h.engine.job(id).unwrap().perilog_active, 1);

        h.engine.post_event(id, "prolog-finish", None, PostFlags::empty()).unwrap();
        assert_eq!(drain(&mut h.exec).len(), 1);
        assert!(h.engine.job(id).unwrap().start_pending);
        assert!(h.engine.post_event(id, "prolog-start", None, PostFlags::empty()).is_err());
    }

    #[test]
    fn prolog_before_alloc_defers_start() {
        let mut h = harness();
        let id = JobId(31);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        h.engine.post_event(id, "prolog-start", None, PostFlags::empty()).unwrap();
        h.engine.alloc_response(id, AllocOutcome::Granted).unwrap();
        assert!(drain(&mut h.exec).is_empty());

        h.engine.post_event(id, "prolog-finish", None, PostFlags::empty()).unwrap();
        assert_eq!(drain(&mut h.exec).len(), 1);
    }

    #[test]
    fn urgency_change_reprioritizes() {
        let mut h = harness();
        let id = JobId(40);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        h.engine.set_urgency(id, 31).unwrap();
        let job = h.engine.job(id).unwrap();
        assert_eq!(job.urgency, 31);
        assert_eq!(job.priority, crate::jobtap::PRIORITY_MAX);
        assert_eq!(job.state, JobState::Sched);

        // Same priority again posts nothing.
        let seq = job.eventlog_seq;
        h.engine.set_urgency(id, 31).unwrap();
        assert_eq!(h.engine.job(id).unwrap().eventlog_seq, seq + 1);
    }

    #[test]
    fn later_write_waits_for_earlier_batch() {
        let mut h = harness();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut writes = Vec::new();
        for id in [JobId(30), JobId(31)] {
            h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
            let log = order.clone();
            h.engine.defer_response(Box::new(move || log.lock().unwrap().push(id)));
            let Some(Commit::Write { id: batch, .. }) = h.engine.commit_batch() else {
                panic!("expected a write");
            };
            writes.push(batch);
        }

        // The second write lands first and is held back.
        assert!(h.engine.commit_finished(writes[1], Ok(())).unwrap().is_empty());
        assert!(order.lock().unwrap().is_empty());

        let finished = h.engine.commit_finished(writes[0], Ok(())).unwrap();
        let mut published = Vec::new();
        for mut batch in finished {
            let payload = batch.take_transitions().unwrap();
            published.push(payload.transitions[0].job_id());
            batch.respond();
        }
        assert_eq!(published, vec![JobId(30), JobId(31)]);
        assert_eq!(*order.lock().unwrap(), vec![JobId(30), JobId(31)]);
    }

    #[test]
    fn rejected_followup_is_posted_again() {
        struct RejectFirstDepend {
            rejected: bool,
        }
        impl Journal for RejectFirstDepend {
            fn process(
                &mut self,
                _job_id: JobId,
                _seq: Option<u64>,
                name: &str,
                _entry: &EventEntry,
            ) -> Result<(), LinkError> {
                if name == "depend" && !self.rejected {
                    self.rejected = true;
                    return Err(LinkError::Closed("journal"));
                }
                Ok(())
            }
        }

        let links = Links::new().with_journal(RejectFirstDepend { rejected: false });
        let mut engine = Engine::new(ManagerConfig::default()).with_links(links);
        let id = JobId(42);
        engine.submit(SubmitRequest::new(id, 1)).unwrap();
        let job = engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Depend);
        assert!(!job.depend_posted);

        // The next event for the job dispatches it again.
        let context = EventEntry::context_from(json!({"note": "retry"}));
        engine
            .post_event(id, "memo", context, PostFlags::empty())
            .unwrap();
        assert_eq!(engine.job(id).unwrap().state, JobState::Sched);
    }

    #[test]
    fn held_job_waits_without_alloc_request() {
        let mut h = harness();
        let id = JobId(41);
        h.engine
            .submit(SubmitRequest::new(id, 1).with_urgency(job_core::URGENCY_HOLD))
            .unwrap();
        let job = h.engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Sched);
        assert_eq!(job.priority, crate::jobtap::PRIORITY_MIN);
        assert!(!job.alloc_queued && !job.alloc_pending);
        assert!(drain(&mut h.sched).is_empty());

        // Releasing the hold sends the request.
        h.engine.set_urgency(id, 16).unwrap();
        let requests = drain(&mut h.sched);
        assert!(matches!(
            requests[..],
            [SchedulerRequest::Alloc { job_id, priority: 16, .. }] if job_id == id
        ));

        // Holding again withdraws it.
        h.engine.set_urgency(id, job_core::URGENCY_HOLD).unwrap();
        assert_eq!(
            drain(&mut h.sched),
            vec![SchedulerRequest::Cancel { job_id: id }]
        );
        h.engine.alloc_response(id, AllocOutcome::Canceled).unwrap();
        assert!(drain(&mut h.sched).is_empty());
        let job = h.engine.job(id).unwrap();
        assert_eq!(job.state, JobState::Sched);
        assert!(!job.alloc_queued && !job.alloc_pending);
    }

    #[test]
    fn alloc_limit_queues_and_preempts() {
        let config = ManagerConfig::default().with_alloc_limit(1);
        let registry = PluginRegistry::new().with_plugin(FnPriority::new("by-id", |job: &Job| {
            Some(job.id.0 as i64)
        }));
        let mut h = harness_with(config, registry);

        h.engine.submit(SubmitRequest::new(JobId(1), 1)).unwrap();
        h.engine.submit(SubmitRequest::new(JobId(2), 1)).unwrap();
        let requests = drain(&mut h.sched);
        // Job 1 got the only slot; job 2 outranks it, so job 1 is canceled.
        assert_eq!(
            requests.iter().map(|r| match r {
                SchedulerRequest::Alloc { job_id, .. } => ("alloc", job_id.0),
                SchedulerRequest::Cancel { job_id } => ("cancel", job_id.0),
                SchedulerRequest::Free { job_id } => ("free", job_id.0),
            }).collect::<Vec<_>>(),
            vec![("alloc", 1), ("cancel", 1)]
        );
        assert!(h.engine.job(JobId(2)).unwrap().alloc_queued);

        h.engine.alloc_response(JobId(1), AllocOutcome::Canceled).unwrap();
        let requests = drain(&mut h.sched);
        assert!(matches!(requests[..], [SchedulerRequest::Alloc { job_id: JobId(2), .. }]));
        let one = h.engine.job(JobId(1)).unwrap();
        assert!(one.alloc_queued && !one.alloc_pending);
        assert_eq!(h.engine.stats().outstanding_allocs, 1);
    }

    #[test]
    fn drain_waiters_released_when_idle() {
        let mut h = harness();
        let released = Arc::new(Mutex::new(0));
        let counter = released.clone();
        h.engine.wait_drained(Box::new(move || *counter.lock().unwrap() += 1));
        assert_eq!(*released.lock().unwrap(), 1);

        let id = JobId(50);
        h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
        let counter = released.clone();
        h.engine.wait_drained(Box::new(move || *counter.lock().unwrap() += 1));
        assert_eq!(*released.lock().unwrap(), 1);

        h.engine.raise_exception(id, "cancel", 0, "").unwrap();
        h.engine.alloc_response(id, AllocOutcome::Canceled).unwrap();
        assert_eq!(*released.lock().unwrap(), 2);
    }

    #[test]
    fn inactive_retention_is_bounded() {
        let config = ManagerConfig::default().with_inactive_num_limit(2);
        let mut h = harness_with(config, PluginRegistry::new());
        for id in 1..=3 {
            let id = JobId(id);
            h.engine.submit(SubmitRequest::new(id, 1)).unwrap();
            h.engine.raise_exception(id, "cancel", 0, "").unwrap();
            h.engine.alloc_response(id, AllocOutcome::Canceled).unwrap();
        }
        assert!(h.engine.job(JobId(1)).is_none());
        assert!(h.engine.job(JobId(3)).is_some());
        assert_eq!(h.engine.stats().inactive_retained, 2);
    }

    #[test]
    fn post_to_new_job_is_not_ready() {
        let mut h = harness();
        h.engine.jobs.insert(JobId(60), Job::new(JobId(60)));
        assert_eq!(
            h.engine.post_event(JobId(60), "memo", None, PostFlags::empty()),
            Err(ManagerError::NotReady(JobId(60)))
        );
    }
}
