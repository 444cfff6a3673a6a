//! Job manager actor.
//!
//! The actor owns the [`Engine`] and serializes every mutation through its
//! mailbox. Durable writes run on a writer task that applies batches in the
//! order they were committed and reports each completion back as a
//! `CommitDone` message. Publishes run as tracked tasks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use job_core::{Context, EventEntry, EventlogStore, EventlogTxn, Job, JobId, StoreError};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use crate::batch::{BatchId, Commit, CommitTimer, FinishedBatch};
use crate::bus::{BusError, EventBus};
use crate::config::ManagerConfig;
use crate::engine::{AllocOutcome, Engine, EngineStats, PostFlags, StartOutcome, SubmitRequest};
use crate::error::{ManagerError, ManagerResult};
use crate::jobtap::{Jobtap, PluginRegistry};
use crate::links::Links;
use crate::messages::ManagerMessage;

/// Everything the actor needs at startup.
pub struct JobManagerArgs {
    pub config: ManagerConfig,
    pub store: Arc<dyn EventlogStore>,
    pub bus: Arc<dyn EventBus>,
    pub links: Links,
    pub jobtap: Box<dyn Jobtap>,
}

impl JobManagerArgs {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn EventlogStore>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            links: Links::default(),
            jobtap: Box::new(PluginRegistry::new()),
        }
    }

    /// Replace the default links, which drop every request.
    pub fn with_links(mut self, links: Links) -> Self {
        self.links = links;
        self
    }

    pub fn with_jobtap(mut self, jobtap: impl Jobtap + 'static) -> Self {
        self.jobtap = Box::new(jobtap);
        self
    }
}

/// A batch handed to the writer task.
struct CommitJob {
    batch: BatchId,
    txn: EventlogTxn,
    done: oneshot::Sender<Result<(), StoreError>>,
}

/// Commit timer backed by delayed actor messages.
struct ActorTimer {
    actor: ActorRef<ManagerMessage>,
}

impl CommitTimer for ActorTimer {
    fn arm(&mut self, batch: BatchId, delay: Duration) {
        let _ = self
            .actor
            .send_after(delay, move || ManagerMessage::CommitTimer { batch });
    }
}

/// State for the job manager actor.
pub struct JobManagerState {
    engine: Engine,
    bus: Arc<dyn EventBus>,
    writer: mpsc::UnboundedSender<CommitJob>,
    in_flight: BTreeMap<BatchId, oneshot::Receiver<Result<(), StoreError>>>,
    publishes: JoinSet<Result<(), BusError>>,
}

impl JobManagerState {
    fn dispatch_commit(
        &mut self,
        myself: &ActorRef<ManagerMessage>,
        commit: Option<Commit>,
    ) -> ManagerResult<()> {
        match commit {
            None => {}
            Some(Commit::Write { id, txn }) => {
                let (done, rx) = oneshot::channel();
                self.writer
                    .send(CommitJob {
                        batch: id,
                        txn,
                        done,
                    })
                    .map_err(|_| ManagerError::StoreFailure(StoreError::Unavailable))?;
                self.in_flight.insert(id, rx);
            }
            Some(Commit::Ready(batches)) => self.finish(myself, batches),
        }
        Ok(())
    }

    /// Publish, then respond, for each completed batch.
    fn finish(&mut self, myself: &ActorRef<ManagerMessage>, batches: Vec<FinishedBatch>) {
        for mut batch in batches {
            if let Some(payload) = batch.take_transitions() {
                let publish = self
                    .bus
                    .publish(&self.engine.config().state_topic, payload);
                let actor = myself.clone();
                let batch_id = batch.id;
                self.publishes.spawn(async move {
                    let result = publish.await;
                    if let Err(error) = &result {
                        tracing::error!("Publish of batch {} failed: {}", batch_id, error);
                        let _ = actor.send_message(ManagerMessage::PublishFailed {
                            error: error.clone(),
                        });
                    }
                    result
                });
            }
            batch.respond();
        }
    }

    fn reap_publishes(&mut self) {
        while let Some(joined) = self.publishes.try_join_next() {
            if let Err(e) = joined {
                tracing::warn!("Publish task ended abnormally: {}", e);
            }
        }
    }

    async fn complete(
        &mut self,
        myself: &ActorRef<ManagerMessage>,
        batch: BatchId,
        rx: oneshot::Receiver<Result<(), StoreError>>,
    ) -> ManagerResult<()> {
        let result = rx.await.unwrap_or(Err(StoreError::Unavailable));
        let finished = self.engine.commit_finished(batch, result)?;
        self.finish(myself, finished);
        Ok(())
    }

    /// Commit the open batch and wait for every write and publish.
    async fn shutdown(&mut self, myself: &ActorRef<ManagerMessage>) -> ManagerResult<()> {
        let commit = self.engine.commit_batch();
        self.dispatch_commit(myself, commit)?;
        while let Some((batch, rx)) = self.in_flight.pop_first() {
            self.complete(myself, batch, rx).await?;
        }
        while let Some(joined) = self.publishes.join_next().await {
            if let Ok(Err(e)) = joined {
                return Err(ManagerError::PublishFailure(e));
            }
        }
        Ok(())
    }
}

fn spawn_writer(
    store: Arc<dyn EventlogStore>,
    actor: ActorRef<ManagerMessage>,
) -> mpsc::UnboundedSender<CommitJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CommitJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let result = store.commit(job.txn).await;
            let _ = job.done.send(result);
            if actor
                .send_message(ManagerMessage::CommitDone { batch: job.batch })
                .is_err()
            {
                break;
            }
        }
        tracing::debug!("Eventlog writer stopped");
    });
    tx
}

/// Actor that owns the lifecycle engine.
pub struct JobManagerActor;

impl Actor for JobManagerActor {
    type Msg = ManagerMessage;
    type State = JobManagerState;
    type Arguments = JobManagerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting job manager (batch timeout {}ms, alloc limit {:?})",
            args.config.batch_timeout_ms,
            args.config.alloc_limit
        );
        let engine = Engine::new(args.config)
            .with_timer(ActorTimer {
                actor: myself.clone(),
            })
            .with_links(args.links)
            .with_jobtap(args.jobtap);
        let writer = spawn_writer(args.store, myself.clone());
        Ok(JobManagerState {
            engine,
            bus: args.bus,
            writer,
            in_flight: BTreeMap::new(),
            publishes: JoinSet::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ManagerMessage::Submit { request, reply } => match state.engine.submit(request) {
                Ok(()) => state.engine.defer_response(Box::new(move || {
                    let _ = reply.send(Ok(()));
                })),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            ManagerMessage::Post {
                job_id,
                name,
                context,
                flags,
                reply,
            } => match state.engine.post_event(job_id, &name, context, flags) {
                Ok(()) => state.engine.defer_response(Box::new(move || {
                    let _ = reply.send(Ok(()));
                })),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            ManagerMessage::AllocResponse { job_id, outcome } => {
                if let Err(e) = state.engine.alloc_response(job_id, outcome) {
                    tracing::warn!("Alloc response for job {} failed: {}", job_id, e);
                }
            }

            ManagerMessage::StartResponse { job_id, outcome } => {
                if let Err(e) = state.engine.start_response(job_id, outcome) {
                    tracing::warn!("Start response for job {} failed: {}", job_id, e);
                }
            }

            ManagerMessage::FreeResponse { job_id } => {
                if let Err(e) = state.engine.free_response(job_id) {
                    tracing::warn!("Free response for job {} failed: {}", job_id, e);
                }
            }

            ManagerMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.engine.job(job_id).cloned());
            }

            ManagerMessage::Stats { reply } => {
                let _ = reply.send(state.engine.stats());
            }

            ManagerMessage::WaitDrained { reply } => {
                state.engine.wait_drained(Box::new(move || {
                    let _ = reply.send(());
                }));
            }

            ManagerMessage::Flush => {
                let commit = state.engine.commit_batch();
                state.dispatch_commit(&myself, commit)?;
            }

            ManagerMessage::CommitTimer { batch } => {
                let commit = state.engine.commit_on_timer(batch);
                state.dispatch_commit(&myself, commit)?;
            }

            ManagerMessage::CommitDone { batch } => {
                if let Some(rx) = state.in_flight.remove(&batch) {
                    state.complete(&myself, batch, rx).await?;
                }
            }

            ManagerMessage::PublishFailed { error } => {
                return Err(ManagerError::PublishFailure(error).into());
            }

            ManagerMessage::Shutdown { reply } => {
                tracing::info!("Shutting down job manager");
                let outcome = state.shutdown(&myself).await;
                if let Err(e) = &outcome {
                    tracing::error!("Job manager shutdown failed: {}", e);
                }
                let _ = reply.send(outcome);
                myself.stop(None);
                return Ok(());
            }
        }

        state.reap_publishes();
        Ok(())
    }
}

/// Client handle for a running job manager.
#[derive(Clone)]
pub struct JobManagerHandle {
    actor: ActorRef<ManagerMessage>,
}

impl JobManagerHandle {
    pub fn new(actor: ActorRef<ManagerMessage>) -> Self {
        Self { actor }
    }

    pub fn actor(&self) -> &ActorRef<ManagerMessage> {
        &self.actor
    }

    async fn call<T, F>(&self, build: F) -> ManagerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> ManagerMessage,
    {
        match ractor::rpc::call(&self.actor, build, None).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(ManagerError::Actor("call timed out".into())),
            Ok(CallResult::SenderError) => {
                Err(ManagerError::Actor("job manager dropped the reply".into()))
            }
            Err(_) => Err(ManagerError::Actor("job manager is not running".into())),
        }
    }

    fn cast(&self, message: ManagerMessage) -> ManagerResult<()> {
        self.actor
            .send_message(message)
            .map_err(|_| ManagerError::Actor("job manager is not running".into()))
    }

    /// Submit a job; returns once its submit entry is durable.
    pub async fn submit(&self, request: SubmitRequest) -> ManagerResult<()> {
        self.call(|reply| ManagerMessage::Submit { request, reply })
            .await?
    }

    /// Post an event; returns once it is durable.
    pub async fn post_event(
        &self,
        job_id: JobId,
        name: impl Into<String>,
        context: Option<Context>,
        flags: PostFlags,
    ) -> ManagerResult<()> {
        let name = name.into();
        self.call(|reply| ManagerMessage::Post {
            job_id,
            name,
            context,
            flags,
            reply,
        })
        .await?
    }

    pub async fn raise_exception(
        &self,
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
        .await
    }

    pub async fn set_urgency(&self, job_id: JobId, urgency: i32) -> ManagerResult<()> {
        let context = json!({ "urgency": urgency });
        self.post_event(job_id, "urgency", EventEntry::context_from(context), PostFlags::empty())
            .await
    }

    /// Deliver the scheduler's answer to an alloc request.
    pub fn alloc_response(&self, job_id: JobId, outcome: AllocOutcome) -> ManagerResult<()> {
        self.cast(ManagerMessage::AllocResponse { job_id, outcome })
    }

    /// Deliver a progress report from the execution service.
    pub fn start_response(&self, job_id: JobId, outcome: StartOutcome) -> ManagerResult<()> {
        self.cast(ManagerMessage::StartResponse { job_id, outcome })
    }

    /// Deliver the scheduler's acknowledgement of a free request.
    pub fn free_response(&self, job_id: JobId) -> ManagerResult<()> {
        self.cast(ManagerMessage::FreeResponse { job_id })
    }

    /// Commit the open batch without waiting for its timer.
    pub fn flush(&self) -> ManagerResult<()> {
        self.cast(ManagerMessage::Flush)
    }

    pub async fn get_job(&self, job_id: JobId) -> ManagerResult<Option<Job>> {
        self.call(|reply| ManagerMessage::GetJob { job_id, reply })
            .await
    }

    pub async fn stats(&self) -> ManagerResult<EngineStats> {
        self.call(|reply| ManagerMessage::Stats { reply }).await
    }

    /// Wait until no job is active.
    pub async fn wait_drained(&self) -> ManagerResult<()> {
        self.call(|reply| ManagerMessage::WaitDrained { reply })
            .await
    }

    /// Flush and stop the actor.
    pub async fn shutdown(&self) -> ManagerResult<()> {
        self.call(|reply| ManagerMessage::Shutdown { reply })
            .await?
    }
}

/// Start a job manager actor.
pub async fn start_job_manager(
    args: JobManagerArgs,
) -> Result<(JobManagerHandle, JoinHandle<()>), ractor::SpawnErr> {
    let (actor, handle) = Actor::spawn(None, JobManagerActor, args).await?;
    Ok((JobManagerHandle::new(actor), handle))
}
