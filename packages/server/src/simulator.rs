//! Stand-in scheduler and execution service for local runs.
//!
//! Every alloc is granted. Started jobs run for a short while, finish with
//! status 0 and release all of their resources.

use std::time::Duration;

use job_manager::{
    AllocOutcome, JobManagerHandle, Links, SchedulerRequest, StartOutcome, StartRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Wire simulated services to a manager and return the links for it.
///
/// The manager handle is only known after spawn, so requests are buffered
/// until [`Simulator::attach`] is called.
pub struct Simulator {
    sched_rx: mpsc::UnboundedReceiver<SchedulerRequest>,
    exec_rx: mpsc::UnboundedReceiver<StartRequest>,
    runtime: Duration,
}

impl Simulator {
    pub fn new(runtime: Duration) -> (Self, Links) {
        let (sched_tx, sched_rx) = mpsc::unbounded_channel();
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let links = Links::new().with_scheduler(sched_tx).with_exec(exec_tx);
        (
            Self {
                sched_rx,
                exec_rx,
                runtime,
            },
            links,
        )
    }

    /// Start answering requests on behalf of `manager`.
    pub fn attach(self, manager: JobManagerHandle) -> Vec<JoinHandle<()>> {
        let Simulator {
            mut sched_rx,
            mut exec_rx,
            runtime,
        } = self;

        let scheduler = manager.clone();
        let sched = tokio::spawn(async move {
            while let Some(request) = sched_rx.recv().await {
                let result = match request {
                    SchedulerRequest::Alloc { job_id, priority, .. } => {
                        tracing::info!(
                            "Granting resources to job {} (priority {})",
                            job_id,
                            priority
                        );
                        scheduler.alloc_response(job_id, AllocOutcome::Granted)
                    }
                    SchedulerRequest::Cancel { job_id } => {
                        tracing::info!("Canceling alloc for job {}", job_id);
                        scheduler.alloc_response(job_id, AllocOutcome::Canceled)
                    }
                    SchedulerRequest::Free { job_id } => {
                        tracing::info!("Freeing resources of job {}", job_id);
                        scheduler.free_response(job_id)
                    }
                };
                if let Err(e) = result {
                    tracing::warn!("Simulated scheduler stopping: {}", e);
                    break;
                }
            }
        });

        let exec = tokio::spawn(async move {
            while let Some(request) = exec_rx.recv().await {
                let manager = manager.clone();
                tokio::spawn(async move {
                    tracing::info!("Job {} running for {:?}", request.job_id, runtime);
                    tokio::time::sleep(runtime).await;
                    let finished = manager
                        .start_response(request.job_id, StartOutcome::Finished { status: 0 });
                    let released = manager.start_response(
                        request.job_id,
                        StartOutcome::Released {
                            ranks: "all".to_string(),
                            is_final: true,
                        },
                    );
                    if let Err(e) = finished.and(released) {
                        tracing::warn!("Simulated exec lost job {}: {}", request.job_id, e);
                    }
                });
            }
        });

        vec![sched, exec]
    }
}
