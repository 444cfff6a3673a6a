//! `jobmgrd`: runs the job manager against SurrealDB with simulated
//! scheduler and execution services.

mod config;
mod simulator;

use std::sync::Arc;
use std::time::Duration;

use db::SurrealEventlogStore;
use db::repositories::EventlogRepository;
use job_core::JobId;
use job_manager::{
    BroadcastBus, BroadcastJournal, JobManagerArgs, JobManagerHandle, SubmitRequest,
    start_job_manager,
};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::ServerConfig;
use crate::simulator::Simulator;

const SIMULATED_RUNTIME: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!("Starting jobmgrd with {:?}", config.manager);

    let database = db::init(&config.db).await?;
    let store = SurrealEventlogStore::new(database.clone());

    let bus = BroadcastBus::default();
    let journal = BroadcastJournal::new(1024);
    log_transitions(bus.subscribe());
    log_journal(journal.subscribe());

    let (simulator, links) = Simulator::new(SIMULATED_RUNTIME);
    let args = JobManagerArgs::new(config.manager.clone(), Arc::new(store), Arc::new(bus))
        .with_links(links.with_journal(journal));
    let (manager, actor_handle) = start_job_manager(args).await?;
    let services = simulator.attach(manager.clone());

    submit_demo_jobs(&manager, config.demo_jobs).await?;

    if config.demo_jobs == 0 {
        tracing::info!("No demo jobs, waiting for ctrl-c");
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::select! {
            drained = manager.wait_drained() => {
                drained?;
                tracing::info!("All demo jobs are inactive");
            }
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        }
    }

    manager.shutdown().await?;
    actor_handle.await?;
    for service in services {
        service.abort();
    }

    let repo = EventlogRepository::new(database);
    for job_id in repo.job_ids().await? {
        let names: Vec<String> = repo.read(job_id).await?.into_iter().map(|e| e.name).collect();
        tracing::info!("Job {} eventlog: {}", job_id, names.join(" "));
    }

    Ok(())
}

async fn submit_demo_jobs(
    manager: &JobManagerHandle,
    count: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    for i in 1..=count {
        // Spread urgencies so the priority order is visible in the log.
        // Urgency 0 would hold the job in SCHED forever.
        let urgency = 8 + (i % 3) as i32 * 8;
        let request = SubmitRequest::new(JobId(i), 1000).with_urgency(urgency);
        manager.submit(request).await?;
        tracing::info!("Submitted job {} with urgency {}", i, urgency);
    }
    Ok(())
}

fn log_transitions(mut rx: broadcast::Receiver<job_manager::Published>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(published) => {
                    for transition in &published.payload.transitions {
                        tracing::info!(
                            "[{}] job {} -> {}",
                            published.topic,
                            transition.job_id(),
                            transition.state().as_str()
                        );
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} transition batches", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn log_journal(mut rx: broadcast::Receiver<job_core::JournalEntry>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(entry) => tracing::debug!("journal: {}", entry.description()),
                Err(RecvError::Lagged(n)) => tracing::warn!("Journal lagged by {} entries", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
