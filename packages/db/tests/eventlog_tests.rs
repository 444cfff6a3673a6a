mod common;

use std::error::Error;
use std::sync::Arc;

use job_core::{AppendOp, EventEntry, EventlogStore, EventlogTxn, JobId, StoreError};
use job_manager::{BroadcastBus, JobManagerArgs, ManagerConfig, SubmitRequest, start_job_manager};
use serde_json::json;

use db::SurrealEventlogStore;
use db::repositories::EventlogRepository;

fn entry(timestamp: f64, name: &str) -> EventEntry {
    EventEntry::new(timestamp, name, None)
}

#[tokio::test]
async fn test_batch_commit_and_read_back() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let store = SurrealEventlogStore::new(db.clone());
    let repo = EventlogRepository::new(db);

    let mut txn = EventlogTxn::new();
    txn.append(JobId(1), 0, &entry(1.0, "submit"))?;
    txn.append(JobId(2), 0, &entry(1.5, "submit"))?;
    txn.append(JobId(1), 1, &entry(2.0, "depend"))?;
    txn.append(
        JobId(1),
        2,
        &EventEntry::new(3.0, "priority", EventEntry::context_from(json!({"priority": 16}))),
    )?;
    store.commit(txn).await?;

    let log = repo.read(JobId(1)).await?;
    let names: Vec<&str> = log.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["submit", "depend", "priority"]);
    assert_eq!(log[2].get("priority"), Some(&json!(16)));

    assert_eq!(repo.lines(JobId(2)).await?.len(), 1);
    assert_eq!(repo.next_seq(JobId(1)).await?, 3);
    assert_eq!(repo.next_seq(JobId(3)).await?, 0);
    assert_eq!(repo.job_ids().await?, vec![JobId(1), JobId(2)]);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_seq_rolls_back_whole_batch() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let store = SurrealEventlogStore::new(db.clone());
    let repo = EventlogRepository::new(db);

    let mut first = EventlogTxn::new();
    first.append(JobId(1), 0, &entry(1.0, "submit"))?;
    store.commit(first).await?;

    let mut second = EventlogTxn::new();
    second.append(JobId(2), 0, &entry(2.0, "submit"))?;
    second.append(JobId(1), 0, &entry(2.0, "submit"))?;
    let result = store.commit(second).await;
    assert!(matches!(result, Err(StoreError::Backend(_))));

    assert!(repo.lines(JobId(2)).await?.is_empty());
    assert_eq!(repo.lines(JobId(1)).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_empty_batch_is_a_no_op() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let store = SurrealEventlogStore::new(db.clone());

    store.commit(EventlogTxn::new()).await?;
    assert!(EventlogRepository::new(db).job_ids().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_single_append() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let repo = EventlogRepository::new(db);

    let op = AppendOp {
        key: JobId(9).eventlog_key(),
        job_id: JobId(9),
        seq: 0,
        line: entry(1.0, "submit").encode()?,
    };
    repo.append(&op).await?;
    assert!(repo.append(&op).await.is_err());

    assert_eq!(repo.read(JobId(9)).await?, vec![entry(1.0, "submit")]);
    Ok(())
}

#[tokio::test]
async fn test_manager_commits_through_surreal() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let store = SurrealEventlogStore::new(db.clone());
    let repo = EventlogRepository::new(db);

    let args = JobManagerArgs::new(
        ManagerConfig::default().with_batch_timeout_ms(5),
        Arc::new(store),
        Arc::new(BroadcastBus::default()),
    );
    let (manager, handle) = start_job_manager(args).await?;

    manager.submit(SubmitRequest::new(JobId(42), 1000)).await?;

    let names: Vec<String> = repo
        .read(JobId(42))
        .await?
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["submit", "depend", "priority"]);

    manager.shutdown().await?;
    handle.await?;
    Ok(())
}
