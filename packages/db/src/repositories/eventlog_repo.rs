//! Eventlog repository.

use job_core::{AppendOp, EventEntry, JobId};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

/// One eventlog line as stored in the `eventlog` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventlogRecord {
    pub key: String,
    pub job_id: i64,
    pub seq: i64,
    pub line: String,
}

impl EventlogRecord {
    pub fn from_op(op: &AppendOp) -> Result<Self, DbError> {
        let job_id = i64::try_from(op.job_id.0)
            .map_err(|_| DbError::Serialization(format!("job id {} out of range", op.job_id)))?;
        let seq = i64::try_from(op.seq)
            .map_err(|_| DbError::Serialization(format!("seq {} out of range", op.seq)))?;
        Ok(Self {
            key: op.key.clone(),
            job_id,
            seq,
            line: op.line.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct JobRow {
    job_id: i64,
}

/// Read and append access to stored eventlogs.
#[derive(Clone)]
pub struct EventlogRepository {
    db: Database,
}

impl EventlogRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a single line outside of any batch.
    pub async fn append(&self, op: &AppendOp) -> Result<(), DbError> {
        let record = EventlogRecord::from_op(op)?;
        self.db
            .query("CREATE eventlog CONTENT $record")
            .bind(("record", record))
            .await?
            .check()?;
        Ok(())
    }

    /// Raw lines of a job's eventlog in sequence order.
    pub async fn lines(&self, job_id: JobId) -> Result<Vec<String>, DbError> {
        let mut response = self
            .db
            .query("SELECT key, job_id, seq, line FROM eventlog WHERE key = $key ORDER BY seq ASC")
            .bind(("key", job_id.eventlog_key()))
            .await?;
        let records: Vec<EventlogRecord> = response.take(0)?;
        Ok(records.into_iter().map(|r| r.line).collect())
    }

    /// Decoded entries of a job's eventlog in sequence order.
    pub async fn read(&self, job_id: JobId) -> Result<Vec<EventEntry>, DbError> {
        self.lines(job_id)
            .await?
            .iter()
            .map(|line| EventEntry::decode(line).map_err(|e| DbError::Serialization(e.to_string())))
            .collect()
    }

    /// The sequence number the next line of `job_id` must use.
    pub async fn next_seq(&self, job_id: JobId) -> Result<u64, DbError> {
        let mut response = self
            .db
            .query("SELECT count() AS count FROM eventlog WHERE key = $key GROUP ALL")
            .bind(("key", job_id.eventlog_key()))
            .await?;
        let row: Option<CountRow> = response.take(0)?;
        Ok(row.map_or(0, |r| r.count.max(0) as u64))
    }

    /// Every job with at least one stored line, in ascending order.
    pub async fn job_ids(&self) -> Result<Vec<JobId>, DbError> {
        let mut response = self
            .db
            .query("SELECT job_id FROM eventlog GROUP BY job_id")
            .await?;
        let rows: Vec<JobRow> = response.take(0)?;
        let mut ids: Vec<JobId> = rows.into_iter().map(|r| JobId(r.job_id as u64)).collect();
        ids.sort();
        Ok(ids)
    }
}
