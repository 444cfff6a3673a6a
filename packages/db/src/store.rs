//! SurrealDB-backed eventlog store.

use job_core::{EventlogStore, EventlogTxn, StoreError, StoreFuture};

use crate::repositories::EventlogRecord;
use crate::{Database, DbError};

/// Appends each commit batch in a single SurrealDB transaction.
#[derive(Clone)]
pub struct SurrealEventlogStore {
    db: Database,
}

impl SurrealEventlogStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn write(db: Database, txn: EventlogTxn) -> Result<(), DbError> {
        let records = txn
            .ops()
            .iter()
            .map(EventlogRecord::from_op)
            .collect::<Result<Vec<_>, _>>()?;
        let count = records.len();

        db.query(COMMIT_BATCH)
            .bind(("records", records))
            .await?
            .check()?;

        tracing::debug!("Committed {} eventlog lines", count);
        Ok(())
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl EventlogStore for SurrealEventlogStore {
    fn commit(&self, txn: EventlogTxn) -> StoreFuture {
        let db = self.db.clone();
        Box::pin(async move {
            if txn.is_empty() {
                return Ok(());
            }
            Self::write(db, txn).await.map_err(|e| {
                tracing::error!("Eventlog transaction failed: {}", e);
                StoreError::from(e)
            })
        })
    }
}

/// All lines of a batch land together or not at all.
const COMMIT_BATCH: &str = r#"
BEGIN TRANSACTION;
INSERT INTO eventlog $records;
COMMIT TRANSACTION;
"#;
