//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates the eventlog table and its indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(EVENTLOG_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Eventlog table schema. One row per eventlog line.
const EVENTLOG_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS eventlog SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS key ON eventlog TYPE string;
DEFINE FIELD IF NOT EXISTS job_id ON eventlog TYPE int;
DEFINE FIELD IF NOT EXISTS seq ON eventlog TYPE int;
DEFINE FIELD IF NOT EXISTS line ON eventlog TYPE string;
DEFINE FIELD IF NOT EXISTS created_at ON eventlog TYPE datetime DEFAULT time::now();

-- A sequence number is written at most once per eventlog
DEFINE INDEX IF NOT EXISTS eventlog_key_seq ON eventlog FIELDS key, seq UNIQUE;
DEFINE INDEX IF NOT EXISTS eventlog_job ON eventlog FIELDS job_id;
"#;
