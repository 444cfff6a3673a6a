use db::{Database, DbConfig, DbError};

/// Every call gets its own in-memory datastore.
pub async fn setup_db() -> Result<Database, DbError> {
    db::init(&DbConfig::memory()).await
}
