//! SurrealDB integration for the job manager.
//!
//! This crate provides a durable [`job_core::EventlogStore`] backed by
//! SurrealDB, plus a repository for reading eventlogs back.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
mod store;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use schema::init_schema;
pub use store::SurrealEventlogStore;

/// Connect with the given configuration and make sure the schema exists.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}
