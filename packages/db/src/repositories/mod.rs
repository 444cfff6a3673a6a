//! Repository implementations for database operations.

mod eventlog_repo;

pub use eventlog_repo::{EventlogRecord, EventlogRepository};
