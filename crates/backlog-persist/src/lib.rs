//! # backlog-persist
//!
//! SQLite storage for the background task subsystem.
//!
//! - Connection setup and migrations
//! - Ambient transactional scope (`Database::with_transaction`, `Database::client`)
//! - Run history store (SQLite and in-memory)
//! - Durable job queue backend
//! - Media data access used by task handlers

pub mod error;
pub mod media;
pub mod queue;
pub mod runs;
pub mod scope;
pub mod sqlite;

pub use error::StorageError;
pub use media::{Achievement, DeletedUser, ImportedEntry, MediaRecord, MediaStore, NewMedia};
pub use queue::SqliteQueueBackend;
pub use runs::{
    LogEntry, LogLevel, MemoryRunStore, MetricValue, RunHistoryStore, RunStatus, SqliteRunStore,
    TaskRun, TriggeredBy,
};
pub use scope::{Database, DbClient, SqliteQuery};
pub use sqlite::SqliteConfig;
