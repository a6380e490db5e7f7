//! # backlog-queue
//!
//! Async job queue for background task processing.
//!
//! Features:
//! - Generic `Job` trait
//! - Pluggable backend (in-memory here, SQLite in `backlog-persist`)
//! - Worker pool with bounded concurrency and graceful drain
//! - Retry with exponential backoff

pub mod backend;
pub mod job;
pub mod memory;
pub mod worker;

pub use backend::{QueueBackend, QueueError};
pub use job::{Attempt, BackoffStrategy, Job, JobEntry, JobId, JobResult, JobStatus, Lease};
pub use memory::MemoryQueue;
pub use worker::{panic_message, WorkerConfig, WorkerError, WorkerPool};
