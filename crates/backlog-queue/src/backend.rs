//! Queue Backend Trait

use crate::job::{JobEntry, JobId, Lease};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found")]
    NotFound,
    #[error("Job {0} is no longer waiting")]
    NotWaiting(JobId),
    #[error("Job {0} is no longer held by this worker")]
    LeaseLost(JobId),
    #[error("Queue is closed")]
    Closed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a job payload, optionally delayed
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueError>;

    /// Claim the next job whose run time has come; it becomes `Active` and
    /// carries a fresh lease (`JobEntry::lease`). Returns `None` once closed.
    async fn dequeue(&self) -> Result<Option<JobEntry>, QueueError>;

    /// Mark a leased job as completed
    async fn complete(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Put a leased job back to `Waiting` after `delay`, counting one failed attempt
    async fn retry(&self, lease: &Lease, error: String, delay: Duration) -> Result<(), QueueError>;

    /// Mark a leased job as permanently failed
    async fn fail(&self, lease: &Lease, error: String) -> Result<(), QueueError>;

    /// Renew a lease so `requeue_stale` leaves the job alone
    async fn heartbeat(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Remove a job that has not started yet
    async fn cancel(&self, id: JobId) -> Result<(), QueueError>;

    /// Record a progress counter for a leased job
    async fn set_progress(&self, lease: &Lease, progress: u32) -> Result<(), QueueError>;

    /// Get a job by id
    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError>;

    /// Delete finished jobs older than `before`, returning how many were removed
    async fn prune(&self, before: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Recover jobs whose lease was last renewed before `before`.
    ///
    /// The lost attempt counts as a failed one. A job that reaches
    /// `max_attempts` this way is marked `Failed`; the rest go back to
    /// `Waiting` and their handlers run again. Returns how many jobs were
    /// touched.
    async fn requeue_stale(&self, before: DateTime<Utc>, max_attempts: u32) -> Result<u64, QueueError>;

    /// Release backend resources; later calls may fail with `QueueError::Closed`
    async fn close(&self) {}
}
