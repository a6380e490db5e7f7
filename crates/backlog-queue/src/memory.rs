//! In-memory queue implementation with run-time ordering

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{QueueBackend, QueueError};
use crate::job::{JobEntry, JobId, JobStatus, Lease};

/// Priority entry for the heap - orders by run_at time (earliest first), then insertion order
#[derive(Debug, Clone, Eq, PartialEq)]
struct PriorityEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: earlier run_at = higher priority
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, JobEntry>,
    queue: BinaryHeap<PriorityEntry>,
    seq: u64,
}

impl State {
    fn schedule(&mut self, id: JobId, run_at: DateTime<Utc>) {
        self.seq += 1;
        let seq = self.seq;
        self.queue.push(PriorityEntry { run_at, seq, id });
    }

    /// The job `lease` still holds
    fn leased(&mut self, lease: &Lease) -> Result<&mut JobEntry, QueueError> {
        let job = self.jobs.get_mut(&lease.job_id).ok_or(QueueError::NotFound)?;
        if job.status != JobStatus::Active || job.locked_by != Some(lease.token) {
            return Err(QueueError::LeaseLost(lease.job_id));
        }
        Ok(job)
    }
}

fn release(job: &mut JobEntry) {
    job.locked_at = None;
    job.locked_by = None;
}

/// Process-local queue backend.
///
/// Jobs live only as long as the process; use it for development and tests.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: RwLock<State>,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs in any status.
    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueError> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let run_at = Utc::now() + to_chrono(delay.unwrap_or_default());
        let entry = JobEntry::new(job_type, payload, run_at);
        let id = entry.id;

        let mut state = self.state.write().await;
        state.jobs.insert(id, entry);
        state.schedule(id, run_at);

        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<JobEntry>, QueueError> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Ok(None);
        }

        let mut state = self.state.write().await;
        let now = Utc::now();

        while let Some(entry) = state.queue.peek() {
            if entry.run_at > now {
                break;
            }
            let Some(entry) = state.queue.pop() else {
                break;
            };

            // Cancelled jobs and superseded schedule entries stay in the heap; skip them
            if let Some(job) = state.jobs.get_mut(&entry.id) {
                if job.status == JobStatus::Waiting && job.run_at == entry.run_at {
                    job.status = JobStatus::Active;
                    job.locked_at = Some(now);
                    job.locked_by = Some(Uuid::new_v4());
                    return Ok(Some(job.clone()));
                }
            }
        }

        Ok(None)
    }

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let job = state.leased(lease)?;
        job.status = JobStatus::Completed;
        job.finished_at = Some(Utc::now());
        release(job);
        Ok(())
    }

    async fn retry(&self, lease: &Lease, error: String, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let run_at = Utc::now() + to_chrono(delay);
        let job = state.leased(lease)?;
        job.status = JobStatus::Waiting;
        job.attempts += 1;
        job.last_error = Some(error);
        job.run_at = run_at;
        release(job);

        tracing::debug!(
            job_id = %lease.job_id,
            attempts = job.attempts,
            delay_ms = delay.as_millis() as u64,
            "Re-queuing job with backoff"
        );

        state.schedule(lease.job_id, run_at);
        Ok(())
    }

    async fn fail(&self, lease: &Lease, error: String) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let job = state.leased(lease)?;
        job.status = JobStatus::Failed;
        job.attempts += 1;
        job.last_error = Some(error);
        job.finished_at = Some(Utc::now());
        release(job);
        Ok(())
    }

    async fn heartbeat(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        state.leased(lease)?.locked_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        if job.status != JobStatus::Waiting {
            return Err(QueueError::NotWaiting(id));
        }
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn set_progress(&self, lease: &Lease, progress: u32) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        state.leased(lease)?.progress = progress;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let state = self.state.read().await;
        state.jobs.get(&id).cloned().ok_or(QueueError::NotFound)
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut state = self.state.write().await;
        let initial = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_finished() && job.finished_at.is_some_and(|at| at < before))
        });
        Ok((initial - state.jobs.len()) as u64)
    }

    async fn requeue_stale(&self, before: DateTime<Utc>, max_attempts: u32) -> Result<u64, QueueError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Active && job.locked_at.map_or(true, |at| at < before)
            })
            .map(|job| job.id)
            .collect();

        for id in &stale {
            let Some(job) = state.jobs.get_mut(id) else {
                continue;
            };
            job.attempts += 1;
            job.last_error = Some("worker lost while the job was running".to_string());
            release(job);
            if job.attempts >= max_attempts {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
            } else {
                job.status = JobStatus::Waiting;
                job.run_at = now;
                state.schedule(*id, now);
            }
        }
        Ok(stale.len() as u64)
    }

    async fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
    }
}
