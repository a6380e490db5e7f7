//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use uuid::Uuid;

/// Job Identifier
pub type JobId = Uuid;

/// Longest delay a backoff strategy will ever produce.
const MAX_BACKOFF_SECS: u64 = 60 * 60;

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in queue (including jobs scheduled for a retry)
    Waiting,
    /// Claimed by a worker and currently executing
    Active,
    /// Finished successfully
    Completed,
    /// Permanently failed after exhausting retries
    Failed,
    /// Removed from the queue before it started
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the job will never run again.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusive claim on an active job.
///
/// `dequeue` issues a fresh token per claim. State changes made with a lease
/// that was since requeued or re-claimed fail with `QueueError::LeaseLost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub token: Uuid,
}

impl Lease {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            token: Uuid::new_v4(),
        }
    }
}

/// Position of one execution within a job's retry chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub lease: Lease,
    /// 1-based attempt number
    pub number: u32,
    /// No retry follows this attempt, whatever its outcome
    pub is_final: bool,
}

impl Attempt {
    pub fn job_id(&self) -> JobId {
        self.lease.job_id
    }
}

/// Generic Job Trait
#[async_trait::async_trait]
pub trait Job: Send + Sync + Debug {
    /// Job name/type
    fn name(&self) -> &str;

    /// Execute the job
    async fn execute(&mut self, attempt: &Attempt) -> JobResult;

    /// Retries allowed after the first attempt
    fn max_retries(&self) -> u32 {
        3
    }

    /// Backoff strategy
    fn backoff_strategy(&self) -> BackoffStrategy {
        BackoffStrategy::Exponential {
            initial_secs: 1,
            multiplier: 2.0,
        }
    }
}

/// Result of job execution
#[derive(Debug)]
pub enum JobResult {
    /// Job succeeded
    Success,
    /// Job failed but should retry
    Retry(String),
    /// Job failed permanently
    Fatal(String),
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant { secs: u64 },
    Exponential { initial_secs: u64, multiplier: f64 },
}

impl BackoffStrategy {
    /// Delay before the retry that follows `attempt` previous failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Constant { secs } => *secs,
            Self::Exponential {
                initial_secs,
                multiplier,
            } => {
                let exponent = attempt.min(32) as i32;
                (*initial_secs as f64 * multiplier.powi(exponent)) as u64
            }
        };
        Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
    }
}

/// A persisted job entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// When the current claim was taken or last renewed
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    /// Token of the current claim
    #[serde(default)]
    pub locked_by: Option<Uuid>,
    /// Failed attempts so far, counting attempts lost with their worker
    pub attempts: u32,
    pub progress: u32,
    pub last_error: Option<String>,
}

impl JobEntry {
    /// A fresh entry waiting to run at `run_at`.
    pub fn new(job_type: &str, payload: serde_json::Value, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Waiting,
            created_at: Utc::now(),
            run_at,
            finished_at: None,
            locked_at: None,
            locked_by: None,
            attempts: 0,
            progress: 0,
            last_error: None,
        }
    }

    /// The claim held on this entry, if it is active
    pub fn lease(&self) -> Option<Lease> {
        match (self.status, self.locked_by) {
            (JobStatus::Active, Some(token)) => Some(Lease {
                job_id: self.id,
                token,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrips_through_str() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("processing".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let strategy = BackoffStrategy::Exponential {
            initial_secs: 1,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay(40).as_secs(), MAX_BACKOFF_SECS);
    }
}
