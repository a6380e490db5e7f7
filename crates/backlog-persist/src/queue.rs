//! Durable job queue in the `jobs` table
//!
//! Several worker processes can share one database file: a claim is a
//! single `UPDATE .. RETURNING` statement, so a waiting job goes to exactly
//! one of them. Each claim writes a fresh token to `locked_by`, and every
//! later write for that job must present it.

use async_trait::async_trait;
use backlog_queue::{JobEntry, JobId, JobStatus, Lease, QueueBackend, QueueError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::runs::{from_millis, to_millis};
use crate::scope::SqliteQuery;

const COLUMNS: &str =
    "id, job_type, payload, status, created_at, run_at, locked_at, locked_by, finished_at, attempts, progress, last_error";

const ORPHANED: &str = "worker lost while the job was running";

/// Durable queue backend using SQLite
#[derive(Debug)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
    closed: AtomicBool,
}

fn backend_error(e: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn delay_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2)
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn decode(row: &SqliteRow) -> Result<JobEntry, QueueError> {
        let id: String = row.try_get("id").map_err(backend_error)?;
        let payload: String = row.try_get("payload").map_err(backend_error)?;
        let status: String = row.try_get("status").map_err(backend_error)?;
        let created_at: i64 = row.try_get("created_at").map_err(backend_error)?;
        let run_at: i64 = row.try_get("run_at").map_err(backend_error)?;
        let finished_at: Option<i64> = row.try_get("finished_at").map_err(backend_error)?;
        let locked_at: Option<i64> = row.try_get("locked_at").map_err(backend_error)?;
        let locked_by: Option<String> = row.try_get("locked_by").map_err(backend_error)?;
        let attempts: i64 = row.try_get("attempts").map_err(backend_error)?;
        let progress: i64 = row.try_get("progress").map_err(backend_error)?;

        Ok(JobEntry {
            id: Uuid::parse_str(&id).map_err(|_| QueueError::Backend("Invalid UUID".into()))?,
            job_type: row.try_get("job_type").map_err(backend_error)?,
            payload: serde_json::from_str(&payload)?,
            status: status.parse::<JobStatus>().map_err(QueueError::Backend)?,
            created_at: from_millis(created_at).map_err(backend_error)?,
            run_at: from_millis(run_at).map_err(backend_error)?,
            finished_at: finished_at
                .map(from_millis)
                .transpose()
                .map_err(backend_error)?,
            locked_at: locked_at.map(from_millis).transpose().map_err(backend_error)?,
            locked_by: locked_by.as_deref().and_then(|token| Uuid::parse_str(token).ok()),
            attempts: u32::try_from(attempts).unwrap_or(0),
            progress: u32::try_from(progress).unwrap_or(0),
            last_error: row.try_get("last_error").map_err(backend_error)?,
        })
    }

    /// Apply an update whose statement ends in
    /// `WHERE id = ? AND status = 'active' AND locked_by = ?`
    async fn update_leased(&self, lease: &Lease, query: SqliteQuery<'_>) -> Result<(), QueueError> {
        let result = query
            .bind(lease.job_id.to_string())
            .bind(lease.token.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        if result.rows_affected() == 0 {
            // Distinguish a missing job from one claimed by someone else
            self.get_job(lease.job_id).await?;
            return Err(QueueError::LeaseLost(lease.job_id));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        delay: Option<Duration>,
    ) -> Result<JobId, QueueError> {
        self.ensure_open()?;

        let now = Utc::now();
        let run_at = to_millis(now).saturating_add(delay_millis(delay.unwrap_or_default()));
        let entry = JobEntry::new(job_type, payload, now);
        let payload = serde_json::to_string(&entry.payload)?;

        sqlx::query(
            "INSERT INTO jobs (id, job_type, payload, status, created_at, run_at, attempts, progress) \
             VALUES (?, ?, ?, 'waiting', ?, ?, 0, 0)",
        )
        .bind(entry.id.to_string())
        .bind(job_type)
        .bind(payload)
        .bind(to_millis(entry.created_at))
        .bind(run_at)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        Ok(entry.id)
    }

    async fn dequeue(&self) -> Result<Option<JobEntry>, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let now = to_millis(Utc::now());
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'active', locked_at = ?, locked_by = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'waiting' AND run_at <= ?
                ORDER BY run_at ASC, created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(now)
        .bind(Uuid::new_v4().to_string())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn complete(&self, lease: &Lease) -> Result<(), QueueError> {
        self.update_leased(
            lease,
            sqlx::query(
                "UPDATE jobs SET status = 'completed', finished_at = ?, locked_at = NULL, locked_by = NULL \
                 WHERE id = ? AND status = 'active' AND locked_by = ?",
            )
            .bind(to_millis(Utc::now())),
        )
        .await
    }

    async fn retry(&self, lease: &Lease, error: String, delay: Duration) -> Result<(), QueueError> {
        let run_at = to_millis(Utc::now()).saturating_add(delay_millis(delay));
        debug!(job_id = %lease.job_id, delay_ms = delay.as_millis() as u64, "Re-queuing job with backoff");

        self.update_leased(
            lease,
            sqlx::query(
                "UPDATE jobs SET status = 'waiting', attempts = attempts + 1, last_error = ?, \
                 run_at = ?, locked_at = NULL, locked_by = NULL \
                 WHERE id = ? AND status = 'active' AND locked_by = ?",
            )
            .bind(error)
            .bind(run_at),
        )
        .await
    }

    async fn fail(&self, lease: &Lease, error: String) -> Result<(), QueueError> {
        self.update_leased(
            lease,
            sqlx::query(
                "UPDATE jobs SET status = 'failed', attempts = attempts + 1, last_error = ?, \
                 finished_at = ?, locked_at = NULL, locked_by = NULL \
                 WHERE id = ? AND status = 'active' AND locked_by = ?",
            )
            .bind(error)
            .bind(to_millis(Utc::now())),
        )
        .await
    }

    async fn heartbeat(&self, lease: &Lease) -> Result<(), QueueError> {
        self.update_leased(
            lease,
            sqlx::query("UPDATE jobs SET locked_at = ? WHERE id = ? AND status = 'active' AND locked_by = ?")
                .bind(to_millis(Utc::now())),
        )
        .await
    }

    async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', finished_at = ? WHERE id = ? AND status = 'waiting'",
        )
        .bind(to_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        if result.rows_affected() == 0 {
            // Distinguish a missing job from one that already started
            self.get_job(id).await?;
            return Err(QueueError::NotWaiting(id));
        }
        Ok(())
    }

    async fn set_progress(&self, lease: &Lease, progress: u32) -> Result<(), QueueError> {
        self.update_leased(
            lease,
            sqlx::query("UPDATE jobs SET progress = ? WHERE id = ? AND status = 'active' AND locked_by = ?")
                .bind(i64::from(progress)),
        )
        .await
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_error)?
            .ok_or(QueueError::NotFound)?;

        Self::decode(&row)
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'cancelled') \
             AND finished_at IS NOT NULL AND finished_at < ?",
        )
        .bind(to_millis(before))
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        Ok(result.rows_affected())
    }

    async fn requeue_stale(&self, before: DateTime<Utc>, max_attempts: u32) -> Result<u64, QueueError> {
        // Every expression on the right sees the row as it was before the update
        let now = to_millis(Utc::now());
        let max_attempts = i64::from(max_attempts);
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                last_error = ?,
                locked_at = NULL,
                locked_by = NULL,
                status = CASE WHEN attempts + 1 >= ? THEN 'failed' ELSE 'waiting' END,
                finished_at = CASE WHEN attempts + 1 >= ? THEN ? ELSE finished_at END,
                run_at = CASE WHEN attempts + 1 >= ? THEN run_at ELSE ? END
            WHERE status = 'active' AND (locked_at IS NULL OR locked_at < ?)
            "#,
        )
        .bind(ORPHANED)
        .bind(max_attempts)
        .bind(max_attempts)
        .bind(now)
        .bind(max_attempts)
        .bind(now)
        .bind(to_millis(before))
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
