//! Run history: one auditable record per task invocation

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::str::FromStr;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StorageError;
use crate::scope::Database;

/// Lifecycle of a run record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting for its first attempt or for a retry
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses carry a `finished_at`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(StorageError::Serialization(format!("unknown run status: {}", other))),
        }
    }
}

/// Which surface started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggeredBy {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "cron/cli")]
    CronOrCli,
    #[serde(rename = "dashboard")]
    Dashboard,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::CronOrCli => "cron/cli",
            Self::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggeredBy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "cron/cli" | "cron" | "cli" => Ok(Self::CronOrCli),
            "dashboard" => Ok(Self::Dashboard),
            other => Err(StorageError::Serialization(format!("unknown trigger: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A measurement recorded against a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// One line of a run's narrative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Step that was running when the entry was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<MetricValue>,
    /// Structured detail attached to errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Persisted outcome of one task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    /// Stable across retries of the same invocation
    pub task_id: Uuid,
    pub task_name: String,
    pub status: RunStatus,
    pub triggered_by: TriggeredBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Attempts made so far, counting the current one
    #[serde(default = "first_attempt")]
    pub attempts: u32,
    pub logs: Vec<LogEntry>,
}

fn first_attempt() -> u32 {
    1
}

impl TaskRun {
    /// `finished_at` is set exactly when the status is terminal
    pub fn validate(&self) -> Result<(), StorageError> {
        match (self.status.is_terminal(), self.finished_at.is_some()) {
            (true, false) => Err(StorageError::Invalid(format!(
                "run {} is {} without finished_at",
                self.task_id, self.status
            ))),
            (false, true) => Err(StorageError::Invalid(format!(
                "run {} is {} but has finished_at",
                self.task_id, self.status
            ))),
            _ => Ok(()),
        }
    }

    /// Wall time between start and finish
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|finished| finished - self.started_at)
    }
}

/// Storage for run records
#[async_trait]
pub trait RunHistoryStore: Send + Sync + Debug {
    /// Insert or update the record for `run.task_id`.
    ///
    /// A record that already finished is never changed again; later writes
    /// for it are ignored. The original start time is kept across retries.
    async fn record_run(&self, run: &TaskRun) -> Result<(), StorageError>;

    async fn get_run(&self, task_id: Uuid) -> Result<Option<TaskRun>, StorageError>;

    /// Most recent first
    async fn list_runs(&self, limit: usize) -> Result<Vec<TaskRun>, StorageError>;

    /// Returns whether a record was removed
    async fn delete_run(&self, task_id: Uuid) -> Result<bool, StorageError>;

    /// Remove finished records that ended before `cutoff`
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {}", ms)))
}

/// Run history in the `task_runs` table
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    db: Database,
}

impl SqliteRunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn decode(row: &SqliteRow) -> Result<TaskRun, StorageError> {
        let task_id: String = row.try_get("task_id")?;
        let status: String = row.try_get("status")?;
        let triggered_by: String = row.try_get("triggered_by")?;
        let started_at: i64 = row.try_get("started_at")?;
        let finished_at: Option<i64> = row.try_get("finished_at")?;
        let attempts: i64 = row.try_get("attempts")?;
        let logs: String = row.try_get("logs")?;

        Ok(TaskRun {
            task_id: Uuid::parse_str(&task_id)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            task_name: row.try_get("task_name")?,
            status: status.parse()?,
            triggered_by: triggered_by.parse()?,
            user_id: row.try_get("user_id")?,
            started_at: from_millis(started_at)?,
            finished_at: finished_at.map(from_millis).transpose()?,
            error_message: row.try_get("error_message")?,
            attempts: u32::try_from(attempts).unwrap_or(0),
            logs: serde_json::from_str(&logs)?,
        })
    }
}

#[async_trait]
impl RunHistoryStore for SqliteRunStore {
    async fn record_run(&self, run: &TaskRun) -> Result<(), StorageError> {
        run.validate()?;
        let logs = serde_json::to_string(&run.logs)?;

        self.db
            .client()
            .execute(
                sqlx::query(
                    r#"
                    INSERT INTO task_runs
                        (task_id, task_name, status, triggered_by, user_id,
                         started_at, finished_at, error_message, attempts, logs)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (task_id) DO UPDATE SET
                        status = excluded.status,
                        finished_at = excluded.finished_at,
                        error_message = excluded.error_message,
                        attempts = excluded.attempts,
                        logs = excluded.logs
                    WHERE task_runs.finished_at IS NULL
                    "#,
                )
                .bind(run.task_id.to_string())
                .bind(&run.task_name)
                .bind(run.status.as_str())
                .bind(run.triggered_by.as_str())
                .bind(&run.user_id)
                .bind(to_millis(run.started_at))
                .bind(run.finished_at.map(to_millis))
                .bind(&run.error_message)
                .bind(i64::from(run.attempts))
                .bind(logs),
            )
            .await?;

        Ok(())
    }

    async fn get_run(&self, task_id: Uuid) -> Result<Option<TaskRun>, StorageError> {
        let row = self
            .db
            .client()
            .fetch_optional(
                sqlx::query("SELECT * FROM task_runs WHERE task_id = ?").bind(task_id.to_string()),
            )
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<TaskRun>, StorageError> {
        let rows = self
            .db
            .client()
            .fetch_all(
                sqlx::query("SELECT * FROM task_runs ORDER BY started_at DESC, rowid DESC LIMIT ?")
                    .bind(i64::try_from(limit).unwrap_or(i64::MAX)),
            )
            .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn delete_run(&self, task_id: Uuid) -> Result<bool, StorageError> {
        let result = self
            .db
            .client()
            .execute(sqlx::query("DELETE FROM task_runs WHERE task_id = ?").bind(task_id.to_string()))
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = self
            .db
            .client()
            .execute(
                sqlx::query("DELETE FROM task_runs WHERE finished_at IS NOT NULL AND finished_at < ?")
                    .bind(to_millis(cutoff)),
            )
            .await?;

        Ok(result.rows_affected())
    }
}

/// In-memory run history (development and tests)
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    state: RwLock<MemoryRuns>,
}

#[derive(Debug, Default)]
struct MemoryRuns {
    runs: HashMap<Uuid, (u64, TaskRun)>,
    seq: u64,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunHistoryStore for MemoryRunStore {
    async fn record_run(&self, run: &TaskRun) -> Result<(), StorageError> {
        run.validate()?;
        let mut state = self.state.write().await;

        if let Some((_, existing)) = state.runs.get_mut(&run.task_id) {
            if existing.finished_at.is_none() {
                let started_at = existing.started_at;
                *existing = run.clone();
                existing.started_at = started_at;
            }
            return Ok(());
        }

        state.seq += 1;
        let seq = state.seq;
        state.runs.insert(run.task_id, (seq, run.clone()));
        Ok(())
    }

    async fn get_run(&self, task_id: Uuid) -> Result<Option<TaskRun>, StorageError> {
        let state = self.state.read().await;
        Ok(state.runs.get(&task_id).map(|(_, run)| run.clone()))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<TaskRun>, StorageError> {
        let state = self.state.read().await;
        let mut runs: Vec<_> = state.runs.values().collect();
        runs.sort_by(|(a_seq, a), (b_seq, b)| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b_seq.cmp(a_seq))
        });
        Ok(runs.into_iter().take(limit).map(|(_, run)| run.clone()).collect())
    }

    async fn delete_run(&self, task_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.state.write().await.runs.remove(&task_id).is_some())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut state = self.state.write().await;
        let before = state.runs.len();
        state
            .runs
            .retain(|_, (_, run)| !run.finished_at.is_some_and(|at| at < cutoff));
        Ok((before - state.runs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(status: RunStatus) -> TaskRun {
        let now = Utc::now();
        TaskRun {
            task_id: Uuid::new_v4(),
            task_name: "db-maintenance".into(),
            status,
            triggered_by: TriggeredBy::CronOrCli,
            user_id: None,
            started_at: now,
            finished_at: status.is_terminal().then_some(now),
            error_message: None,
            attempts: 1,
            logs: vec![LogEntry {
                level: LogLevel::Info,
                message: "locked".into(),
                timestamp: now,
                step: Some("lock".into()),
                metric_key: Some("movies.locked".into()),
                metric_value: Some(MetricValue::Int(12)),
                extra: None,
            }],
        }
    }

    #[test]
    fn test_external_shape_is_camel_case() {
        let mut record = run(RunStatus::Succeeded);
        record.user_id = Some("u1".into());
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["taskName"], "db-maintenance");
        assert_eq!(value["triggeredBy"], "cron/cli");
        assert_eq!(value["status"], "succeeded");
        assert_eq!(value["userId"], "u1");
        assert!(value.get("errorMessage").is_none());
        assert_eq!(value["logs"][0]["metricKey"], "movies.locked");
        assert_eq!(value["logs"][0]["metricValue"], json!(12));
    }

    #[test]
    fn test_finished_at_matches_status() {
        assert!(run(RunStatus::Running).validate().is_ok());
        assert!(run(RunStatus::Failed).validate().is_ok());

        let mut broken = run(RunStatus::Succeeded);
        broken.finished_at = None;
        assert!(matches!(broken.validate(), Err(StorageError::Invalid(_))));

        let mut broken = run(RunStatus::Queued);
        broken.finished_at = Some(Utc::now());
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_metric_values_are_untagged() {
        let values: Vec<MetricValue> = serde_json::from_value(json!([3, 1.5, "x"])).unwrap();
        assert_eq!(
            values,
            vec![
                MetricValue::Int(3),
                MetricValue::Float(1.5),
                MetricValue::Text("x".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_store_keeps_finished_runs_immutable() {
        let store = MemoryRunStore::new();
        let mut record = run(RunStatus::Running);
        store.record_run(&record).await.unwrap();

        record.status = RunStatus::Succeeded;
        record.finished_at = Some(Utc::now());
        store.record_run(&record).await.unwrap();

        let mut late = record.clone();
        late.status = RunStatus::Failed;
        late.error_message = Some("late write".into());
        store.record_run(&late).await.unwrap();

        let stored = store.get_run(record.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_lists_most_recent_first() {
        let store = MemoryRunStore::new();
        let first = run(RunStatus::Succeeded);
        let second = run(RunStatus::Succeeded);
        store.record_run(&first).await.unwrap();
        store.record_run(&second).await.unwrap();

        let listed = store.list_runs(10).await.unwrap();
        assert_eq!(listed[0].task_id, second.task_id);
        assert_eq!(listed[1].task_id, first.task_id);
        assert_eq!(store.list_runs(1).await.unwrap().len(), 1);
    }
}
