//! Execution context handed to task handlers
//!
//! Collects the run's narrative (steps, log lines, metrics) in memory and
//! turns it into a [`TaskRun`] once the handler settles.

use async_trait::async_trait;
use backlog_persist::{Database, LogEntry, LogLevel, MetricValue, RunStatus, TaskRun, TriggeredBy};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::TaskError;
use crate::registry::TaskName;

/// Receives progress updates for the job behind a run
#[async_trait]
pub trait ProgressSink: Send + Sync + Debug {
    async fn report(&self, progress: u32);
}

/// Identity of one task invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMeta {
    pub task_id: Uuid,
    pub task_name: TaskName,
    pub triggered_by: TriggeredBy,
    pub user_id: Option<String>,
}

#[derive(Debug)]
struct Buffer {
    logs: Vec<LogEntry>,
    steps: Vec<String>,
    last_timestamp: DateTime<Utc>,
    progress: u32,
}

#[derive(Debug)]
pub struct ExecutionContext {
    meta: RunMeta,
    db: Database,
    started_at: DateTime<Utc>,
    attempt: u32,
    deadline: Option<Instant>,
    progress_sink: Option<Arc<dyn ProgressSink>>,
    buffer: Mutex<Buffer>,
}

impl ExecutionContext {
    pub fn new(meta: RunMeta, db: Database) -> Self {
        let started_at = Utc::now();
        Self {
            meta,
            db,
            started_at,
            attempt: 1,
            deadline: None,
            progress_sink: None,
            buffer: Mutex::new(Buffer {
                logs: Vec::new(),
                steps: Vec::new(),
                last_timestamp: started_at,
                progress: 0,
            }),
        }
    }

    /// Steps that would start after `timeout` from now fail instead
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    pub fn task_id(&self) -> Uuid {
        self.meta.task_id
    }

    pub fn task_name(&self) -> TaskName {
        self.meta.task_name
    }

    pub fn triggered_by(&self) -> TriggeredBy {
        self.meta.triggered_by
    }

    pub fn user_id(&self) -> Option<&str> {
        self.meta.user_id.as_deref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Time left before the deadline; `Err` once it has passed
    fn remaining(&self, step: &str) -> Result<Option<Duration>, TaskError> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(TaskError::DeadlineExceeded(format!(
                        "deadline passed before step {}",
                        step
                    )))
                } else {
                    Ok(Some(deadline - now))
                }
            }
        }
    }

    /// Run one named step.
    ///
    /// Steps run one after another; a failed step is logged and its error is
    /// returned, so `?` aborts the rest of the handler.
    pub async fn step<T, F, Fut>(&self, name: &str, f: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let remaining = match self.remaining(name) {
            Ok(remaining) => remaining,
            Err(e) => {
                self.push(LogLevel::Error, e.to_string(), None, None);
                return Err(e);
            }
        };

        self.buffer().steps.push(name.to_string());
        self.info(format!("Step {} started", name));
        let started = Instant::now();

        let span = info_span!(
            "step",
            task = %self.meta.task_name,
            task_id = %self.meta.task_id,
            step = name
        );
        let work = f().instrument(span);
        let outcome = match remaining {
            Some(remaining) => match tokio::time::timeout(remaining, work).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskError::DeadlineExceeded(format!(
                    "step {} ran past the deadline",
                    name
                ))),
            },
            None => work.await,
        };

        let elapsed_ms = started.elapsed().as_millis();
        match &outcome {
            Ok(_) => self.info(format!("Step {} finished in {}ms", name, elapsed_ms)),
            Err(e) => self.error(format!("Step {} failed: {}", name, e), None),
        }
        self.buffer().steps.pop();
        outcome
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into(), None, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into(), None, None);
    }

    /// Error line with optional structured detail
    pub fn error(&self, message: impl Into<String>, extra: Option<serde_json::Value>) {
        self.push(LogLevel::Error, message.into(), None, extra);
    }

    /// Record a measurement against the run
    pub fn metric(&self, key: &str, value: impl Into<MetricValue>) {
        let value = value.into();
        self.push(
            LogLevel::Info,
            format!("{} = {}", key, value),
            Some((key.to_string(), value)),
            None,
        );
    }

    /// Report progress (clamped to 0..=100) to the job behind this run.
    ///
    /// The sink writes through the pool, so call this outside transactions.
    pub async fn progress(&self, progress: u32) {
        let progress = progress.min(100);
        self.buffer().progress = progress;
        if let Some(sink) = &self.progress_sink {
            sink.report(progress).await;
        }
    }

    pub fn current_progress(&self) -> u32 {
        self.buffer().progress
    }

    fn push(
        &self,
        level: LogLevel,
        message: String,
        metric: Option<(String, MetricValue)>,
        extra: Option<serde_json::Value>,
    ) {
        let task = self.meta.task_name.as_str();
        let task_id = self.meta.task_id;
        let mut buffer = self.buffer();
        let step = buffer.steps.last().cloned();

        match level {
            LogLevel::Info => info!(task, %task_id, step = step.as_deref(), "{}", message),
            LogLevel::Warn => warn!(task, %task_id, step = step.as_deref(), "{}", message),
            LogLevel::Error => error!(task, %task_id, step = step.as_deref(), extra = ?extra, "{}", message),
        }

        // Timestamps never go backwards, even if the wall clock does
        let timestamp = Utc::now().max(buffer.last_timestamp);
        buffer.last_timestamp = timestamp;

        let (metric_key, metric_value) = match metric {
            Some((key, value)) => (Some(key), Some(value)),
            None => (None, None),
        };
        buffer.logs.push(LogEntry {
            level,
            message,
            timestamp,
            step,
            metric_key,
            metric_value,
            extra,
        });
    }

    /// Snapshot of the record as it stands, without consuming the buffer
    pub fn snapshot(&self, status: RunStatus, error_message: Option<String>) -> TaskRun {
        let logs = self.buffer().logs.clone();
        self.build(status, error_message, logs)
    }

    /// Turn the buffer into the final record
    pub fn finish(self, status: RunStatus, error_message: Option<String>) -> TaskRun {
        let Self {
            meta,
            started_at,
            attempt,
            buffer,
            ..
        } = self;
        let buffer = buffer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        TaskRun {
            task_id: meta.task_id,
            task_name: meta.task_name.to_string(),
            status,
            triggered_by: meta.triggered_by,
            user_id: meta.user_id,
            started_at,
            finished_at: status.is_terminal().then(|| Utc::now().max(buffer.last_timestamp)),
            error_message,
            attempts: attempt,
            logs: buffer.logs,
        }
    }

    fn build(&self, status: RunStatus, error_message: Option<String>, logs: Vec<LogEntry>) -> TaskRun {
        TaskRun {
            task_id: self.meta.task_id,
            task_name: self.meta.task_name.to_string(),
            status,
            triggered_by: self.meta.triggered_by,
            user_id: self.meta.user_id.clone(),
            started_at: self.started_at,
            finished_at: status.is_terminal().then(Utc::now),
            error_message,
            attempts: self.attempt,
            logs,
        }
    }
}
