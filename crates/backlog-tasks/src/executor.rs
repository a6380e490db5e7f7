//! Runs one attempt of a task and records its outcome

use backlog_persist::{Database, RunHistoryStore, RunStatus, TaskRun, TriggeredBy};
use backlog_queue::{panic_message, Attempt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::{ExecutionContext, ProgressSink, RunMeta};
use crate::error::TaskError;
use crate::registry::{TaskName, TaskRegistry};

/// What travels through the queue for one task invocation.
///
/// `task_id` is fixed at enqueue time, so every retry of the job reports
/// against the same run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_id: Uuid,
    pub task_name: TaskName,
    pub triggered_by: TriggeredBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl TaskPayload {
    fn meta(&self) -> RunMeta {
        RunMeta {
            task_id: self.task_id,
            task_name: self.task_name,
            triggered_by: self.triggered_by,
            user_id: self.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    db: Database,
    runs: Arc<dyn RunHistoryStore>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>, db: Database, runs: Arc<dyn RunHistoryStore>) -> Self {
        Self { registry, db, runs }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn runs(&self) -> &Arc<dyn RunHistoryStore> {
        &self.runs
    }

    /// Run one attempt of `payload`.
    ///
    /// The run record ends `succeeded` or `failed`, or goes back to `queued`
    /// when the error is retryable and `attempt` is not the last one. The
    /// returned error is the handler's; failing to write the record is only
    /// logged.
    pub async fn run_attempt(
        &self,
        payload: &TaskPayload,
        attempt: &Attempt,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<(), TaskError> {
        let span = info_span!(
            "task",
            task = %payload.task_name,
            task_id = %payload.task_id,
            attempt = attempt.number
        );
        self.execute(payload, attempt, progress).instrument(span).await
    }

    async fn execute(
        &self,
        payload: &TaskPayload,
        attempt: &Attempt,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<(), TaskError> {
        let mut ctx = ExecutionContext::new(payload.meta(), self.db.clone()).with_attempt(attempt.number);
        if let Some(sink) = progress {
            ctx = ctx.with_progress_sink(sink);
        }

        let Some(definition) = self.registry.get(payload.task_name) else {
            let err = TaskError::NotFound(format!("task {} is not registered", payload.task_name));
            return self.settle(ctx, attempt, err).await;
        };
        if let Some(timeout) = definition.timeout {
            ctx = ctx.with_timeout(timeout);
        }

        if let Err(err) = definition
            .authorize(payload.triggered_by)
            .and_then(|_| definition.input_schema.validate(&payload.input))
        {
            return self.settle(ctx, attempt, err).await;
        }

        self.record(&ctx.snapshot(RunStatus::Running, None)).await;
        info!("Task started");

        let handler = definition.handler.clone();
        let work = AssertUnwindSafe(handler.run(&ctx, payload.input.clone())).catch_unwind();
        let outcome = match definition.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, work).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(TaskError::DeadlineExceeded(format!(
                    "attempt ran longer than {}s",
                    timeout.as_secs()
                )))),
            },
            None => work.await,
        };

        match outcome {
            Ok(Ok(())) => {
                let run = ctx.finish(RunStatus::Succeeded, None);
                info!(duration_ms = run.duration().map(|d| d.num_milliseconds()), "Task succeeded");
                self.record(&run).await;
                Ok(())
            }
            Ok(Err(err)) => self.settle(ctx, attempt, err).await,
            Err(panic) => {
                let err = TaskError::Panicked(panic_message(panic));
                self.settle(ctx, attempt, err).await
            }
        }
    }

    /// Record a failed attempt and hand the error back
    async fn settle(&self, ctx: ExecutionContext, attempt: &Attempt, err: TaskError) -> Result<(), TaskError> {
        let message = err.to_string();
        let status = if err.is_retryable() && !attempt.is_final {
            ctx.warn(format!("Attempt {} failed, retry scheduled: {}", attempt.number, message));
            warn!(error = %message, "Task attempt failed, will retry");
            RunStatus::Queued
        } else {
            ctx.error(
                message.clone(),
                Some(serde_json::json!({
                    "attempt": attempt.number,
                    "retryable": err.is_retryable(),
                })),
            );
            error!(error = %message, "Task failed");
            RunStatus::Failed
        };

        self.record(&ctx.finish(status, Some(message))).await;
        Err(err)
    }

    /// Best-effort write; never changes the task's outcome
    async fn record(&self, run: &TaskRun) {
        if let Err(e) = self.runs.record_run(run).await {
            error!(error = %e, status = %run.status, "Failed to record task run");
        }
    }
}
