//! Queue strategies: where an enqueued task runs

use async_trait::async_trait;
use backlog_persist::TriggeredBy;
use backlog_queue::{
    Attempt, BackoffStrategy, Job, JobEntry, JobId, JobResult, JobStatus, Lease, QueueBackend, QueueError,
    WorkerConfig, WorkerError, WorkerPool,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ProgressSink;
use crate::definition::RetryPolicy;
use crate::error::TaskError;
use crate::executor::{TaskExecutor, TaskPayload};
use crate::registry::{TaskName, TaskRegistry};

/// Who asked for a task and with what input
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub input: serde_json::Value,
    pub triggered_by: TriggeredBy,
    pub user_id: Option<String>,
}

impl EnqueueRequest {
    pub fn new(triggered_by: TriggeredBy) -> Self {
        Self {
            input: serde_json::json!({}),
            triggered_by,
            user_id: None,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Caller-facing view of a queued job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: JobId,
    /// Run record this job reports to
    pub task_id: Uuid,
    pub task_name: TaskName,
    pub status: JobStatus,
    pub attempts: u32,
    pub progress: u32,
    pub last_error: Option<String>,
}

impl JobHandle {
    fn from_entry(entry: &JobEntry) -> Result<Self, TaskError> {
        let payload: TaskPayload = serde_json::from_value(entry.payload.clone())
            .map_err(|e| TaskError::fatal(format!("job {} has a malformed payload: {}", entry.id, e)))?;
        Ok(Self {
            job_id: entry.id,
            task_id: payload.task_id,
            task_name: payload.task_name,
            status: entry.status,
            attempts: entry.attempts,
            progress: entry.progress,
            last_error: entry.last_error.clone(),
        })
    }
}

/// Entry point shared by the CLI, the dashboard and the scheduler
#[async_trait]
pub trait TaskQueue: Send + Sync + fmt::Debug {
    async fn enqueue(&self, task: TaskName, request: EnqueueRequest) -> Result<JobHandle, TaskError>;

    async fn get_job(&self, job_id: JobId) -> Result<JobHandle, TaskError>;

    /// Remove a job that has not started
    async fn cancel(&self, job_id: JobId) -> Result<(), TaskError>;

    async fn close(&self);
}

/// Check a request against the task's definition and build the payload
fn prepare(
    registry: &TaskRegistry,
    task: TaskName,
    request: EnqueueRequest,
) -> Result<TaskPayload, TaskError> {
    let definition = registry
        .get(task)
        .ok_or_else(|| TaskError::NotFound(format!("task {} is not registered", task)))?;
    definition.authorize(request.triggered_by)?;

    let input = if request.input.is_null() {
        serde_json::json!({})
    } else {
        request.input
    };
    definition.input_schema.validate(&input)?;

    Ok(TaskPayload {
        task_id: Uuid::new_v4(),
        task_name: task,
        triggered_by: request.triggered_by,
        user_id: request.user_id,
        input,
    })
}

fn job_error(job_id: JobId, e: QueueError) -> TaskError {
    match e {
        QueueError::NotFound => TaskError::NotFound(format!("job {}", job_id)),
        other => TaskError::Queue(other),
    }
}

/// Hands tasks to a queue backend; worker processes run them
pub struct DurableQueue {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<TaskRegistry>,
}

impl fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableQueue")
            .field("tasks", &self.registry.len())
            .finish()
    }
}

impl DurableQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, registry: Arc<TaskRegistry>) -> Self {
        Self { backend, registry }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }
}

#[async_trait]
impl TaskQueue for DurableQueue {
    async fn enqueue(&self, task: TaskName, request: EnqueueRequest) -> Result<JobHandle, TaskError> {
        let payload = prepare(&self.registry, task, request)?;
        let task_id = payload.task_id;
        let job_id = self
            .backend
            .enqueue(task.as_str(), serde_json::to_value(&payload).map_err(QueueError::from)?, None)
            .await?;

        info!(%task, %task_id, %job_id, triggered_by = %payload.triggered_by, "Task enqueued");
        Ok(JobHandle {
            job_id,
            task_id,
            task_name: task,
            status: JobStatus::Waiting,
            attempts: 0,
            progress: 0,
            last_error: None,
        })
    }

    async fn get_job(&self, job_id: JobId) -> Result<JobHandle, TaskError> {
        let entry = self
            .backend
            .get_job(job_id)
            .await
            .map_err(|e| job_error(job_id, e))?;
        JobHandle::from_entry(&entry)
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), TaskError> {
        self.backend
            .cancel(job_id)
            .await
            .map_err(|e| job_error(job_id, e))?;
        info!(%job_id, "Job cancelled");
        Ok(())
    }

    async fn close(&self) {
        self.backend.close().await;
    }
}

/// Runs each task to completion inside `enqueue`; no retries
#[derive(Debug)]
pub struct InProcessQueue {
    executor: Arc<TaskExecutor>,
    jobs: Mutex<HashMap<JobId, JobHandle>>,
    closed: AtomicBool,
}

impl InProcessQueue {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self {
            executor,
            jobs: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TaskQueue for InProcessQueue {
    async fn enqueue(&self, task: TaskName, request: EnqueueRequest) -> Result<JobHandle, TaskError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TaskError::Queue(QueueError::Closed));
        }
        let payload = prepare(self.executor.registry(), task, request)?;
        let job_id = Uuid::new_v4();
        let attempt = Attempt {
            lease: Lease::new(job_id),
            number: 1,
            is_final: true,
        };

        debug!(%task, task_id = %payload.task_id, "Running task in process");
        let outcome = self.executor.run_attempt(&payload, &attempt, None).await;

        let handle = JobHandle {
            job_id,
            task_id: payload.task_id,
            task_name: task,
            status: if outcome.is_ok() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            },
            attempts: attempt.number,
            progress: if outcome.is_ok() { 100 } else { 0 },
            last_error: outcome.err().map(|e| e.to_string()),
        };
        self.jobs.lock().await.insert(job_id, handle.clone());
        Ok(handle)
    }

    async fn get_job(&self, job_id: JobId) -> Result<JobHandle, TaskError> {
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(format!("job {}", job_id)))
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), TaskError> {
        if self.jobs.lock().await.contains_key(&job_id) {
            // Jobs finish inside enqueue, so none is ever waiting
            Err(TaskError::Queue(QueueError::NotWaiting(job_id)))
        } else {
            Err(TaskError::NotFound(format!("job {}", job_id)))
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Forwards context progress to the job row
struct QueueProgress {
    backend: Arc<dyn QueueBackend>,
    lease: Lease,
}

impl fmt::Debug for QueueProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueProgress").field("job_id", &self.lease.job_id).finish()
    }
}

#[async_trait]
impl ProgressSink for QueueProgress {
    async fn report(&self, progress: u32) {
        if let Err(e) = self.backend.set_progress(&self.lease, progress).await {
            warn!(job_id = %self.lease.job_id, error = %e, "Failed to update job progress");
        }
    }
}

/// One queued task invocation, as seen by the worker pool
struct TaskJob {
    payload: TaskPayload,
    executor: Arc<TaskExecutor>,
    backend: Arc<dyn QueueBackend>,
    retry: RetryPolicy,
    /// Backoff asked for by the last failure (rate limits)
    retry_after: Option<Duration>,
}

impl fmt::Debug for TaskJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskJob")
            .field("task", &self.payload.task_name)
            .field("task_id", &self.payload.task_id)
            .finish()
    }
}

#[async_trait]
impl Job for TaskJob {
    fn name(&self) -> &str {
        self.payload.task_name.as_str()
    }

    async fn execute(&mut self, attempt: &Attempt) -> JobResult {
        let sink: Arc<dyn ProgressSink> = Arc::new(QueueProgress {
            backend: self.backend.clone(),
            lease: attempt.lease,
        });

        self.retry_after = None;
        match self.executor.run_attempt(&self.payload, attempt, Some(sink)).await {
            Ok(()) => JobResult::Success,
            Err(e) if e.is_retryable() => {
                self.retry_after = e.retry_after();
                JobResult::Retry(e.to_string())
            }
            Err(e) => JobResult::Fatal(e.to_string()),
        }
    }

    fn max_retries(&self) -> u32 {
        self.retry.max_retries
    }

    fn backoff_strategy(&self) -> BackoffStrategy {
        match self.retry_after {
            Some(after) => BackoffStrategy::Constant {
                secs: after.as_millis().div_ceil(1000).max(1) as u64,
            },
            None => self.retry.backoff,
        }
    }
}

/// Worker process side of the durable queue
pub struct TaskWorker {
    pool: WorkerPool<dyn QueueBackend>,
}

impl TaskWorker {
    pub fn new(backend: Arc<dyn QueueBackend>, executor: Arc<TaskExecutor>, config: WorkerConfig) -> Self {
        let pool = WorkerPool::new_with_arc(backend.clone(), config);

        for definition in executor.registry().definitions() {
            let name = definition.name;
            let retry = executor.registry().retry_policy(name);
            let executor = executor.clone();
            let backend = backend.clone();

            pool.register_job_factory(name.as_str(), move |value| {
                let payload: TaskPayload = serde_json::from_value(value).map_err(|e| e.to_string())?;
                if payload.task_name != name {
                    return Err(format!(
                        "payload for {} queued as {}",
                        payload.task_name, name
                    ));
                }
                Ok(Box::new(TaskJob {
                    payload,
                    executor: executor.clone(),
                    backend: backend.clone(),
                    retry,
                    retry_after: None,
                }) as Box<dyn Job>)
            });
        }

        Self { pool }
    }

    pub fn job_types(&self) -> Vec<String> {
        self.pool.job_types()
    }

    /// Process jobs until `shutdown` resolves, then drain and close the queue
    pub async fn run_until<S>(&self, shutdown: S) -> Result<(), WorkerError>
    where
        S: Future<Output = ()> + Send,
    {
        self.pool.run_until(shutdown).await
    }
}
