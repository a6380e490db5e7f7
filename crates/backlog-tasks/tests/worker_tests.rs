//! Durable queue and worker against a file-backed SQLite database

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backlog_persist::{
    Database, RunHistoryStore, RunStatus, SqliteConfig, SqliteQueueBackend, SqliteRunStore,
    TriggeredBy,
};
use backlog_queue::{BackoffStrategy, JobId, JobStatus, QueueBackend, WorkerConfig, WorkerError};
use backlog_tasks::{
    define_task, DurableQueue, EnqueueRequest, ExecutionContext, RetryPolicy, TaskError,
    TaskExecutor, TaskHandler, TaskName, TaskQueue, TaskRegistry, TaskWorker, Visibility,
};
use serde_json::json;
use tokio::sync::oneshot;

/// Fails with a retryable error until it has been called `fail_times` times
#[derive(Debug)]
struct Flaky {
    calls: Arc<AtomicU32>,
    fail_times: u32,
    error: fn() -> TaskError,
}

#[async_trait]
impl TaskHandler for Flaky {
    async fn run(&self, ctx: &ExecutionContext, _input: serde_json::Value) -> Result<(), TaskError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.step("call-provider", || async {
            if call <= self.fail_times {
                Err((self.error)())
            } else {
                ctx.progress(100).await;
                Ok(())
            }
        })
        .await
    }
}

struct Setup {
    _dir: tempfile::TempDir,
    backend: Arc<dyn QueueBackend>,
    runs: Arc<SqliteRunStore>,
    queue: DurableQueue,
    worker: Arc<TaskWorker>,
}

async fn setup(handler: Flaky, max_retries: u32) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::connect(&SqliteConfig::file(dir.path().join("tasks.db")))
        .await
        .unwrap();
    let backend: Arc<dyn QueueBackend> = Arc::new(SqliteQueueBackend::new(db.pool().clone()));
    let runs = Arc::new(SqliteRunStore::new(db.clone()));

    let mut registry = TaskRegistry::new(RetryPolicy::default());
    registry.register(
        define_task(
            TaskName::RefreshMedia,
            "flaky provider call",
            Visibility::Admin,
            json!({"type": "object"}),
            handler,
        )
        .unwrap()
        .with_retry(RetryPolicy {
            max_retries,
            backoff: BackoffStrategy::Constant { secs: 0 },
        }),
    );
    let registry = Arc::new(registry);

    let executor = Arc::new(TaskExecutor::new(registry.clone(), db, runs.clone()));
    let config = WorkerConfig {
        max_concurrency: 2,
        poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let worker = Arc::new(TaskWorker::new(backend.clone(), executor, config));

    Setup {
        _dir: dir,
        queue: DurableQueue::new(backend.clone(), registry),
        backend,
        runs,
        worker,
    }
}

fn spawn_worker(
    worker: Arc<TaskWorker>,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<(), WorkerError>>) {
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        worker
            .run_until(async {
                let _ = rx.await;
            })
            .await
    });
    (tx, handle)
}

async fn wait_until_finished(backend: &Arc<dyn QueueBackend>, id: JobId) -> JobStatus {
    for _ in 0..500 {
        let status = backend.get_job(id).await.unwrap().status;
        if status.is_finished() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never finished", id);
}

fn transient() -> TaskError {
    TaskError::Io("connection reset".into())
}

fn fatal() -> TaskError {
    TaskError::fatal("unexpected payload shape")
}

#[tokio::test]
async fn test_retries_share_one_run_record() {
    let calls = Arc::new(AtomicU32::new(0));
    let s = setup(
        Flaky {
            calls: calls.clone(),
            fail_times: 2,
            error: transient,
        },
        3,
    )
    .await;

    let handle = s
        .queue
        .enqueue(TaskName::RefreshMedia, EnqueueRequest::new(TriggeredBy::Dashboard))
        .await
        .unwrap();
    assert_eq!(handle.status, JobStatus::Waiting);

    let (stop, worker) = spawn_worker(s.worker.clone());
    assert_eq!(wait_until_finished(&s.backend, handle.job_id).await, JobStatus::Completed);
    stop.send(()).unwrap();
    worker.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let runs = s.runs.list_runs(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.task_id, handle.task_id);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.attempts, 3);
    assert!(run.finished_at.is_some());

    let job = s.queue.get_job(handle.job_id).await.unwrap();
    assert_eq!(job.task_id, handle.task_id);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.progress, 100);
}

#[tokio::test]
async fn test_exhausted_retries_record_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let s = setup(
        Flaky {
            calls: calls.clone(),
            fail_times: u32::MAX,
            error: transient,
        },
        1,
    )
    .await;

    let handle = s
        .queue
        .enqueue(TaskName::RefreshMedia, EnqueueRequest::new(TriggeredBy::CronOrCli))
        .await
        .unwrap();

    let (stop, worker) = spawn_worker(s.worker.clone());
    assert_eq!(wait_until_finished(&s.backend, handle.job_id).await, JobStatus::Failed);
    stop.send(()).unwrap();
    worker.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let run = s.runs.get_run(handle.task_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("I/O error: connection reset"));
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let s = setup(
        Flaky {
            calls: calls.clone(),
            fail_times: u32::MAX,
            error: fatal,
        },
        5,
    )
    .await;

    let handle = s
        .queue
        .enqueue(TaskName::RefreshMedia, EnqueueRequest::new(TriggeredBy::Dashboard))
        .await
        .unwrap();

    let (stop, worker) = spawn_worker(s.worker.clone());
    assert_eq!(wait_until_finished(&s.backend, handle.job_id).await, JobStatus::Failed);
    stop.send(()).unwrap();
    worker.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let run = s.runs.get_run(handle.task_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let last = run.logs.last().unwrap();
    assert_eq!(last.message, "unexpected payload shape");
    assert_eq!(last.extra.as_ref().unwrap()["retryable"], false);
}

#[tokio::test]
async fn test_waiting_job_can_be_cancelled() {
    let s = setup(
        Flaky {
            calls: Arc::new(AtomicU32::new(0)),
            fail_times: 0,
            error: transient,
        },
        0,
    )
    .await;

    let handle = s
        .queue
        .enqueue(TaskName::RefreshMedia, EnqueueRequest::new(TriggeredBy::Dashboard))
        .await
        .unwrap();
    s.queue.cancel(handle.job_id).await.unwrap();

    assert_eq!(
        s.queue.get_job(handle.job_id).await.unwrap().status,
        JobStatus::Cancelled
    );
    assert!(matches!(
        s.queue.cancel(handle.job_id).await,
        Err(TaskError::Queue(_))
    ));
    assert!(s.runs.get_run(handle.task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_user_cannot_enqueue_admin_task() {
    let s = setup(
        Flaky {
            calls: Arc::new(AtomicU32::new(0)),
            fail_times: 0,
            error: transient,
        },
        0,
    )
    .await;

    let result = s
        .queue
        .enqueue(
            TaskName::RefreshMedia,
            EnqueueRequest::new(TriggeredBy::User).with_user("u1"),
        )
        .await;
    assert!(matches!(result, Err(TaskError::Forbidden { .. })));
}
