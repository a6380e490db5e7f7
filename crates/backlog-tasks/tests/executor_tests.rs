//! Run recording is best-effort: a broken history store never changes a
//! task's outcome

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backlog_persist::{Database, RunHistoryStore, StorageError, TaskRun, TriggeredBy};
use backlog_queue::{Attempt, Lease};
use backlog_tasks::{
    define_task, ExecutionContext, RetryPolicy, TaskError, TaskExecutor, TaskHandler, TaskName,
    TaskPayload, TaskRegistry, Visibility,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

/// Every write fails; reads see nothing
#[derive(Debug, Default)]
struct BrokenRunStore {
    writes: AtomicU32,
}

#[async_trait]
impl RunHistoryStore for BrokenRunStore {
    async fn record_run(&self, _run: &TaskRun) -> Result<(), StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Connection("database is locked".into()))
    }

    async fn get_run(&self, _task_id: Uuid) -> Result<Option<TaskRun>, StorageError> {
        Ok(None)
    }

    async fn list_runs(&self, _limit: usize) -> Result<Vec<TaskRun>, StorageError> {
        Ok(Vec::new())
    }

    async fn delete_run(&self, _task_id: Uuid) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn delete_finished_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        Ok(0)
    }
}

#[derive(Debug)]
struct Counting {
    calls: Arc<AtomicU32>,
    fail: bool,
}

#[async_trait]
impl TaskHandler for Counting {
    async fn run(&self, _ctx: &ExecutionContext, _input: serde_json::Value) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(TaskError::fatal("handler gave up"))
        } else {
            Ok(())
        }
    }
}

/// Collects formatted log lines
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

async fn executor(handler: Counting, store: Arc<BrokenRunStore>) -> TaskExecutor {
    let mut registry = TaskRegistry::new(RetryPolicy::default());
    registry.register(
        define_task(
            TaskName::LockOldMovies,
            "counts its calls",
            Visibility::Admin,
            json!({"type": "object"}),
            handler,
        )
        .unwrap(),
    );
    TaskExecutor::new(Arc::new(registry), Database::memory().await.unwrap(), store)
}

fn payload() -> TaskPayload {
    TaskPayload {
        task_id: Uuid::new_v4(),
        task_name: TaskName::LockOldMovies,
        triggered_by: TriggeredBy::CronOrCli,
        user_id: None,
        input: json!({}),
    }
}

fn attempt() -> Attempt {
    Attempt {
        lease: Lease::new(Uuid::new_v4()),
        number: 1,
        is_final: true,
    }
}

#[tokio::test]
async fn test_success_survives_failed_run_recording() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let calls = Arc::new(AtomicU32::new(0));
    let store = Arc::new(BrokenRunStore::default());
    let executor = executor(
        Counting {
            calls: calls.clone(),
            fail: false,
        },
        store.clone(),
    )
    .await;

    let outcome = executor.run_attempt(&payload(), &attempt(), None).await;

    assert!(outcome.is_ok(), "{:?}", outcome);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Both the running and the succeeded record were attempted
    assert_eq!(store.writes.load(Ordering::SeqCst), 2);

    let output = logs.contents();
    assert!(output.contains("Failed to record task run"), "{}", output);
    assert!(output.contains("database is locked"), "{}", output);
}

#[tokio::test]
async fn test_handler_error_wins_over_failed_run_recording() {
    let calls = Arc::new(AtomicU32::new(0));
    let store = Arc::new(BrokenRunStore::default());
    let executor = executor(
        Counting {
            calls: calls.clone(),
            fail: true,
        },
        store.clone(),
    )
    .await;

    let outcome = executor.run_attempt(&payload(), &attempt(), None).await;

    assert!(matches!(outcome, Err(TaskError::Fatal(message)) if message == "handler gave up"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
