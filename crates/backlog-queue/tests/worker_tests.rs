//! Worker pool behaviour against the in-memory backend

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backlog_queue::{
    Attempt, BackoffStrategy, Job, JobId, JobResult, JobStatus, MemoryQueue, QueueBackend,
    WorkerConfig, WorkerError, WorkerPool,
};
use serde_json::json;
use tokio::sync::oneshot;

/// A test job that counts executions and fails its first `fail_times` runs
#[derive(Debug)]
struct CounterJob {
    counter: Arc<AtomicU32>,
    fail_times: u32,
    max_retries: u32,
}

#[async_trait::async_trait]
impl Job for CounterJob {
    fn name(&self) -> &str {
        "counter_job"
    }

    async fn execute(&mut self, _attempt: &Attempt) -> JobResult {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        if count < self.fail_times {
            JobResult::Retry(format!("Failing on attempt {}", count + 1))
        } else {
            JobResult::Success
        }
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn backoff_strategy(&self) -> BackoffStrategy {
        BackoffStrategy::Constant { secs: 0 } // No delay for tests
    }
}

/// A job that always fails fatally
#[derive(Debug)]
struct FatalJob;

#[async_trait::async_trait]
impl Job for FatalJob {
    fn name(&self) -> &str {
        "fatal_job"
    }

    async fn execute(&mut self, _attempt: &Attempt) -> JobResult {
        JobResult::Fatal("This job always fails".to_string())
    }
}

/// A job that sleeps and tracks how many copies run at once
#[derive(Debug)]
struct SlowJob {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    sleep: Duration,
}

#[async_trait::async_trait]
impl Job for SlowJob {
    fn name(&self) -> &str {
        "slow_job"
    }

    async fn execute(&mut self, _attempt: &Attempt) -> JobResult {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.sleep).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        JobResult::Success
    }
}

#[derive(Debug)]
struct PanickingJob;

#[async_trait::async_trait]
impl Job for PanickingJob {
    fn name(&self) -> &str {
        "panicking_job"
    }

    async fn execute(&mut self, _attempt: &Attempt) -> JobResult {
        panic!("handler bug");
    }
}

fn fast_config(max_concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        max_concurrency,
        poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn wait_for_status(queue: &MemoryQueue, id: JobId, status: JobStatus) {
    for _ in 0..300 {
        if queue.get_job(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {:?}", id, status);
}

fn spawn_pool(
    pool: WorkerPool<MemoryQueue>,
) -> (
    oneshot::Sender<()>,
    tokio::task::JoinHandle<Result<(), WorkerError>>,
) {
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        pool.run_until(async {
            let _ = rx.await;
        })
        .await
    });
    (tx, handle)
}

#[tokio::test]
async fn test_worker_config_defaults() {
    let config = WorkerConfig::default();
    assert!(config.max_concurrency > 0);
    assert!(config.poll_interval.as_millis() > 0);
    assert!(config.drain_timeout > Duration::ZERO);
}

#[tokio::test]
async fn test_retry_until_success_keeps_one_job() {
    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new_with_arc(queue.clone(), fast_config(2));
    let counter = Arc::new(AtomicU32::new(0));

    let job_counter = counter.clone();
    pool.register_job_factory("counter_job", move |_payload| {
        Ok(Box::new(CounterJob {
            counter: job_counter.clone(),
            fail_times: 2,
            max_retries: 5,
        }) as Box<dyn Job>)
    });

    let id = queue.enqueue("counter_job", json!({}), None).await.unwrap();
    let (stop, handle) = spawn_pool(pool);

    wait_for_status(&queue, id, JobStatus::Completed).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.as_deref(), Some("Failing on attempt 2"));
}

#[tokio::test]
async fn test_retries_exhausted_marks_failed() {
    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new_with_arc(queue.clone(), fast_config(1));
    let counter = Arc::new(AtomicU32::new(0));

    let job_counter = counter.clone();
    pool.register_job_factory("counter_job", move |_payload| {
        Ok(Box::new(CounterJob {
            counter: job_counter.clone(),
            fail_times: u32::MAX,
            max_retries: 2,
        }) as Box<dyn Job>)
    });

    let id = queue.enqueue("counter_job", json!({}), None).await.unwrap();
    let (stop, handle) = spawn_pool(pool);

    wait_for_status(&queue, id, JobStatus::Failed).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    // First attempt plus two retries
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(queue.get_job(id).await.unwrap().attempts, 3);
}

#[tokio::test]
async fn test_fatal_job_is_not_retried() {
    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new_with_arc(queue.clone(), fast_config(1));
    pool.register_job_factory("fatal_job", |_payload| Ok(Box::new(FatalJob) as Box<dyn Job>));

    let id = queue.enqueue("fatal_job", json!({}), None).await.unwrap();
    let (stop, handle) = spawn_pool(pool);

    wait_for_status(&queue, id, JobStatus::Failed).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.last_error.as_deref(), Some("This job always fails"));
}

#[tokio::test]
async fn test_unknown_job_type_fails() {
    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new_with_arc(queue.clone(), fast_config(1));

    let id = queue.enqueue("mystery", json!({}), None).await.unwrap();
    let (stop, handle) = spawn_pool(pool);

    wait_for_status(&queue, id, JobStatus::Failed).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.last_error.as_deref(), Some("No handler for mystery"));
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new_with_arc(queue.clone(), fast_config(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let (r, p, f) = (running.clone(), peak.clone(), finished.clone());
    pool.register_job_factory("slow_job", move |_payload| {
        Ok(Box::new(SlowJob {
            running: r.clone(),
            peak: p.clone(),
            finished: f.clone(),
            sleep: Duration::from_millis(50),
        }) as Box<dyn Job>)
    });

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(queue.enqueue("slow_job", json!({}), None).await.unwrap());
    }

    let (stop, handle) = spawn_pool(pool);
    for id in &ids {
        wait_for_status(&queue, *id, JobStatus::Completed).await;
    }
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_jobs() {
    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new_with_arc(queue.clone(), fast_config(4));
    let running = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let (r, f) = (running.clone(), finished.clone());
    pool.register_job_factory("slow_job", move |_payload| {
        Ok(Box::new(SlowJob {
            running: r.clone(),
            peak: Arc::new(AtomicUsize::new(0)),
            finished: f.clone(),
            sleep: Duration::from_millis(200),
        }) as Box<dyn Job>)
    });

    let id = queue.enqueue("slow_job", json!({}), None).await.unwrap();
    let (stop, handle) = spawn_pool(pool);

    wait_for_status(&queue, id, JobStatus::Active).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    // The job started before shutdown was allowed to finish
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Completed);

    // The backend is closed once the pool stops
    assert!(queue.enqueue("slow_job", json!({}), None).await.is_err());
}

#[tokio::test]
async fn test_escaped_panic_is_fatal() {
    let queue = Arc::new(MemoryQueue::new());
    let pool = WorkerPool::new_with_arc(queue.clone(), fast_config(1));
    pool.register_job_factory("panicking_job", |_payload| {
        Ok(Box::new(PanickingJob) as Box<dyn Job>)
    });

    queue.enqueue("panicking_job", json!({}), None).await.unwrap();
    let (_stop, handle) = spawn_pool(pool);

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pool should stop on its own")
        .unwrap();
    assert!(matches!(result, Err(WorkerError::Fatal(message)) if message == "handler bug"));
}

#[tokio::test]
async fn test_heartbeat_keeps_long_job_claimed() {
    let queue = Arc::new(MemoryQueue::new());
    let config = WorkerConfig {
        stale_after: Some(Duration::from_millis(150)),
        heartbeat_interval: Duration::from_millis(30),
        maintenance_interval: Duration::from_millis(20),
        ..fast_config(2)
    };
    let pool = WorkerPool::new_with_arc(queue.clone(), config);
    let running = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let (r, f) = (running.clone(), finished.clone());
    pool.register_job_factory("slow_job", move |_payload| {
        Ok(Box::new(SlowJob {
            running: r.clone(),
            peak: Arc::new(AtomicUsize::new(0)),
            finished: f.clone(),
            sleep: Duration::from_millis(600),
        }) as Box<dyn Job>)
    });

    let id = queue.enqueue("slow_job", json!({}), None).await.unwrap();
    let (stop, handle) = spawn_pool(pool);

    wait_for_status(&queue, id, JobStatus::Completed).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    // Maintenance never mistook the running job for an orphan
    let job = queue.get_job(id).await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(job.attempts, 0);
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn test_redelivered_job_past_its_retries_fails_without_running() {
    let queue = Arc::new(MemoryQueue::new());
    let counter = Arc::new(AtomicU32::new(0));

    let id = queue.enqueue("counter_job", json!({}), None).await.unwrap();
    // Three deliveries whose workers all died mid-run
    for _ in 0..3 {
        queue.dequeue().await.unwrap().unwrap();
        let cutoff = chrono::Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(queue.requeue_stale(cutoff, 10).await.unwrap(), 1);
    }

    let pool = WorkerPool::new_with_arc(queue.clone(), fast_config(1));
    let job_counter = counter.clone();
    pool.register_job_factory("counter_job", move |_payload| {
        Ok(Box::new(CounterJob {
            counter: job_counter.clone(),
            fail_times: 0,
            max_retries: 2,
        }) as Box<dyn Job>)
    });
    let (stop, handle) = spawn_pool(pool);

    wait_for_status(&queue, id, JobStatus::Failed).await;
    stop.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    let job = queue.get_job(id).await.unwrap();
    assert_eq!(
        job.last_error.as_deref(),
        Some("worker lost while the job was running")
    );
}

#[tokio::test]
async fn test_backoff_strategy_constant() {
    let strategy = BackoffStrategy::Constant { secs: 5 };
    assert_eq!(strategy.delay(0).as_secs(), 5);
    assert_eq!(strategy.delay(3).as_secs(), 5);
    assert_eq!(strategy.delay(10).as_secs(), 5);
}

#[tokio::test]
async fn test_backoff_strategy_exponential() {
    let strategy = BackoffStrategy::Exponential {
        initial_secs: 1,
        multiplier: 2.0,
    };
    assert_eq!(strategy.delay(0).as_secs(), 1); // 1 * 2^0 = 1
    assert_eq!(strategy.delay(1).as_secs(), 2); // 1 * 2^1 = 2
    assert_eq!(strategy.delay(2).as_secs(), 4); // 1 * 2^2 = 4
    assert_eq!(strategy.delay(3).as_secs(), 8); // 1 * 2^3 = 8
}

#[tokio::test]
async fn test_memory_queue_fifo_ordering() {
    let queue = MemoryQueue::new();

    let id1 = queue.enqueue("job1", json!({}), None).await.unwrap();
    let id2 = queue.enqueue("job2", json!({}), None).await.unwrap();

    let job1 = queue.dequeue().await.unwrap().unwrap();
    let job2 = queue.dequeue().await.unwrap().unwrap();

    assert_eq!(job1.id, id1);
    assert_eq!(job2.id, id2);
}
