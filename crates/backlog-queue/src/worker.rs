//! Worker Pool for processing jobs

use futures::future::{FusedFuture, FutureExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backend::{QueueBackend, QueueError};
use crate::job::{Attempt, Job, JobEntry, JobResult};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs before abandoning them
    pub drain_timeout: Duration,
    /// Claims not renewed for this long are assumed orphaned and requeued
    pub stale_after: Option<Duration>,
    /// How often a running job renews its claim; keep well below `stale_after`
    pub heartbeat_interval: Duration,
    /// Deliveries after which an orphaned job is failed instead of requeued
    pub max_attempts: u32,
    /// Finished jobs older than this are deleted
    pub retention: Option<Duration>,
    pub maintenance_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(30),
            stale_after: Some(Duration::from_secs(60 * 60)),
            heartbeat_interval: Duration::from_secs(60),
            max_attempts: 10,
            retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A job task panicked outside any handler-level recovery; the process
    /// state can no longer be trusted.
    #[error("Worker task panicked: {0}")]
    Fatal(String),
}

type JobFactory = Box<dyn Fn(serde_json::Value) -> Result<Box<dyn Job>, String> + Send + Sync>;

#[derive(Default)]
struct JobRegistry {
    factories: RwLock<HashMap<String, JobFactory>>,
}

impl JobRegistry {
    fn insert(&self, name: &str, factory: JobFactory) {
        self.factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), factory);
    }

    fn build(&self, entry: &JobEntry) -> Option<Result<Box<dyn Job>, String>> {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        factories
            .get(&entry.job_type)
            .map(|factory| factory(entry.payload.clone()))
    }

    fn job_types(&self) -> Vec<String> {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        factories.keys().cloned().collect()
    }
}

pub struct WorkerPool<B: QueueBackend + ?Sized> {
    pub backend: Arc<B>,
    config: WorkerConfig,
    registry: Arc<JobRegistry>,
}

impl<B: QueueBackend + 'static> WorkerPool<B> {
    pub fn new(backend: B, config: WorkerConfig) -> Self {
        Self::new_with_arc(Arc::new(backend), config)
    }
}

impl<B: QueueBackend + ?Sized + 'static> WorkerPool<B> {
    /// Create new worker pool from existing Arc backend (supports dyn dispatch)
    pub fn new_with_arc(backend: Arc<B>, config: WorkerConfig) -> Self {
        Self {
            backend,
            config,
            registry: Arc::new(JobRegistry::default()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Register a job type handler
    pub fn register_job_type<J: Job + DeserializeOwned + 'static>(&self, name: &str) {
        self.registry.insert(
            name,
            Box::new(|payload: serde_json::Value| {
                let job: J = serde_json::from_value(payload).map_err(|e| e.to_string())?;
                Ok(Box::new(job) as Box<dyn Job>)
            }),
        );
    }

    /// Register a custom factory (useful for jobs with dependency injection)
    pub fn register_job_factory<F>(&self, name: &str, factory: F)
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Job>, String> + Send + Sync + 'static,
    {
        self.registry.insert(name, Box::new(factory));
    }

    /// Job types this pool knows how to run
    pub fn job_types(&self) -> Vec<String> {
        self.registry.job_types()
    }

    /// Run until the process is killed
    pub async fn start(&self) -> Result<(), WorkerError> {
        self.run_until(std::future::pending()).await
    }

    /// Process jobs until `shutdown` resolves, then drain and close the backend.
    ///
    /// A claimed job is always handed to a task before the shutdown signal is
    /// looked at again, so no claim is lost between dequeue and spawn.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<(), WorkerError>
    where
        S: Future<Output = ()> + Send,
    {
        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut fatal: Option<String> = None;
        let mut next_maintenance = Instant::now();
        let max_concurrency = self.config.max_concurrency.max(1);

        info!(
            concurrency = max_concurrency,
            job_types = ?self.job_types(),
            "Worker pool started"
        );

        loop {
            if shutdown.is_terminated() || shutdown.as_mut().now_or_never().is_some() {
                info!("Shutdown requested, no longer accepting jobs");
                break;
            }

            while let Some(joined) = in_flight.join_next().now_or_never().flatten() {
                Self::inspect(joined, &mut fatal);
            }
            if fatal.is_some() {
                break;
            }

            if Instant::now() >= next_maintenance {
                self.maintain().await;
                next_maintenance = Instant::now() + self.config.maintenance_interval;
            }

            if in_flight.len() >= max_concurrency {
                tokio::select! {
                    _ = shutdown.as_mut() => {}
                    Some(joined) = in_flight.join_next() => Self::inspect(joined, &mut fatal),
                }
                continue;
            }

            let idle_for = match self.backend.dequeue().await {
                Ok(Some(entry)) => {
                    let span = info_span!("job", job.id = %entry.id, job.type = %entry.job_type);
                    in_flight.spawn(
                        Self::process(
                            self.backend.clone(),
                            self.registry.clone(),
                            entry,
                            self.config.heartbeat_interval,
                        )
                        .instrument(span),
                    );
                    continue;
                }
                Ok(None) => self.config.poll_interval,
                Err(e) => {
                    error!(error = %e, "Queue error");
                    Duration::from_secs(1)
                }
            };

            tokio::select! {
                _ = shutdown.as_mut() => {}
                _ = tokio::time::sleep(idle_for) => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    Self::inspect(joined, &mut fatal)
                }
            }
        }

        if let Some(message) = fatal {
            error!(panic = %message, "Worker task panicked, aborting remaining jobs");
            in_flight.abort_all();
            self.backend.close().await;
            return Err(WorkerError::Fatal(message));
        }

        info!(in_flight = in_flight.len(), "Draining in-flight jobs");
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            let mut fatal = None;
            while let Some(joined) = in_flight.join_next().await {
                Self::inspect(joined, &mut fatal);
            }
            fatal
        })
        .await;

        let result = match drained {
            Ok(None) => Ok(()),
            Ok(Some(message)) => Err(WorkerError::Fatal(message)),
            Err(_) => {
                warn!(
                    abandoned = in_flight.len(),
                    "Drain timeout elapsed, abandoning jobs still running"
                );
                in_flight.abort_all();
                Ok(())
            }
        };

        self.backend.close().await;
        info!("Worker pool stopped");
        result
    }

    fn inspect(joined: Result<(), JoinError>, fatal: &mut Option<String>) {
        if let Err(e) = joined {
            if e.is_panic() {
                let message = panic_message(e.into_panic());
                error!(panic = %message, "Job task panicked");
                fatal.get_or_insert(message);
            }
        }
    }

    async fn maintain(&self) {
        let now = chrono::Utc::now();

        if let Some(stale_after) = self.config.stale_after {
            let cutoff = now - chrono::Duration::from_std(stale_after).unwrap_or_default();
            match self
                .backend
                .requeue_stale(cutoff, self.config.max_attempts.max(1))
                .await
            {
                Ok(0) => {}
                Ok(count) => warn!(count, "Requeued jobs orphaned by a dead worker"),
                Err(e) => error!(error = %e, "Failed to requeue stale jobs"),
            }
        }

        if let Some(retention) = self.config.retention {
            let cutoff = now - chrono::Duration::from_std(retention).unwrap_or_default();
            match self.backend.prune(cutoff).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Pruned finished jobs past retention"),
                Err(e) => error!(error = %e, "Failed to prune finished jobs"),
            }
        }
    }

    async fn process(
        backend: Arc<B>,
        registry: Arc<JobRegistry>,
        entry: JobEntry,
        heartbeat_interval: Duration,
    ) {
        let Some(lease) = entry.lease() else {
            error!("Dequeued job carries no lease, skipping");
            return;
        };

        let outcome = match registry.build(&entry) {
            Some(Ok(job)) if entry.attempts > job.max_retries() => {
                warn!(
                    attempts = entry.attempts,
                    "Job was redelivered after exhausting its retries"
                );
                let message = entry
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "retries exhausted".to_string());
                backend.fail(&lease, message).await
            }
            Some(Ok(mut job)) => {
                let attempt = Attempt {
                    lease,
                    number: entry.attempts + 1,
                    is_final: entry.attempts >= job.max_retries(),
                };
                info!(attempt = attempt.number, "Processing job");

                let Some(result) =
                    Self::execute_leased(&*backend, job.as_mut(), &attempt, heartbeat_interval).await
                else {
                    return;
                };

                match result {
                    JobResult::Success => backend.complete(&lease).await,
                    JobResult::Retry(e) if !attempt.is_final => {
                        let delay = job.backoff_strategy().delay(entry.attempts);
                        info!(
                            attempt = attempt.number,
                            delay_secs = delay.as_secs(),
                            error = %e,
                            "Job failed, scheduling retry with backoff"
                        );
                        backend.retry(&lease, e, delay).await
                    }
                    JobResult::Retry(e) => {
                        warn!(attempt = attempt.number, error = %e, "Job failed, retries exhausted");
                        backend.fail(&lease, e).await
                    }
                    JobResult::Fatal(e) => {
                        warn!(error = %e, "Job failed permanently");
                        backend.fail(&lease, e).await
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "Job payload deserialization failed");
                backend.fail(&lease, e).await
            }
            None => {
                warn!("No handler registered for job type: {}", entry.job_type);
                let message = format!("No handler for {}", entry.job_type);
                backend.fail(&lease, message).await
            }
        };

        match outcome {
            Ok(()) => {}
            Err(QueueError::LeaseLost(_)) => {
                warn!("Job was requeued while it ran; its outcome was discarded")
            }
            Err(e) => error!(error = %e, "Failed to report job outcome to the queue"),
        }
    }

    /// Run `job`, renewing `attempt.lease` every `heartbeat_interval`.
    ///
    /// Returns `None` when the lease is lost mid-run: another worker owns
    /// the job now, so this run is dropped and reports nothing.
    async fn execute_leased(
        backend: &B,
        job: &mut dyn Job,
        attempt: &Attempt,
        heartbeat_interval: Duration,
    ) -> Option<JobResult> {
        let work = job.execute(attempt);
        tokio::pin!(work);

        let period = heartbeat_interval.max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => return Some(result),
                _ = heartbeat.tick() => match backend.heartbeat(&attempt.lease).await {
                    Ok(()) => {}
                    Err(QueueError::LeaseLost(_)) | Err(QueueError::NotFound) => {
                        warn!(attempt = attempt.number, "Lost the claim on a running job, abandoning it");
                        return None;
                    }
                    Err(e) => warn!(error = %e, "Failed to renew job claim"),
                }
            }
        }
    }
}

/// Text of a panic payload
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
