//! Fixed-interval trigger for recurring tasks

use backlog_persist::TriggeredBy;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

use crate::dispatch::{EnqueueRequest, TaskQueue};
use crate::registry::TaskName;

/// Shortest interval a schedule fires at
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Longest interval a schedule fires at
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// First instant after `from` that a schedule firing every `every` is due
fn next_due(from: Instant, every: Duration) -> Instant {
    let every = every.clamp(MIN_INTERVAL, MAX_INTERVAL);
    from.checked_add(every)
        .or_else(|| from.checked_add(MIN_INTERVAL))
        .unwrap_or(from)
}

/// Enqueue `task` every `every`, clamped to `MIN_INTERVAL..=MAX_INTERVAL`
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub task: TaskName,
    pub every: Duration,
    pub input: serde_json::Value,
}

impl Schedule {
    pub fn new(task: TaskName, every: Duration) -> Self {
        Self {
            task,
            every,
            input: serde_json::json!({}),
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }
}

#[derive(Debug)]
pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    schedules: Vec<Schedule>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, schedules: Vec<Schedule>) -> Self {
        Self { queue, schedules }
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    /// Fire schedules until `shutdown` resolves.
    ///
    /// Each schedule fires once `every` has passed since the scheduler
    /// started, then again every `every`. A failed enqueue is logged and the
    /// schedule waits for its next slot.
    pub async fn run_until<S>(&self, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        if self.schedules.is_empty() {
            shutdown.await;
            return;
        }

        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let start = Instant::now();
        let mut due: Vec<Instant> = self
            .schedules
            .iter()
            .map(|s| next_due(start, s.every))
            .collect();
        info!(schedules = self.schedules.len(), "Scheduler started");

        loop {
            let next = due.iter().copied().min().unwrap_or(start);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep_until(next) => {}
            }

            let now = Instant::now();
            for (schedule, at) in self.schedules.iter().zip(due.iter_mut()) {
                if *at > now {
                    continue;
                }
                *at = next_due(now, schedule.every);

                let request =
                    EnqueueRequest::new(TriggeredBy::CronOrCli).with_input(schedule.input.clone());
                match self.queue.enqueue(schedule.task, request).await {
                    Ok(handle) => info!(
                        task = %schedule.task,
                        job_id = %handle.job_id,
                        task_id = %handle.task_id,
                        "Scheduled task enqueued"
                    ),
                    Err(e) => error!(task = %schedule.task, error = %e, "Failed to enqueue scheduled task"),
                }
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobHandle;
    use crate::error::TaskError;
    use async_trait::async_trait;
    use backlog_queue::JobId;

    /// Refuses everything; the scheduler only needs somewhere to send jobs
    #[derive(Debug)]
    struct ClosedQueue;

    #[async_trait]
    impl TaskQueue for ClosedQueue {
        async fn enqueue(&self, task: TaskName, _request: EnqueueRequest) -> Result<JobHandle, TaskError> {
            Err(TaskError::NotFound(format!("task {}", task)))
        }

        async fn get_job(&self, job_id: JobId) -> Result<JobHandle, TaskError> {
            Err(TaskError::NotFound(format!("job {}", job_id)))
        }

        async fn cancel(&self, job_id: JobId) -> Result<(), TaskError> {
            Err(TaskError::NotFound(format!("job {}", job_id)))
        }

        async fn close(&self) {}
    }

    #[test]
    fn test_next_due_clamps_interval() {
        let now = Instant::now();
        assert_eq!(next_due(now, Duration::ZERO), now + MIN_INTERVAL);
        assert_eq!(next_due(now, Duration::from_secs(90)), now + Duration::from_secs(90));
        assert_eq!(next_due(now, Duration::MAX), now + MAX_INTERVAL);
    }

    #[tokio::test]
    async fn test_huge_interval_does_not_overflow() {
        let scheduler = Scheduler::new(
            Arc::new(ClosedQueue),
            vec![Schedule::new(TaskName::DbMaintenance, Duration::MAX)],
        );

        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run_until(tokio::time::sleep(Duration::from_millis(20))),
        )
        .await
        .unwrap();
    }
}
