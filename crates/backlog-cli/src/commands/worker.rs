//! Worker command - consume the durable queue and fire schedules
//!
//! Usage:
//! ```bash
//! backlog worker
//! backlog worker --no-scheduler
//! ```

use anyhow::{bail, Context, Result};
use backlog_tasks::{Scheduler, TaskWorker};
use clap::Args;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::error;

use crate::app::App;
use crate::config::QueueMode;
use crate::telemetry::shutdown_signal;
use crate::{print_info, print_success, print_warning};

/// Arguments for the worker command
#[derive(Args)]
pub struct WorkerArgs {
    /// Only consume jobs; leave schedules to another process
    #[arg(long)]
    no_scheduler: bool,
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Consume jobs until `stop` flips, or only wait for it in `in_process` mode
async fn consume(app: &App, stop: watch::Receiver<bool>) -> Result<()> {
    match app.config.queue.mode {
        QueueMode::Durable => {
            let worker = TaskWorker::new(
                app.backend.clone(),
                app.executor.clone(),
                app.config.queue.worker_config(),
            );
            print_info(&format!(
                "Worker consuming {} with concurrency {}",
                worker.job_types().join(", "),
                app.config.queue.concurrency.max(1)
            ));
            worker
                .run_until(stopped(stop))
                .await
                .context("Worker stopped on a fatal error")
        }
        QueueMode::InProcess => {
            print_warning("Queue mode is in_process; only schedules run here");
            stopped(stop).await;
            Ok(())
        }
    }
}

/// Why the worker command is winding down
enum Exit {
    Signal,
    Worker(Result<()>),
    Scheduler(Result<(), JoinError>),
}

/// Wait for a shutdown signal while watching the worker and the scheduler.
///
/// Either of them finishing on its own is an error; the other one is still
/// stopped and drained before returning.
async fn supervise<S, W>(
    signal: S,
    worker: W,
    mut scheduler: JoinHandle<()>,
    stop: watch::Sender<bool>,
) -> Result<()>
where
    S: Future<Output = ()>,
    W: Future<Output = Result<()>>,
{
    tokio::pin!(signal);
    tokio::pin!(worker);

    let exit = tokio::select! {
        _ = &mut signal => Exit::Signal,
        result = &mut worker => Exit::Worker(result),
        joined = &mut scheduler => Exit::Scheduler(joined),
    };
    let _ = stop.send(true);

    match exit {
        Exit::Signal => {
            let result = worker.await;
            scheduler.await.context("Scheduler task panicked")?;
            result
        }
        Exit::Worker(result) => {
            scheduler.await.context("Scheduler task panicked")?;
            result?;
            bail!("Worker stopped without a shutdown request")
        }
        Exit::Scheduler(joined) => {
            error!("Scheduler stopped before shutdown was requested");
            let drained = worker.await;
            joined.context("Scheduler task panicked")?;
            drained?;
            bail!("Scheduler stopped unexpectedly")
        }
    }
}

/// Run the worker command
pub async fn run(args: WorkerArgs, app: &App) -> Result<()> {
    let schedules = if args.no_scheduler {
        Vec::new()
    } else {
        app.config.schedules()?
    };

    for schedule in &schedules {
        print_info(&format!(
            "Scheduling {} every {}s",
            schedule.task,
            schedule.every.as_secs()
        ));
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = Scheduler::new(app.queue.clone(), schedules);
    let scheduler_stop = stop_rx.clone();
    let scheduler = tokio::spawn(async move { scheduler.run_until(stopped(scheduler_stop)).await });

    supervise(shutdown_signal(), consume(app, stop_rx), scheduler, stop_tx).await?;
    print_success("Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn idle_scheduler(stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(stopped(stop))
    }

    #[tokio::test]
    async fn test_signal_stops_both_halves() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = idle_scheduler(stop_rx.clone());
        let worker = async move {
            stopped(stop_rx).await;
            Ok(())
        };

        let signal = tokio::time::sleep(Duration::from_millis(10));
        supervise(signal, worker, scheduler, stop_tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_panicked_scheduler_fails_the_command() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler: JoinHandle<()> = tokio::spawn(async { panic!("schedule bug") });
        let worker = async move {
            stopped(stop_rx).await;
            Ok(())
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(std::future::pending(), worker, scheduler, stop_tx),
        )
        .await
        .expect("supervise should return without a signal");
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Scheduler task panicked"), "{}", message);
    }

    #[tokio::test]
    async fn test_scheduler_returning_early_fails_the_command() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = tokio::spawn(async {});
        let worker = async move {
            stopped(stop_rx).await;
            Ok(())
        };

        let result = supervise(std::future::pending(), worker, scheduler, stop_tx).await;
        assert_eq!(result.unwrap_err().to_string(), "Scheduler stopped unexpectedly");
    }

    #[tokio::test]
    async fn test_worker_error_stops_the_scheduler() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = idle_scheduler(stop_rx);
        let worker = async { Err(anyhow::anyhow!("Worker stopped on a fatal error")) };

        let result = supervise(std::future::pending(), worker, scheduler, stop_tx).await;
        assert_eq!(result.unwrap_err().to_string(), "Worker stopped on a fatal error");
    }
}
