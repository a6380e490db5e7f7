//! Enqueue command - queue a task by name
//!
//! Usage:
//! ```bash
//! backlog enqueue lock-old-movies
//! backlog enqueue delete-user '{"userId": "u42"}'
//! backlog enqueue import-csv '{"userId": "u42", "filePath": "/tmp/u42.csv", "mediaType": "movie"}' \
//!     --triggered-by user --user-id u42
//! ```

use anyhow::{anyhow, Context, Result};
use backlog_persist::TriggeredBy;
use backlog_tasks::{EnqueueRequest, TaskName};
use clap::Args;
use colored::Colorize;

use crate::app::App;
use crate::commands::job_status_label;
use crate::print_success;

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    /// Task name, e.g. lock-old-movies
    task: String,

    /// Task input as JSON
    #[arg(default_value = "{}")]
    input: String,

    /// User the run is attributed to
    #[arg(long)]
    user_id: Option<String>,

    /// Surface recorded on the run: user, cron/cli or dashboard
    #[arg(long, default_value = "cron/cli")]
    triggered_by: String,

    /// Print the job handle as JSON
    #[arg(long)]
    json: bool,
}

/// Run the enqueue command
pub async fn run(args: EnqueueArgs, app: &App) -> Result<()> {
    let task: TaskName = args.task.parse()?;
    let input: serde_json::Value =
        serde_json::from_str(&args.input).context("Input is not valid JSON")?;
    let triggered_by: TriggeredBy = args
        .triggered_by
        .parse()
        .map_err(|e| anyhow!("Invalid --triggered-by: {}", e))?;

    let mut request = EnqueueRequest::new(triggered_by).with_input(input);
    if let Some(user_id) = args.user_id {
        request = request.with_user(user_id);
    }

    let handle = app.queue.enqueue(task, request).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&handle)?);
        return Ok(());
    }

    print_success(&format!("Queued {}", task.to_string().green()));
    println!("  {} {}", "Job:".dimmed(), handle.job_id);
    println!("  {} {}", "Run:".dimmed(), handle.task_id);
    println!("  {} {}", "Status:".dimmed(), job_status_label(handle.status));
    if let Some(error) = &handle.last_error {
        println!("  {} {}", "Error:".dimmed(), error.red());
    }
    Ok(())
}
