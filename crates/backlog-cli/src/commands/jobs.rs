//! Jobs command - inspect or cancel a queued job
//!
//! Usage:
//! ```bash
//! backlog jobs show 1c7e...
//! backlog jobs cancel 1c7e...
//! ```

use anyhow::Result;
use backlog_queue::JobId;
use clap::{Args, Subcommand};
use colored::Colorize;

use crate::app::App;
use crate::commands::job_status_label;
use crate::print_success;

/// Arguments for the jobs command
#[derive(Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    command: JobsCommand,
}

#[derive(Subcommand)]
enum JobsCommand {
    /// Status, attempts and progress of a job
    Show {
        job_id: JobId,

        #[arg(long)]
        json: bool,
    },

    /// Cancel a job that has not started
    Cancel { job_id: JobId },
}

/// Run the jobs command
pub async fn run(args: JobsArgs, app: &App) -> Result<()> {
    match args.command {
        JobsCommand::Show { job_id, json } => {
            let job = app.queue.get_job(job_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
                return Ok(());
            }
            println!("{} {}", job.task_name.to_string().bold().cyan(), job.job_id.to_string().dimmed());
            println!("  {} {}", "Status:".dimmed(), job_status_label(job.status));
            println!("  {} {}", "Run:".dimmed(), job.task_id);
            println!("  {} {}", "Attempts:".dimmed(), job.attempts);
            println!("  {} {}%", "Progress:".dimmed(), job.progress);
            if let Some(error) = &job.last_error {
                println!("  {} {}", "Last error:".dimmed(), error.red());
            }
            Ok(())
        }
        JobsCommand::Cancel { job_id } => {
            app.queue.cancel(job_id).await?;
            print_success(&format!("Cancelled job {}", job_id));
            Ok(())
        }
    }
}
