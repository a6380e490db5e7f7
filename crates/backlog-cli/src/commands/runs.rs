//! Runs command - inspect and clean up run history
//!
//! Usage:
//! ```bash
//! backlog runs list --limit 50
//! backlog runs show 9b2f0c4e-...
//! backlog runs delete 9b2f0c4e-...
//! ```

use anyhow::{bail, Result};
use backlog_persist::{LogLevel, TaskRun};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::Cell;
use uuid::Uuid;

use crate::app::App;
use crate::commands::{run_status_color, table};
use crate::{print_error, print_success};

/// Arguments for the runs command
#[derive(Args)]
pub struct RunsArgs {
    #[command(subcommand)]
    command: RunsCommand,
}

#[derive(Subcommand)]
enum RunsCommand {
    /// Most recent runs first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// One run with its logs
    Show {
        task_id: Uuid,

        /// Print the stored record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a run record
    Delete { task_id: Uuid },
}

/// Run the runs command
pub async fn run(args: RunsArgs, app: &App) -> Result<()> {
    match args.command {
        RunsCommand::List { limit } => list(app, limit).await,
        RunsCommand::Show { task_id, json } => show(app, task_id, json).await,
        RunsCommand::Delete { task_id } => delete(app, task_id).await,
    }
}

fn format_duration(run: &TaskRun) -> String {
    match run.duration() {
        None => "-".to_string(),
        Some(d) if d.num_milliseconds() < 1000 => format!("{}ms", d.num_milliseconds()),
        Some(d) if d.num_seconds() < 120 => format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0),
        Some(d) => format!("{}m{}s", d.num_minutes(), d.num_seconds() % 60),
    }
}

async fn list(app: &App, limit: usize) -> Result<()> {
    let runs = app.runs.list_runs(limit).await?;
    if runs.is_empty() {
        println!("{}", "No runs recorded".dimmed());
        return Ok(());
    }

    let mut table = table(&[
        "Run", "Task", "Status", "Triggered by", "Started", "Duration", "Attempts",
    ]);
    for run in &runs {
        table.add_row(vec![
            Cell::new(run.task_id),
            Cell::new(&run.task_name),
            Cell::new(run.status).fg(run_status_color(run.status)),
            Cell::new(run.triggered_by),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(format_duration(run)),
            Cell::new(run.attempts),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn show(app: &App, task_id: Uuid, json: bool) -> Result<()> {
    let Some(run) = app.runs.get_run(task_id).await? else {
        bail!("No run with id {}", task_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!("{} {}", run.task_name.bold().cyan(), run.task_id.to_string().dimmed());
    println!("  {} {}", "Status:".dimmed(), run.status);
    println!("  {} {}", "Triggered by:".dimmed(), run.triggered_by);
    if let Some(user_id) = &run.user_id {
        println!("  {} {}", "User:".dimmed(), user_id);
    }
    println!("  {} {}", "Started:".dimmed(), run.started_at.to_rfc3339());
    println!("  {} {}", "Duration:".dimmed(), format_duration(&run));
    println!("  {} {}", "Attempts:".dimmed(), run.attempts);
    if let Some(error) = &run.error_message {
        println!("  {} {}", "Error:".dimmed(), error.red());
    }

    println!();
    println!("{}", "Logs:".bold());
    for entry in &run.logs {
        let level = match entry.level {
            LogLevel::Info => "INFO ".green(),
            LogLevel::Warn => "WARN ".yellow(),
            LogLevel::Error => "ERROR".red(),
        };
        let step = entry
            .step
            .as_deref()
            .map(|s| format!("[{}] ", s))
            .unwrap_or_default();
        println!(
            "  {} {} {}{}",
            entry.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            level,
            step.cyan(),
            entry.message
        );
    }
    Ok(())
}

async fn delete(app: &App, task_id: Uuid) -> Result<()> {
    if app.runs.delete_run(task_id).await? {
        print_success(&format!("Deleted run {}", task_id));
    } else {
        print_error(&format!("No run with id {}", task_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backlog_persist::{RunStatus, TriggeredBy};
    use chrono::{Duration, Utc};

    fn run_taking(duration: Option<Duration>) -> TaskRun {
        let started_at = Utc::now();
        TaskRun {
            task_id: Uuid::new_v4(),
            task_name: "db-maintenance".into(),
            status: RunStatus::Succeeded,
            triggered_by: TriggeredBy::CronOrCli,
            user_id: None,
            started_at,
            finished_at: duration.map(|d| started_at + d),
            error_message: None,
            attempts: 1,
            logs: Vec::new(),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&run_taking(None)), "-");
        assert_eq!(format_duration(&run_taking(Some(Duration::milliseconds(250)))), "250ms");
        assert_eq!(format_duration(&run_taking(Some(Duration::milliseconds(1500)))), "1.5s");
        assert_eq!(format_duration(&run_taking(Some(Duration::seconds(185)))), "3m5s");
    }
}
