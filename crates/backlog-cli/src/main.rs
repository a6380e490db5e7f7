//! backlog - background task worker and admin CLI
//!
//! # Usage
//!
//! ```bash
//! # Consume the durable queue and fire configured schedules
//! backlog worker
//!
//! # Queue a task
//! backlog enqueue refresh-media '{"mediaType": "anime", "limit": 20}'
//!
//! # Inspect what ran
//! backlog runs list
//! backlog runs show 5f0c...
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod app;
mod commands;
mod config;
mod telemetry;

use app::App;
use commands::{enqueue, jobs, runs, tasks, worker};
use config::AppConfig;

/// backlog - background tasks for the media-list site
#[derive(Parser)]
#[command(
    name = "backlog",
    version,
    about = "Run and inspect backlog background tasks",
    long_about = "Runs the task worker, queues tasks and inspects run history.\n\n\
                  Configuration is read from ./backlog.toml (or --config) and\n\
                  BACKLOG__* environment variables."
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "BACKLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue worker and scheduler until interrupted
    #[command(name = "worker")]
    Worker(worker::WorkerArgs),

    /// Queue a task
    #[command(name = "enqueue")]
    Enqueue(enqueue::EnqueueArgs),

    /// Registered tasks
    #[command(name = "tasks")]
    Tasks(tasks::TasksArgs),

    /// Run history
    #[command(name = "runs")]
    Runs(runs::RunsArgs),

    /// Queued jobs
    #[command(name = "jobs")]
    Jobs(jobs::JobsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    telemetry::init_tracing(cli.verbose, &config.log);

    let app = App::build(config).await?;
    let result = match cli.command {
        Commands::Worker(args) => worker::run(args, &app).await,
        Commands::Enqueue(args) => enqueue::run(args, &app).await,
        Commands::Tasks(args) => tasks::run(args, &app),
        Commands::Runs(args) => runs::run(args, &app).await,
        Commands::Jobs(args) => jobs::run(args, &app).await,
    };
    app.shutdown().await;
    result
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message with an X
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
