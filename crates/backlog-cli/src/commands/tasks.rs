//! Tasks command - list registered tasks and their input schemas
//!
//! Usage:
//! ```bash
//! backlog tasks list
//! backlog tasks schema refresh-media
//! ```

use anyhow::Result;
use backlog_tasks::TaskDefinition;
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{Cell, Color};

use crate::app::App;
use crate::commands::table;

/// Arguments for the tasks command
#[derive(Args)]
pub struct TasksArgs {
    #[command(subcommand)]
    command: TasksCommand,
}

#[derive(Subcommand)]
enum TasksCommand {
    /// List registered tasks
    List,

    /// Print a task's input schema
    Schema {
        /// Task name
        name: String,
    },
}

/// Run the tasks command
pub fn run(args: TasksArgs, app: &App) -> Result<()> {
    match args.command {
        TasksCommand::List => list(app),
        TasksCommand::Schema { name } => schema(app, &name),
    }
}

fn retries(app: &App, definition: &TaskDefinition) -> String {
    app.registry.retry_policy(definition.name).max_retries.to_string()
}

fn list(app: &App) -> Result<()> {
    let mut table = table(&["Name", "Visibility", "Retries", "Timeout", "Description"]);
    for definition in app.registry.definitions() {
        table.add_row(vec![
            Cell::new(definition.name).fg(Color::Green),
            Cell::new(definition.visibility.as_str()).fg(Color::Yellow),
            Cell::new(retries(app, definition)),
            Cell::new(
                definition
                    .timeout
                    .map(|t| format!("{}s", t.as_secs()))
                    .unwrap_or_else(|| "-".into()),
            ),
            Cell::new(definition.description),
        ]);
    }

    println!("{}", "Registered Tasks".bold().cyan());
    println!("{table}");
    Ok(())
}

fn schema(app: &App, name: &str) -> Result<()> {
    let definition = app.registry.get_task(name)?;
    println!("{}", definition.name.to_string().bold().cyan());
    println!("{}", definition.description.dimmed());
    println!();
    println!("{}", serde_json::to_string_pretty(definition.input_schema.raw())?);
    Ok(())
}
