//! CLI subcommands

pub mod enqueue;
pub mod jobs;
pub mod runs;
pub mod tasks;
pub mod worker;

use backlog_persist::RunStatus;
use backlog_queue::JobStatus;
use colored::{ColoredString, Colorize};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

/// Empty table with the shared look and a cyan header
pub(crate) fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

pub(crate) fn run_status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Queued => Color::Blue,
        RunStatus::Running => Color::Yellow,
        RunStatus::Succeeded => Color::Green,
        RunStatus::Failed => Color::Red,
    }
}

pub(crate) fn job_status_label(status: JobStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        JobStatus::Completed => label.green(),
        JobStatus::Failed => label.red(),
        JobStatus::Cancelled => label.dimmed(),
        JobStatus::Active => label.yellow(),
        JobStatus::Waiting => label.blue(),
    }
}
