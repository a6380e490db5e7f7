//! Application configuration
//!
//! Read from an optional TOML file, then overridden by `BACKLOG__*`
//! environment variables (`BACKLOG__QUEUE__CONCURRENCY=8`).

use anyhow::{Context, Result};
use backlog_persist::SqliteConfig;
use backlog_providers::{LimiterSettings, ProviderConfig};
use backlog_queue::{BackoffStrategy, WorkerConfig};
use backlog_tasks::{RetryPolicy, Schedule, TaskName, MAX_INTERVAL};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: SqliteConfig,
    pub queue: QueueSettings,
    pub limiter: LimiterSettings,
    /// Empty means the public endpoints with their published budgets
    pub providers: Vec<ProviderConfig>,
    pub schedules: Vec<ScheduleConfig>,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Jobs go to the `jobs` table and a worker process runs them
    Durable,
    /// `enqueue` runs the task before returning
    InProcess,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub mode: QueueMode,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub backoff_initial_secs: u64,
    pub stale_after_secs: u64,
    /// How often a running job renews its claim
    pub heartbeat_secs: u64,
    /// Deliveries after which a job whose worker keeps dying is failed
    pub max_deliveries: u32,
    pub retention_hours: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::Durable,
            concurrency: 5,
            poll_interval_ms: 500,
            max_retries: 3,
            backoff_initial_secs: 5,
            stale_after_secs: 60 * 60,
            heartbeat_secs: 60,
            max_deliveries: 10,
            retention_hours: 7 * 24,
            shutdown_timeout_secs: 30,
        }
    }
}

impl QueueSettings {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_concurrency: self.concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            drain_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            stale_after: (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            max_attempts: self.max_deliveries.max(1),
            retention: (self.retention_hours > 0)
                .then(|| Duration::from_secs(self.retention_hours * 60 * 60)),
            ..Default::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: BackoffStrategy::Exponential {
                initial_secs: self.backoff_initial_secs,
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub task: String,
    pub every_secs: u64,
    /// Task input as a JSON document
    #[serde(default)]
    pub input: Option<String>,
}

impl ScheduleConfig {
    pub fn to_schedule(&self) -> Result<Schedule> {
        let task: TaskName = self
            .task
            .parse()
            .with_context(|| format!("Unknown task in schedule: {}", self.task))?;
        anyhow::ensure!(self.every_secs > 0, "Schedule for {} has every_secs = 0", task);
        anyhow::ensure!(
            self.every_secs <= MAX_INTERVAL.as_secs(),
            "Schedule for {} has every_secs above {}",
            task,
            MAX_INTERVAL.as_secs()
        );

        let schedule = Schedule::new(task, Duration::from_secs(self.every_secs));
        Ok(match &self.input {
            Some(input) => schedule.with_input(
                serde_json::from_str(input)
                    .with_context(|| format!("Schedule for {} has invalid input JSON", task))?,
            ),
            None => schedule,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset and no `-v` is given
    pub filter: Option<String>,
    /// One JSON object per line instead of human-readable output
    pub json: bool,
}

impl AppConfig {
    /// Load from `path` (must exist) or `./backlog.toml` (optional), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::with_name(&path.to_string_lossy()).required(true),
            None => config::File::with_name("backlog").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("BACKLOG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn providers(&self) -> Vec<ProviderConfig> {
        if self.providers.is_empty() {
            ProviderConfig::defaults()
        } else {
            self.providers.clone()
        }
    }

    pub fn schedules(&self) -> Result<Vec<Schedule>> {
        self.schedules.iter().map(ScheduleConfig::to_schedule).collect()
    }
}
