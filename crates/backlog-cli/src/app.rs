//! Wiring from configuration to running services

use anyhow::{Context, Result};
use backlog_persist::{Database, RunHistoryStore, SqliteQueueBackend, SqliteRunStore};
use backlog_providers::{ProviderRegistry, RateLimiterFactory};
use backlog_queue::QueueBackend;
use backlog_tasks::{
    register_all_tasks, DurableQueue, InProcessQueue, TaskExecutor, TaskQueue, TaskRegistry,
    TaskServices,
};
use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, QueueMode};

pub struct App {
    pub config: AppConfig,
    pub db: Database,
    pub registry: Arc<TaskRegistry>,
    pub executor: Arc<TaskExecutor>,
    pub runs: Arc<dyn RunHistoryStore>,
    pub backend: Arc<dyn QueueBackend>,
    pub queue: Arc<dyn TaskQueue>,
}

impl App {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let db = Database::connect(&config.database)
            .await
            .with_context(|| format!("Failed to open database {}", config.database.url))?;

        let limiters = RateLimiterFactory::from_settings(&config.limiter)
            .await
            .context("Failed to set up rate limiters")?;
        let providers = ProviderRegistry::from_configs(&config.providers(), &limiters)
            .context("Invalid provider configuration")?;

        let runs: Arc<dyn RunHistoryStore> = Arc::new(SqliteRunStore::new(db.clone()));
        let services = TaskServices::new(db.clone(), providers, runs.clone())
            .with_default_retry(config.queue.retry_policy());
        let registry = Arc::new(register_all_tasks(&services)?);
        let executor = Arc::new(TaskExecutor::new(registry.clone(), db.clone(), runs.clone()));

        let backend: Arc<dyn QueueBackend> = Arc::new(SqliteQueueBackend::new(db.pool().clone()));
        let queue: Arc<dyn TaskQueue> = match config.queue.mode {
            QueueMode::Durable => Arc::new(DurableQueue::new(backend.clone(), registry.clone())),
            QueueMode::InProcess => Arc::new(InProcessQueue::new(executor.clone())),
        };

        info!(
            tasks = registry.len(),
            limiter = limiters.backend_name(),
            mode = ?config.queue.mode,
            "Task services ready"
        );

        Ok(Self {
            config,
            db,
            registry,
            executor,
            runs,
            backend,
            queue,
        })
    }

    pub async fn shutdown(&self) {
        self.queue.close().await;
        self.db.close().await;
    }
}
