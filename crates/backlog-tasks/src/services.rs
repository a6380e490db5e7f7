//! Shared dependencies handed to task handlers

use backlog_persist::{Database, MediaStore, RunHistoryStore};
use backlog_providers::ProviderRegistry;
use std::sync::Arc;

use crate::definition::RetryPolicy;

#[derive(Debug, Clone)]
pub struct TaskServices {
    pub db: Database,
    pub media: MediaStore,
    pub providers: ProviderRegistry,
    pub runs: Arc<dyn RunHistoryStore>,
    pub default_retry: RetryPolicy,
}

impl TaskServices {
    pub fn new(db: Database, providers: ProviderRegistry, runs: Arc<dyn RunHistoryStore>) -> Self {
        Self {
            media: MediaStore::new(db.clone()),
            db,
            providers,
            runs,
            default_retry: RetryPolicy::default(),
        }
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }
}
