//! Rate limiting for outbound provider calls
//!
//! Fixed-window budgets keyed by `key_prefix:key`. `points` tokens are
//! available per `duration`; once spent, calls are rejected with the time
//! left until the window replenishes.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::store::{LimiterStore, MemoryStore};

/// Rate limit error
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    #[error("Rate limited on {key}, retry after {ms_before_next}ms")]
    RateLimited { key: String, ms_before_next: u64 },
    #[error("Rate limiter store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Rate limiter store error: {0}")]
    Store(String),
    #[error("Invalid rate limiter configuration: {0}")]
    InvalidConfig(String),
}

impl LimiterError {
    /// How long to back off before the budget allows another call
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { ms_before_next, .. } => {
                Some(Duration::from_millis(*ms_before_next))
            }
            _ => None,
        }
    }
}

/// Budget for one external resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// One prefix per external resource, e.g. "tmdbAPI"
    pub key_prefix: String,
    /// Tokens per window
    pub points: u32,
    /// Window length
    pub duration: Duration,
}

impl RateLimiterConfig {
    pub fn new(key_prefix: impl Into<String>, points: u32, duration_secs: u64) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            points,
            duration: Duration::from_secs(duration_secs),
        }
    }

    fn validate(&self) -> Result<(), LimiterError> {
        if self.key_prefix.is_empty() {
            return Err(LimiterError::InvalidConfig("key_prefix is empty".into()));
        }
        if self.points == 0 {
            return Err(LimiterError::InvalidConfig(format!(
                "{}: points must be positive",
                self.key_prefix
            )));
        }
        if self.duration.is_zero() {
            return Err(LimiterError::InvalidConfig(format!(
                "{}: duration must be positive",
                self.key_prefix
            )));
        }
        Ok(())
    }
}

/// Budget left after a successful consume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    pub remaining_points: u32,
    pub ms_before_next: u64,
}

/// Rate limiter for one external resource
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn LimiterStore>,
}

impl RateLimiter {
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    /// Take `cost` points for `key`, or fail with the time until the next window
    pub async fn consume(&self, key: &str, cost: u32) -> Result<RateLimitState, LimiterError> {
        if cost > self.config.points {
            return Err(LimiterError::InvalidConfig(format!(
                "cost {} exceeds the {} point budget of {}",
                cost, self.config.points, self.config.key_prefix
            )));
        }

        let storage_key = self.storage_key(key);
        let consumption = self
            .store
            .consume(
                &storage_key,
                cost,
                self.config.points,
                self.config.duration,
            )
            .await?;

        if consumption.allowed {
            Ok(RateLimitState {
                remaining_points: self.config.points.saturating_sub(consumption.consumed),
                ms_before_next: consumption.ms_before_next,
            })
        } else {
            debug!(
                key = %storage_key,
                ms_before_next = consumption.ms_before_next,
                "Rate limit budget exhausted"
            );
            Err(LimiterError::RateLimited {
                key: storage_key,
                ms_before_next: consumption.ms_before_next,
            })
        }
    }

    /// Consume, sleeping through exhausted windows until the budget allows it
    pub async fn acquire(&self, key: &str, cost: u32) -> Result<RateLimitState, LimiterError> {
        loop {
            match self.consume(key, cost).await {
                Err(LimiterError::RateLimited { ms_before_next, .. }) => {
                    tokio::time::sleep(Duration::from_millis(ms_before_next.max(1))).await;
                }
                other => return other,
            }
        }
    }

    /// Restore the full budget for `key`
    pub async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.store.reset(&self.storage_key(key)).await
    }
}

/// Limiter backend selection, read once at startup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimiterSettings {
    /// Keep budgets in Redis so every worker process shares them
    #[serde(default)]
    pub shared: bool,
    pub redis_url: Option<String>,
}

/// Hands out one limiter per key prefix, all backed by the same store
#[derive(Debug)]
pub struct RateLimiterFactory {
    store: Arc<dyn LimiterStore>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterFactory {
    /// Factory over an explicit store
    pub fn with_store(store: Arc<dyn LimiterStore>) -> Self {
        Self {
            store,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Process-local budgets; only for single-process deployments
    pub fn local() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Budgets shared through Redis. Fails if the store cannot be reached.
    #[cfg(feature = "redis")]
    pub async fn shared(redis_url: &str) -> Result<Self, LimiterError> {
        let store = crate::redis_store::RedisStore::connect(redis_url).await?;
        Ok(Self::with_store(Arc::new(store)))
    }

    /// Build the backend named by `settings`.
    ///
    /// A shared backend that cannot be reached is an error; it never falls
    /// back to local budgets, which would under-count calls made by other
    /// processes.
    pub async fn from_settings(settings: &LimiterSettings) -> Result<Self, LimiterError> {
        if !settings.shared {
            info!("Using process-local rate limiter store");
            return Ok(Self::local());
        }

        let url = settings.redis_url.as_deref().ok_or_else(|| {
            LimiterError::InvalidConfig("shared rate limiter requires redis_url".into())
        })?;

        #[cfg(feature = "redis")]
        {
            let factory = Self::shared(url).await?;
            info!("Using shared Redis rate limiter store");
            Ok(factory)
        }

        #[cfg(not(feature = "redis"))]
        {
            Err(LimiterError::InvalidConfig(format!(
                "shared rate limiter at {} requested but built without redis support",
                url
            )))
        }
    }

    pub fn backend_name(&self) -> &str {
        self.store.name()
    }

    /// Limiter for `config.key_prefix`; the same prefix always yields the same instance
    pub fn create_rate_limiter(
        &self,
        config: RateLimiterConfig,
    ) -> Result<Arc<RateLimiter>, LimiterError> {
        config.validate()?;

        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = limiters.get(&config.key_prefix) {
            if existing.config != config {
                return Err(LimiterError::InvalidConfig(format!(
                    "{} already has a limiter with a different budget",
                    config.key_prefix
                )));
            }
            return Ok(existing.clone());
        }

        let limiter = Arc::new(RateLimiter {
            config: config.clone(),
            store: self.store.clone(),
        });
        limiters.insert(config.key_prefix, limiter.clone());
        Ok(limiter)
    }
}
