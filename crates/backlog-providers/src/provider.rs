//! Media provider trait and common types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::rate_limit::{LimiterError, RateLimiter};

/// Errors from media providers
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Non-2xx response
    #[error("Provider returned {status}: {description}")]
    Status { status: u16, description: String },
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Unknown id: {0}")]
    NotFound(String),
    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

impl ProviderError {
    /// Worth retrying later: network faults, throttling and server errors
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Connection(_) => true,
            Self::Limiter(LimiterError::InvalidConfig(_)) => false,
            Self::Limiter(_) => true,
            Self::InvalidResponse(_) | Self::NotFound(_) => false,
        }
    }
}

/// Kinds of media tracked by the site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Series,
    Anime,
    Book,
    Game,
}

impl MediaType {
    pub const ALL: [MediaType; 5] = [
        MediaType::Movie,
        MediaType::Series,
        MediaType::Anime,
        MediaType::Book,
        MediaType::Game,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Series => "series",
            Self::Anime => "anime",
            Self::Book => "book",
            Self::Game => "game",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown media type: {}", s))
    }
}

/// A third-party source of media metadata
#[async_trait]
pub trait MediaProvider: Send + Sync + fmt::Debug {
    /// Provider name, also its rate limit key prefix
    fn name(&self) -> &str;

    /// Fetch the raw payload for one external id
    async fn fetch(&self, id: &str) -> Result<serde_json::Value, ProviderError>;
}

/// Provider serving canned payloads; used in development and tests
#[derive(Debug, Default)]
pub struct StaticProvider {
    name: String,
    payloads: HashMap<String, serde_json::Value>,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payloads: HashMap::new(),
        }
    }

    pub fn with_payload(mut self, id: impl Into<String>, payload: serde_json::Value) -> Self {
        self.payloads.insert(id.into(), payload);
        self
    }
}

#[async_trait]
impl MediaProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, id: &str) -> Result<serde_json::Value, ProviderError> {
        self.payloads
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::Status {
                status: 404,
                description: format!("{} has no record {}", self.name, id),
            })
    }
}

/// Draws one point from the provider's budget before every fetch
#[derive(Debug)]
pub struct RateLimitedProvider<P: MediaProvider> {
    inner: P,
    limiter: Arc<RateLimiter>,
}

impl<P: MediaProvider> RateLimitedProvider<P> {
    /// All callers share the `global` key of the limiter
    pub const KEY: &'static str = "global";

    pub fn new(inner: P, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl<P: MediaProvider> MediaProvider for RateLimitedProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self, id: &str) -> Result<serde_json::Value, ProviderError> {
        self.limiter.consume(Self::KEY, 1).await?;
        self.inner.fetch(id).await
    }
}
