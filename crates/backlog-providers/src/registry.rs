//! Media type to provider routing

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::http::HttpProvider;
use crate::provider::{MediaProvider, MediaType, RateLimitedProvider, StaticProvider};
use crate::rate_limit::{LimiterError, RateLimiterConfig, RateLimiterFactory};

/// One external source and its call budget
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub media_type: MediaType,
    /// Limiter prefix; entries sharing it share one budget
    pub key_prefix: String,
    /// Without a base URL the provider serves nothing (development)
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub points: u32,
    pub duration_secs: u64,
}

impl ProviderConfig {
    fn new(media_type: MediaType, key_prefix: &str, base_url: &str, points: u32, secs: u64) -> Self {
        Self {
            media_type,
            key_prefix: key_prefix.to_string(),
            base_url: Some(base_url.to_string()),
            api_key: None,
            points,
            duration_secs: secs,
        }
    }

    /// Public endpoints and their published budgets
    pub fn defaults() -> Vec<ProviderConfig> {
        vec![
            Self::new(MediaType::Movie, "tmdbAPI", "https://api.themoviedb.org/3/movie", 40, 10),
            Self::new(MediaType::Series, "tmdbAPI", "https://api.themoviedb.org/3/tv", 40, 10),
            Self::new(MediaType::Anime, "jikanAPI", "https://api.jikan.moe/v4/anime", 3, 1),
            Self::new(MediaType::Book, "openLibraryAPI", "https://openlibrary.org/works", 100, 300),
            Self::new(MediaType::Game, "igdbAPI", "https://api.igdb.com/v4/games", 4, 1),
        ]
    }

    fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::new(self.key_prefix.clone(), self.points, self.duration_secs)
    }
}

/// Rate-limited providers keyed by media type
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<MediaType, Arc<dyn MediaProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider behind a limiter from `factory`
    pub fn from_configs(
        configs: &[ProviderConfig],
        factory: &RateLimiterFactory,
    ) -> Result<Self, LimiterError> {
        let mut registry = Self::new();
        for config in configs {
            let limiter = factory.create_rate_limiter(config.limiter_config())?;
            let provider: Arc<dyn MediaProvider> = match &config.base_url {
                Some(base_url) => Arc::new(RateLimitedProvider::new(
                    HttpProvider::new(&config.key_prefix, base_url, config.api_key.clone()),
                    limiter,
                )),
                None => Arc::new(RateLimitedProvider::new(
                    StaticProvider::new(config.key_prefix.clone()),
                    limiter,
                )),
            };
            info!(
                media_type = %config.media_type,
                provider = %config.key_prefix,
                points = config.points,
                duration_secs = config.duration_secs,
                "Registered media provider"
            );
            registry.insert(config.media_type, provider);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, media_type: MediaType, provider: Arc<dyn MediaProvider>) {
        self.providers.insert(media_type, provider);
    }

    pub fn get(&self, media_type: MediaType) -> Option<Arc<dyn MediaProvider>> {
        self.providers.get(&media_type).cloned()
    }

    pub fn media_types(&self) -> Vec<MediaType> {
        let mut types: Vec<_> = self.providers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}
