//! HTTP media provider

use async_trait::async_trait;
use std::time::Duration;

use crate::provider::{MediaProvider, ProviderError};

/// Fetches `GET {base_url}/{id}` as JSON
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    base_url: String,
    /// Sent as a bearer token when set
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: &str, base_url: &str, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    fn url(&self, id: &str) -> String {
        format!("{}/{}", self.base_url, id)
    }
}

#[async_trait]
impl MediaProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, id: &str) -> Result<serde_json::Value, ProviderError> {
        let mut request = self.client.get(self.url(id));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let description = if body.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            };
            return Err(ProviderError::Status {
                status: status.as_u16(),
                description,
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let provider = HttpProvider::new("tmdbAPI", "https://api.example.org/3/movie/", None);
        assert_eq!(provider.url("603"), "https://api.example.org/3/movie/603");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let provider = HttpProvider::new("local", "http://127.0.0.1:1", None);
        let err = provider.fetch("1").await.unwrap_err();
        assert!(matches!(err, ProviderError::Connection(_)));
        assert!(err.is_transient());
    }
}
