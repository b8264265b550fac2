use crate::config::ServerConfig;
use crate::http::transport::{HttpResponse, ReportTransport, TransportError};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Rate-limited HTTP client for the report service
#[derive(Debug)]
pub struct RateLimitedHttpClient {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    base_url: String,
    request_timeout: Duration,
}

impl RateLimitedHttpClient {
    /// Create a new rate-limited HTTP client
    pub fn new(config: &ServerConfig) -> Result<Self, reqwest::Error> {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_capacity).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            rate_limiter,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a callback or resource path against the API base
    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    async fn execute(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<HttpResponse, TransportError> {
        // Wait for rate limit permission
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(50)))
            .await;

        let response = request.send().await.map_err(|e| self.map_error(url, e))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| self.map_error(url, e))?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        debug!(url = %url, status, "Report service responded");
        Ok(HttpResponse::new(status, body))
    }

    fn map_error(&self, url: &str, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout {
                url: url.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            TransportError::Network {
                url: url.to_string(),
                message: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl ReportTransport for RateLimitedHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        let resolved = self.resolve(url);
        let request = self.client.get(&resolved);
        self.execute(&resolved, request).await
    }

    async fn post(&self, url: &str, body: Option<Value>) -> Result<HttpResponse, TransportError> {
        let resolved = self.resolve(url);
        let mut request = self.client.post(&resolved);
        if let Some(body) = body {
            request = request.json(&body);
        }
        self.execute(&resolved, request).await
    }
}
