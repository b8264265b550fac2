//! Request/response seam between the report engine and the network.
//!
//! Every call returns a plain [`HttpResponse`] value or a [`TransportError`].
//! Nothing here keeps response state between calls, so each caller owns its
//! own snapshot of what the server said.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

/// Status code and decoded body of a completed HTTP exchange
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn empty(status: u16) -> Self {
        Self::new(status, Value::Null)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body into a typed DTO
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    /// Server supplied hint text, if the error body carries one
    pub fn hint_info(&self) -> Option<String> {
        self.body
            .get("hintInfo")
            .or_else(|| self.body.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Failures where no HTTP status was obtained
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("network failure for {url}: {message}")]
    Network { url: String, message: String },
}

/// Opaque transport used by the polling client and the share loader.
///
/// `url` is either absolute or relative to the configured API base, which is
/// how callback URLs come back from the report service.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ReportTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;

    async fn post(&self, url: &str, body: Option<Value>) -> Result<HttpResponse, TransportError>;
}
