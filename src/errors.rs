//! Classification of failed report requests.
//!
//! Everything that goes wrong while submitting or polling a report ends up as
//! a [`ReportError`], and every `ReportError` reduces to one [`ErrorKind`].
//! Callers branch on the kind, never on message text.

use crate::http::{HttpResponse, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Message stored in a report's timeout / general error slot
pub const DATA_LOADING_FAILED: &str = "Data loading failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Deadline exceeded, per-call watchdog fired, or a transient 5xx / 408
    Timeout,
    /// The report handle has expired (HTTP 404)
    NotFound,
    /// No HTTP response was obtained
    Network,
    /// Permanent client-side fault (4xx other than 404 and 408)
    BadRequest,
    Unknown,
}

impl ErrorKind {
    /// Classify a status code that the caller already treats as a failure
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            400..=499 => ErrorKind::BadRequest,
            500..=599 => ErrorKind::Timeout,
            _ => ErrorKind::Unknown,
        }
    }

    /// Transient kinds are retried inside a polling session
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Network)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Network => "network",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("report request timed out: {message}")]
    Timeout { status: Option<u16>, message: String },

    #[error("report not found (HTTP {status}){}", hint_suffix(.hint))]
    NotFound { status: u16, hint: Option<String> },

    #[error("bad report request (HTTP {status}){}", hint_suffix(.hint))]
    BadRequest { status: u16, hint: Option<String> },

    #[error("unexpected report response: {message}")]
    Unknown { status: Option<u16>, message: String },
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_ref().map(|h| format!(": {h}")).unwrap_or_default()
}

impl ReportError {
    /// Build the error for a response whose status the caller did not expect
    pub fn from_response(response: &HttpResponse) -> Self {
        let status = response.status;
        let hint = response.hint_info();
        match ErrorKind::from_status(status) {
            ErrorKind::NotFound => ReportError::NotFound { status, hint },
            ErrorKind::BadRequest => ReportError::BadRequest { status, hint },
            ErrorKind::Timeout => ReportError::Timeout {
                status: Some(status),
                message: hint.unwrap_or_else(|| format!("HTTP {status}")),
            },
            ErrorKind::Network | ErrorKind::Unknown => ReportError::Unknown {
                status: Some(status),
                message: hint.unwrap_or_else(|| format!("HTTP {status}")),
            },
        }
    }

    /// A 2xx body that could not be decoded into the expected DTO
    pub fn malformed(status: u16, error: &serde_json::Error) -> Self {
        ReportError::Unknown {
            status: Some(status),
            message: format!("malformed body: {error}"),
        }
    }

    pub fn deadline_exceeded(elapsed_ms: u64, last_status: Option<u16>) -> Self {
        ReportError::Timeout {
            status: last_status,
            message: format!("no terminal report after {elapsed_ms}ms"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReportError::Network { .. } => ErrorKind::Network,
            ReportError::Timeout { .. } => ErrorKind::Timeout,
            ReportError::NotFound { .. } => ErrorKind::NotFound,
            ReportError::BadRequest { .. } => ErrorKind::BadRequest,
            ReportError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Whether this error means a report link is no longer valid
    pub fn is_expired_link(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ReportError::Network { .. } => None,
            ReportError::Timeout { status, .. } | ReportError::Unknown { status, .. } => *status,
            ReportError::NotFound { status, .. } | ReportError::BadRequest { status, .. } => {
                Some(*status)
            }
        }
    }
}

impl From<TransportError> for ReportError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout { .. } => ReportError::Timeout {
                status: None,
                message: error.to_string(),
            },
            TransportError::Network { .. } => ReportError::Network {
                message: error.to_string(),
            },
        }
    }
}
