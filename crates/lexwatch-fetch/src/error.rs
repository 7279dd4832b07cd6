use lexwatch_core::SourceKind;
use thiserror::Error;

use crate::retry::Retryable;

/// Why a fetch failed. [`FetchError::is_transient`] decides whether a retry
/// can help.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("source {0} has no external identifier")]
    MissingExternalId(String),
    #[error("robots.txt disallows {0}")]
    RobotsDisallowed(String),
    #[error("no fetcher registered for {} sources", .0.as_str())]
    Unsupported(SourceKind),
    #[error("run deadline exceeded")]
    DeadlineExceeded,
    #[error("HTTP request failed: {0}")]
    Http(String),
}

impl FetchError {
    /// Timeouts, connection failures, 5xx and 429 are worth retrying.
    /// Everything else fails the same way next time.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) => true,
            Self::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            // Failures while sending or streaming are resets as far as we can tell.
            Self::Connect(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Server {
                status: status.as_u16(),
                body: String::new(),
            }
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<quick_xml::Error> for FetchError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for FetchError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        FetchError::is_transient(self)
    }

    fn timed_out() -> Self {
        Self::Timeout
    }

    fn deadline_exceeded() -> Self {
        Self::DeadlineExceeded
    }
}
