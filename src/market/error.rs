// =============================================================================
// Upstream error classification
// =============================================================================
//
// Every MarketClient operation resolves to ok or one of three behavioural
// classes.  The data plane reacts differently to each: rate-limited feeds the
// gate's backoff and is never surfaced as a failure; transient is retried a
// bounded number of times; fatal propagates.
// =============================================================================

use thiserror::Error;

/// Typed outcome classes for upstream calls.
#[derive(Debug, Clone, Error)]
pub enum MarketError {
    /// The exchange said slow down (HTTP 429 and friends).
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    /// Network failure or 5xx — worth retrying shortly.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Anything that retrying will not fix (auth, bad request, parse).
    #[error("fatal upstream error: {0}")]
    Fatal(String),
}

impl MarketError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status + body into an error class.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.as_u16() == 418
        {
            Self::RateLimited(format!("{status}: {body}"))
        } else if status.is_server_error() {
            Self::Transient(format!("{status}: {body}"))
        } else {
            Self::Fatal(format!("{status}: {body}"))
        }
    }
}

impl From<reqwest::Error> for MarketError {
    fn from(err: reqwest::Error) -> Self {
        // Connect/timeout/body failures are all retryable from our side.
        Self::Transient(err.to_string())
    }
}
