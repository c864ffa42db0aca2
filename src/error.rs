use std::time::Duration;
use thiserror::Error;

/// Final outcome of a failed logical fetch, as seen by callers of the
/// resilient fetcher. Retry counts never leak past the fetcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("client error {status}: {message}")]
    ClientError { status: u16, message: String },

    #[error("rate limited by provider")]
    RateLimited,

    #[error("daily request quota exhausted")]
    QuotaExceeded,

    #[error("circuit open for {0} requests")]
    CircuitOpen(&'static str),

    /// The provider broke its response contract. Fatal for the service.
    #[error("provider response schema violation: {0}")]
    SchemaViolation(String),

    #[error("fetch cancelled by shutdown")]
    Cancelled,
}

impl FetchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::SchemaViolation(_))
    }
}

/// Failure of a single attempt against the provider transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    },

    /// The body was not the JSON document the provider promises.
    #[error("malformed response: {0}")]
    Malformed(String),
}
