//! Error types for the fetch layer.

use std::time::Duration;
use thiserror::Error;

/// Boxed source error carried by transport failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a single GET at the transport level
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection, DNS or timeout failure before a response arrived
    #[error("request failed: {0}")]
    Request(#[source] BoxError),

    /// The response started but its body could not be read
    #[error("failed to read response body: {0}")]
    Body(#[source] BoxError),
}

/// Why a fetch gave up
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch URL {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to read response body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("unexpected status code {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("rate limit exceeded after {attempts} attempts: {url}")]
    RateLimitExceeded { url: String, attempts: u32 },

    #[error("banned after {attempts} attempts: {url}")]
    Banned { url: String, attempts: u32 },

    #[error("fetch cancelled: {url}")]
    Cancelled { url: String },
}

impl FetchError {
    pub(crate) fn from_transport(url: &str, err: TransportError) -> Self {
        match err {
            TransportError::Request(source) => FetchError::Transport {
                url: url.to_string(),
                source,
            },
            TransportError::Body(source) => FetchError::Body {
                url: url.to_string(),
                source,
            },
        }
    }

    /// True when the upstream kept throttling until the attempt budget ran out
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimitExceeded { .. } | FetchError::Banned { .. }
        )
    }
}

/// Invalid rate limiter or retry parameters
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("requests per second must be positive")]
    ZeroRequestsPerSecond,

    #[error("requests per minute must be positive")]
    ZeroRequestsPerMinute,

    #[error("interval between requests must be non-zero")]
    ZeroInterval,

    #[error("burst window must be non-zero")]
    ZeroBurstWindow,

    #[error("interval between requests must not exceed {max:?}")]
    IntervalTooLong { max: Duration },

    #[error("burst window must not exceed {max:?}")]
    BurstWindowTooLong { max: Duration },

    #[error("max retries must be at least 1")]
    ZeroRetries,

    #[error("invalid soft-ban sentinel: {0}")]
    Sentinel(String),
}
