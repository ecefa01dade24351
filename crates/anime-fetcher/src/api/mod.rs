//! Rate-limited, retry-enabled fetch layer.
//!
//! Shared by every upstream: a [`RateLimiter`] per upstream, a
//! [`ResponseClassifier`] chosen per upstream, and the provider-agnostic
//! [`fetch_with_retry`] loop tying them together.

pub mod classifier;
pub mod error;
pub mod fetcher;
pub mod rate_limiter;
pub mod transport;

pub use classifier::{FetchOutcome, ResponseClassifier, SoftBanSentinel};
pub use error::{ConfigError, FetchError, TransportError};
pub use fetcher::{fetch_with_retry, CancelSignal, Fetcher, RetryConfig};
pub use rate_limiter::RateLimiter;
pub use transport::{HttpTransport, RawResponse, Transport};
