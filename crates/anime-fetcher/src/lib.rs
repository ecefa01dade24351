//! Anime metadata fetcher.
//!
//! Collects raw anime metadata from Jikan, Shikimori, AniDB and the Anime365
//! catalogue through a rate-limited fetch layer that retries throttled
//! requests and recognises soft bans hidden inside regular-looking responses.

pub mod api;
pub mod cache;
pub mod provider;
pub mod scraper;

pub use api::{
    fetch_with_retry, CancelSignal, FetchError, FetchOutcome, Fetcher, HttpTransport, RateLimiter,
    ResponseClassifier, RetryConfig, SoftBanSentinel,
};
pub use cache::ResponseCache;
pub use provider::{build_rate_limiter, Provider};
pub use scraper::{Scraper, ScraperStats};
