//! Fetch-with-retry loop.
//!
//! Each attempt waits for rate limiter admission, performs one GET and lets
//! the classifier decide between returning the body, sleeping and retrying,
//! or giving up. Transport failures and unexpected statuses are never retried.

use super::classifier::{FetchOutcome, ResponseClassifier};
use super::error::{ConfigError, FetchError};
use super::rate_limiter::RateLimiter;
use super::transport::{HttpTransport, Transport};
use shared::FetchConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Cancellation signal: flipping the value to `true` aborts in-flight fetches
pub type CancelSignal = watch::Receiver<bool>;

/// Retry budget and backoff of the fetch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per URL, including the first one
    pub max_retries: u32,
    /// Backoff unit
    pub base_delay: Duration,
    /// Fixed factor applied together with the attempt number
    pub delay_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(10),
            delay_multiplier: 2,
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &FetchConfig) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.retry_delay_ms),
            delay_multiplier: settings.retry_multiplier,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        Ok(())
    }

    /// Delay after an ordinary throttle on `attempt` (1-indexed).
    ///
    /// Linear in the attempt number: `base_delay * attempt * delay_multiplier`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.saturating_mul(self.delay_multiplier))
    }
}

/// Fetch `url`, absorbing throttling up to `config.max_retries` attempts.
///
/// Returns the raw body of the first successful response. A `max_retries` of
/// zero is treated as a single attempt.
pub async fn fetch_with_retry<T: Transport + ?Sized>(
    transport: &T,
    url: &str,
    rate_limiter: &RateLimiter,
    classifier: &ResponseClassifier,
    config: &RetryConfig,
    cancel: Option<&CancelSignal>,
) -> Result<Vec<u8>, FetchError> {
    let max_attempts = config.max_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(url = %url, attempt, max_attempts, "Fetching URL");

        until_cancelled(cancel, url, rate_limiter.wait()).await?;

        let response = match until_cancelled(cancel, url, transport.get(url)).await? {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, attempt, error = %e, "Request error");
                return Err(FetchError::from_transport(url, e));
            }
        };

        match classifier.classify(response.status, response.body) {
            FetchOutcome::Success(body) => {
                debug!(url = %url, bytes = body.len(), "Request successful");
                return Ok(body);
            }
            FetchOutcome::PermanentFailure { status } => {
                warn!(url = %url, status, "Request failed");
                return Err(FetchError::UnexpectedStatus {
                    url: url.to_string(),
                    status,
                });
            }
            FetchOutcome::RetryableThrottle(cooldown) => {
                if attempt >= max_attempts {
                    warn!(
                        url = %url,
                        attempts = attempt,
                        soft_ban = cooldown.is_some(),
                        "Throttled on every attempt, giving up"
                    );
                    let url = url.to_string();
                    return Err(match cooldown {
                        Some(_) => FetchError::Banned {
                            url,
                            attempts: attempt,
                        },
                        None => FetchError::RateLimitExceeded {
                            url,
                            attempts: attempt,
                        },
                    });
                }

                let delay = cooldown.unwrap_or_else(|| config.backoff(attempt));
                warn!(
                    url = %url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    soft_ban = cooldown.is_some(),
                    "Throttled by upstream, waiting before retry"
                );
                until_cancelled(cancel, url, sleep(delay)).await?;
            }
        }
    }
}

/// Drive `fut` to completion unless the signal flips first
async fn until_cancelled<F: Future>(
    cancel: Option<&CancelSignal>,
    url: &str,
    fut: F,
) -> Result<F::Output, FetchError> {
    let Some(signal) = cancel else {
        return Ok(fut.await);
    };

    tokio::select! {
        biased;
        _ = cancellation(signal.clone()) => {
            debug!(url = %url, "Fetch cancelled");
            Err(FetchError::Cancelled { url: url.to_string() })
        }
        output = fut => Ok(output),
    }
}

/// Resolves once the signal is `true`; never resolves if the sender is gone
async fn cancellation(mut signal: CancelSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Fetcher bound to one upstream
pub struct Fetcher<T = HttpTransport> {
    transport: T,
    rate_limiter: Arc<RateLimiter>,
    classifier: ResponseClassifier,
    config: RetryConfig,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(
        transport: T,
        rate_limiter: Arc<RateLimiter>,
        classifier: ResponseClassifier,
        config: RetryConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            transport,
            rate_limiter,
            classifier,
            config,
        })
    }

    /// Fetch the raw body of `url`
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        fetch_with_retry(
            &self.transport,
            url,
            &self.rate_limiter,
            &self.classifier,
            &self.config,
            None,
        )
        .await
    }

    /// Like [`Fetcher::fetch`], but gives up as soon as `cancel` turns `true`
    pub async fn fetch_cancellable(
        &self,
        url: &str,
        cancel: &CancelSignal,
    ) -> Result<Vec<u8>, FetchError> {
        fetch_with_retry(
            &self.transport,
            url,
            &self.rate_limiter,
            &self.classifier,
            &self.config,
            Some(cancel),
        )
        .await
    }

    /// The limiter shared with every other fetch against this upstream
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
