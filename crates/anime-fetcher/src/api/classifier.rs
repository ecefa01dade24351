//! Response classification.
//!
//! Turns a status code and body into a [`FetchOutcome`]. This is the only
//! place where upstream-specific knowledge enters the retry loop.

use super::error::ConfigError;
use regex::bytes::Regex;
use std::time::Duration;

/// Default cooldown after a soft-ban response
pub const DEFAULT_SOFT_BAN_COOLDOWN: Duration = Duration::from_secs(300);

/// Result of classifying one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Usable body
    Success(Vec<u8>),
    /// Upstream asked us to slow down. `Some` carries a fixed cooldown from a
    /// soft-ban sentinel; `None` means ordinary backoff applies.
    RetryableThrottle(Option<Duration>),
    /// Not worth retrying
    PermanentFailure { status: u16 },
}

/// Provider-defined marker of a temporary service-level block.
///
/// Matches an `error` element whose `code` attribute and text equal the
/// configured values, e.g. `<error code="500">banned</error>`.
#[derive(Debug, Clone)]
pub struct SoftBanSentinel {
    pattern: Regex,
    cooldown: Duration,
}

impl SoftBanSentinel {
    pub fn new(code: &str, message: &str, cooldown: Duration) -> Result<Self, ConfigError> {
        let pattern = format!(
            r#"<error\b[^>]*\bcode\s*=\s*["']{}["'][^>]*>\s*{}\s*</error>"#,
            regex::escape(code),
            regex::escape(message)
        );
        let pattern = Regex::new(&pattern).map_err(|e| ConfigError::Sentinel(e.to_string()))?;
        Ok(Self { pattern, cooldown })
    }

    /// AniDB answers a banned client with `<error code="500">banned</error>`
    pub fn anidb(cooldown: Duration) -> Result<Self, ConfigError> {
        Self::new("500", "banned", cooldown)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn matches(&self, body: &[u8]) -> bool {
        self.pattern.is_match(body)
    }
}

/// Classifier selected per upstream at construction time
#[derive(Debug, Clone, Default)]
pub enum ResponseClassifier {
    /// Decide on the status code alone
    #[default]
    StatusOnly,
    /// Look for a soft-ban sentinel in the body before checking the status
    PayloadInspecting(SoftBanSentinel),
}

impl ResponseClassifier {
    pub fn classify(&self, status: u16, body: Vec<u8>) -> FetchOutcome {
        if let ResponseClassifier::PayloadInspecting(sentinel) = self {
            // The sentinel wins regardless of status
            if sentinel.matches(&body) {
                return FetchOutcome::RetryableThrottle(Some(sentinel.cooldown()));
            }
        }

        match status {
            200 => FetchOutcome::Success(body),
            429 => FetchOutcome::RetryableThrottle(None),
            status => FetchOutcome::PermanentFailure { status },
        }
    }
}
