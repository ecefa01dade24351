//! Rate limiter enforcing a steady cadence plus a burst ceiling.
//!
//! Every admission is spaced at least one period after the previous one, and
//! the number of admissions inside a burst window never exceeds the ceiling.
//! One limiter is created per upstream and shared by all tasks talking to it.

use super::error::ConfigError;
use shared::BurstWindowMode;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Default burst window (the per-minute ceiling)
pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_secs(60);

/// Longest accepted spacing or burst window
pub const MAX_SPAN: Duration = Duration::from_secs(24 * 60 * 60);

/// Rate limiter with dual constraints (cadence and burst ceiling)
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum spacing between two admissions
    period: Duration,
    /// Length of the burst window
    burst_window: Duration,
    /// Maximum admissions per burst window
    burst_ceiling: usize,
    /// How the burst history is emptied
    mode: BurstWindowMode,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    /// Anchor for fixed window boundaries
    origin: Instant,
    /// Start of the current fixed window
    window_start: Instant,
    /// Earliest instant the cadence gate admits the next caller
    next_slot: Option<Instant>,
    /// Admission instants in the current window, oldest first
    history: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter admitting at most `requests_per_second` per second and
    /// `requests_per_minute` per minute.
    pub fn new(requests_per_second: u32, requests_per_minute: u32) -> Result<Self, ConfigError> {
        if requests_per_second == 0 {
            return Err(ConfigError::ZeroRequestsPerSecond);
        }
        Self::with_period(
            Duration::from_secs(1) / requests_per_second,
            requests_per_minute,
        )
    }

    /// Create a limiter with an explicit spacing between admissions.
    ///
    /// Used for upstreams slower than one request per second.
    pub fn with_period(period: Duration, requests_per_minute: u32) -> Result<Self, ConfigError> {
        if period.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if period > MAX_SPAN {
            return Err(ConfigError::IntervalTooLong { max: MAX_SPAN });
        }
        if requests_per_minute == 0 {
            return Err(ConfigError::ZeroRequestsPerMinute);
        }

        let now = Instant::now();
        Ok(Self {
            period,
            burst_window: DEFAULT_BURST_WINDOW,
            burst_ceiling: requests_per_minute as usize,
            mode: BurstWindowMode::FixedFlush,
            state: Mutex::new(LimiterState {
                origin: now,
                window_start: now,
                next_slot: None,
                history: VecDeque::with_capacity(requests_per_minute as usize),
            }),
        })
    }

    /// Replace the burst window length and flush behaviour
    pub fn with_burst_window(
        mut self,
        window: Duration,
        mode: BurstWindowMode,
    ) -> Result<Self, ConfigError> {
        if window.is_zero() {
            return Err(ConfigError::ZeroBurstWindow);
        }
        if window > MAX_SPAN {
            return Err(ConfigError::BurstWindowTooLong { max: MAX_SPAN });
        }
        self.burst_window = window;
        self.mode = mode;
        Ok(self)
    }

    /// Spacing enforced between admissions
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait until a request can be made, respecting both limits.
    ///
    /// Never fails; the caller is only delayed. The slot is reserved before
    /// sleeping, so concurrent callers each get their own admission instant.
    /// Dropping the future before admission hands the slot back.
    pub async fn wait(&self) {
        let now = Instant::now();
        let reservation = self.lock().reserve(now, self);
        let admit_at = reservation.at;

        if admit_at > now {
            let guard = PendingAdmission {
                limiter: self,
                reservation,
                admitted: false,
            };
            tracing::debug!(
                wait_ms = (admit_at - now).as_millis() as u64,
                "Rate limit: waiting for admission"
            );
            sleep_until(admit_at).await;
            guard.admit();
        }
    }

    /// Get the number of admissions recorded in the current burst window
    pub fn current_window_count(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        match self.mode {
            BurstWindowMode::FixedFlush => state.roll_window(now, self.burst_window),
            BurstWindowMode::Sliding => state.expire(now, self.burst_window),
        }
        state.history.len()
    }

    /// Maximum admissions per burst window
    pub fn burst_ceiling(&self) -> usize {
        self.burst_ceiling
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        // The guarded state is updated in one step, so a poisoned lock still
        // holds consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Slot handed out by [`LimiterState::reserve`]
#[derive(Debug, Clone, Copy)]
struct Reservation {
    at: Instant,
    /// Cadence gate before this reservation advanced it
    previous_slot: Option<Instant>,
}

/// Returns the reserved slot to the limiter if the waiter is dropped early
struct PendingAdmission<'a> {
    limiter: &'a RateLimiter,
    reservation: Reservation,
    admitted: bool,
}

impl PendingAdmission<'_> {
    fn admit(mut self) {
        self.admitted = true;
    }
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            tracing::debug!("Rate limit: waiter dropped, releasing reserved slot");
            self.limiter
                .lock()
                .release(self.reservation, self.limiter.period);
        }
    }
}

impl LimiterState {
    /// Pick the admission instant for a caller arriving at `now` and record it
    fn reserve(&mut self, now: Instant, limits: &RateLimiter) -> Reservation {
        let previous_slot = self.next_slot;
        let mut at = match self.next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };

        match limits.mode {
            BurstWindowMode::FixedFlush => {
                self.roll_window(at, limits.burst_window);
                if self.history.len() >= limits.burst_ceiling {
                    at = self.window_start + limits.burst_window;
                    tracing::debug!(
                        ceiling = limits.burst_ceiling,
                        "Rate limit: burst ceiling reached, waiting for window flush"
                    );
                    self.roll_window(at, limits.burst_window);
                }
            }
            BurstWindowMode::Sliding => {
                self.expire(at, limits.burst_window);
                if self.history.len() >= limits.burst_ceiling {
                    // Oldest entry that has to leave the window before `at`
                    let blocking = self.history[self.history.len() - limits.burst_ceiling];
                    at = blocking + limits.burst_window;
                    tracing::debug!(
                        ceiling = limits.burst_ceiling,
                        "Rate limit: burst ceiling reached, waiting for oldest admission to expire"
                    );
                    self.expire(at, limits.burst_window);
                }
            }
        }

        self.history.push_back(at);
        self.next_slot = Some(at + limits.period);
        Reservation { at, previous_slot }
    }

    /// Undo a reservation that was never used.
    ///
    /// The cadence gate is only rewound when no later caller reserved after it.
    fn release(&mut self, reservation: Reservation, period: Duration) {
        if let Some(index) = self.history.iter().rposition(|&t| t == reservation.at) {
            self.history.remove(index);
        }
        if self.next_slot == Some(reservation.at + period) {
            self.next_slot = reservation.previous_slot;
        }
    }

    /// Drop the whole history once `at` lies past the current fixed window
    fn roll_window(&mut self, at: Instant, window: Duration) {
        if at < self.window_start + window {
            return;
        }
        let windows = at.duration_since(self.origin).as_nanos() / window.as_nanos();
        let offset = window.as_nanos() * windows;
        self.window_start =
            self.origin + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX));
        self.history.clear();
    }

    /// Drop admissions recorded at least one window before `at`
    fn expire(&mut self, at: Instant, window: Duration) {
        while let Some(&oldest) = self.history.front() {
            if at.saturating_duration_since(oldest) >= window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}
