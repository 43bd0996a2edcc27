//! Sliding-window rate limiting
//!
//! The limiter remembers the instant of every admitted call inside the
//! current window. A call is admitted when fewer than `max_calls` instants
//! are younger than `window`; expired instants are evicted from the front.
//! Unlike a fixed bucket, the window moves with each call, so bursts at a
//! bucket boundary cannot double the effective rate.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{AdmissionError, ConfigError, ConfigResult};

/// Longest single sleep of a blocked [`RateLimiter::acquire`] before the
/// clock is read again.
const MAX_BLOCKING_SLEEP: Duration = Duration::from_millis(50);

/// Sliding-window rate limiter
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use steadfast_resilience::RateLimiter;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = RateLimiter::new(5, Duration::from_secs(1))?;
///
/// if limiter.try_acquire() {
///     println!("Request allowed");
/// }
/// limiter.acquire(Duration::from_millis(200))?;
/// # Ok(())
/// # }
/// ```
pub struct RateLimiter<C: Clock = SystemClock> {
    max_calls: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
    rejected: AtomicU64,
    clock: C,
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .field("in_window", &self.admitted.lock().len())
            .finish()
    }
}

impl RateLimiter<SystemClock> {
    /// Allow at most `max_calls` admissions in any `window`.
    pub fn new(max_calls: usize, window: Duration) -> ConfigResult<Self> {
        Self::with_clock(max_calls, window, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a rate limiter with a custom clock (useful for testing).
    pub fn with_clock(max_calls: usize, window: Duration, clock: C) -> ConfigResult<Self> {
        if max_calls == 0 {
            return Err(ConfigError::invalid("max_calls", "must be greater than 0"));
        }
        if window.is_zero() {
            return Err(ConfigError::invalid("window", "must be greater than zero"));
        }
        Ok(Self {
            max_calls,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(max_calls.min(1024))),
            rejected: AtomicU64::new(0),
            clock,
        })
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one call if the window has room. Never blocks.
    pub fn try_acquire(&self) -> bool {
        match self.admit_or_wait() {
            Ok(()) => true,
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(max_calls = self.max_calls, "rate limit reached");
                false
            }
        }
    }

    /// Block the current thread until admitted or `timeout` elapses.
    ///
    /// Both the window and the deadline are read from the limiter's clock.
    pub fn acquire(&self, timeout: Duration) -> Result<(), AdmissionError> {
        let deadline = self.clock.now() + timeout;
        loop {
            let wait = match self.admit_or_wait() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let remaining = deadline.saturating_duration_since(self.clock.now());
            if remaining.is_zero() {
                return Err(self.exceeded(timeout));
            }
            std::thread::sleep(wait.min(remaining).min(MAX_BLOCKING_SLEEP));
        }
    }

    /// Wait on the current task until admitted or `timeout` elapses.
    ///
    /// The window follows the limiter's clock; the wait itself is measured on
    /// tokio's clock, so paused-time tests control the deadline.
    pub async fn acquire_async(&self, timeout: Duration) -> Result<(), AdmissionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let wait = match self.admit_or_wait() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(self.exceeded(timeout));
            }
            tokio::time::sleep(wait.min(remaining)).await;
        }
    }

    /// Admissions still available in the current window.
    pub fn available(&self) -> usize {
        let mut admitted = self.admitted.lock();
        self.evict(&mut admitted, self.clock.now());
        self.max_calls - admitted.len()
    }

    /// Calls refused by `try_acquire` or a timed-out `acquire`.
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Forget all admissions.
    pub fn reset(&self) {
        self.admitted.lock().clear();
    }

    /// Admit now, or report how long until the oldest admission leaves the
    /// window. A refusal only evicts expired instants.
    fn admit_or_wait(&self) -> Result<(), Duration> {
        let mut admitted = self.admitted.lock();
        let now = self.clock.now();
        self.evict(&mut admitted, now);

        if admitted.len() < self.max_calls {
            admitted.push_back(now);
            return Ok(());
        }
        let oldest = admitted.front().copied().unwrap_or(now);
        let wait = self.window.saturating_sub(now.duration_since(oldest));
        Err(wait.max(Duration::from_millis(1)))
    }

    fn evict(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = admitted.front() {
            if now.duration_since(oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn exceeded(&self, timeout: Duration) -> AdmissionError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            max_calls = self.max_calls,
            window_ms = self.window.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "rate limit acquire timed out"
        );
        AdmissionError::RateLimitExceeded { max_calls: self.max_calls, window: self.window }
    }
}
