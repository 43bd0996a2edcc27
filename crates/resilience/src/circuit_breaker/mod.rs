//! Per-resource circuit breaker
//!
//! A breaker stops invoking a failing dependency once `failure_threshold`
//! consecutive tracked failures have been seen, then lets a single trial call
//! through after `recovery_timeout` to probe for recovery.
//!
//! ```text
//!            threshold reached                recovery_timeout elapsed
//!   CLOSED ───────────────────▶ OPEN ─────────────────────────────▶ HALF_OPEN
//!     ▲                          ▲                                     │
//!     │                          └───────── trial failed ──────────────┤
//!     └──────────────── success_threshold trials succeeded ────────────┘
//! ```
//!
//! All state lives behind one mutex per breaker. The mutex is released while
//! the protected operation runs; admission hands out a [`BreakerPermit`] and
//! the outcome is recorded through it afterwards. A trial permit dropped
//! without an outcome (cancellation, panic) gives the trial slot back.

mod registry;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

pub use registry::{
    get_all_circuit_breaker_states, get_circuit_breaker, global, BreakerRegistry, BreakerSnapshot,
};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ErrorClassification, FailureKind, ResilienceError, ResilienceResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fast-fail without reaching the dependency
    Open,
    /// One trial call at a time is let through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Which failure kinds count against the breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedFailures {
    All,
    Kinds(HashSet<FailureKind>),
}

impl TrackedFailures {
    pub fn kinds(kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        Self::Kinds(kinds.into_iter().collect())
    }

    pub fn tracks(&self, kind: FailureKind) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

impl Default for TrackedFailures {
    /// Everything except caller mistakes and local rejections.
    fn default() -> Self {
        Self::kinds([
            FailureKind::Timeout,
            FailureKind::Connection,
            FailureKind::RateLimited,
            FailureKind::Server,
            FailureKind::Other,
        ])
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive tracked failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive successful trials that close it again
    pub success_threshold: u32,
    /// Time spent open before a trial is allowed
    pub recovery_timeout: Duration,
    pub tracked_failures: TrackedFailures,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            tracked_failures: TrackedFailures::default(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be greater than 0"));
        }
        if let TrackedFailures::Kinds(kinds) = &self.tracked_failures {
            if kinds.is_empty() {
                return Err(ConfigError::invalid("tracked_failures", "must name at least one kind"));
            }
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn tracked_failures(mut self, tracked: TrackedFailures) -> Self {
        self.config.tracked_failures = tracked;
        self
    }

    pub fn track_all_failures(self) -> Self {
        self.tracked_failures(TrackedFailures::All)
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

pub(crate) fn same_listener(a: &Arc<dyn BreakerListener>, b: &Arc<dyn BreakerListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// A state transition, delivered to every [`BreakerListener`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitEvent {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Consecutive tracked failures at the moment of the transition
    pub failure_count: u32,
    pub at: DateTime<Utc>,
}

/// Observer of breaker state transitions.
///
/// Called after the breaker lock has been released.
pub trait BreakerListener: Send + Sync {
    fn on_transition(&self, event: &CircuitEvent);
}

impl<F> BreakerListener for F
where
    F: Fn(&CircuitEvent) + Send + Sync,
{
    fn on_transition(&self, event: &CircuitEvent) {
        self(event)
    }
}

/// Counters and timestamps for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub opened_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
    pub state_changed_at: Instant,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trial_in_flight: bool,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    last_failure_at: Option<Instant>,
    state_changed_at: Instant,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerCore {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            trial_in_flight: false,
            opened_at: None,
            opened_at_utc: None,
            last_failure_at: None,
            state_changed_at: now,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }
}

struct BreakerInner<C: Clock> {
    name: String,
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
    listeners: RwLock<Vec<Arc<dyn BreakerListener>>>,
    clock: C,
}

/// Circuit breaker guarding one named resource.
///
/// Cloning yields another handle to the same breaker.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    inner: Arc<BreakerInner<C>>,
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &core.state)
            .field("consecutive_failures", &core.consecutive_failures)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker on a custom clock (useful for testing).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(name, config, clock))
    }

    pub(crate) fn from_validated(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> Self {
        let now = clock.now();
        Self {
            inner: Arc::new(BreakerInner {
                name: name.into(),
                config,
                core: Mutex::new(BreakerCore::new(now)),
                listeners: RwLock::new(Vec::new()),
                clock,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Current state without evaluating the recovery timeout.
    pub fn state(&self) -> CircuitState {
        self.inner.core.lock().state
    }

    /// Register an observer for state transitions.
    /// Attach a transition listener. Attaching the same `Arc` again is a
    /// no-op.
    pub fn add_listener(&self, listener: Arc<dyn BreakerListener>) {
        let mut listeners = self.inner.listeners.write();
        if !listeners.iter().any(|existing| same_listener(existing, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let core = self.inner.core.lock();
        CircuitBreakerMetrics {
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            total_calls: core.total_calls,
            total_successes: core.total_successes,
            total_failures: core.total_failures,
            rejected_calls: core.rejected_calls,
            opened_at: core.opened_at,
            last_failure_at: core.last_failure_at,
            state_changed_at: core.state_changed_at,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = self.inner.core.lock();
        BreakerSnapshot {
            state: core.state,
            failure_count: core.consecutive_failures,
            opened_at: core.opened_at_utc,
        }
    }

    /// Ask for admission.
    ///
    /// Returns `None` when the call must fast-fail. Evaluates OPEN →
    /// HALF_OPEN lazily; exactly one caller receives the trial permit.
    pub fn try_acquire(&self) -> Option<BreakerPermit<C>> {
        let (admitted, event) = {
            let mut core = self.inner.core.lock();
            let now = self.inner.clock.now();
            let mut event = None;

            let admitted = match core.state {
                CircuitState::Closed => Some(false),
                CircuitState::Open => {
                    let elapsed =
                        core.opened_at.map_or(Duration::MAX, |opened| now.duration_since(opened));
                    if elapsed >= self.inner.config.recovery_timeout {
                        event = self.transition(&mut core, CircuitState::HalfOpen, now);
                        core.trial_in_flight = true;
                        Some(true)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if !core.trial_in_flight => {
                    core.trial_in_flight = true;
                    Some(true)
                }
                CircuitState::HalfOpen => None,
            };

            match admitted {
                Some(_) => core.total_calls += 1,
                None => core.rejected_calls += 1,
            }
            (admitted, event)
        };

        self.emit(event);
        match admitted {
            Some(trial) => {
                if trial {
                    debug!(breaker = %self.inner.name, "trial call admitted");
                }
                Some(BreakerPermit { breaker: self.clone(), trial, settled: false })
            }
            None => {
                debug!(breaker = %self.inner.name, "call rejected, circuit open");
                None
            }
        }
    }

    /// Run `operation` through the breaker, classifying failures with
    /// [`ErrorClassification`].
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        self.call_classified(operation, E::failure_kind)
    }

    /// Run `operation` through the breaker with a caller-supplied classifier.
    #[instrument(skip(self, operation, classify), fields(breaker = %self.inner.name))]
    pub fn call_classified<F, K, T, E>(&self, operation: F, classify: K) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        K: Fn(&E) -> FailureKind,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.admit()?;
        let result = operation();
        permit.settle(&result, classify);
        result.map_err(ResilienceError::operation)
    }

    /// Async form of [`CircuitBreaker::call`].
    pub async fn call_async<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        self.call_async_classified(operation, E::failure_kind).await
    }

    /// Async form of [`CircuitBreaker::call_classified`].
    ///
    /// Dropping the returned future mid-call releases a held trial slot.
    #[instrument(skip(self, operation, classify), fields(breaker = %self.inner.name))]
    pub async fn call_async_classified<F, Fut, K, T, E>(
        &self,
        operation: F,
        classify: K,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        K: Fn(&E) -> FailureKind,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.admit()?;
        let result = operation().await;
        permit.settle(&result, classify);
        result.map_err(ResilienceError::operation)
    }

    /// Force the breaker back to CLOSED and clear its counters.
    pub fn reset(&self) {
        let event = {
            let mut core = self.inner.core.lock();
            let now = self.inner.clock.now();
            let event = self.transition(&mut core, CircuitState::Closed, now);
            core.consecutive_failures = 0;
            core.consecutive_successes = 0;
            core.trial_in_flight = false;
            event
        };
        info!(breaker = %self.inner.name, "circuit breaker manually reset");
        self.emit(event);
    }

    fn admit<E>(&self) -> ResilienceResult<BreakerPermit<C>, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.try_acquire().ok_or_else(|| ResilienceError::CircuitOpen { name: self.inner.name.clone() })
    }

    /// Move to `to`, returning the event to emit once the lock is dropped.
    fn transition(
        &self,
        core: &mut BreakerCore,
        to: CircuitState,
        now: Instant,
    ) -> Option<CircuitEvent> {
        let from = core.state;
        if from == to {
            return None;
        }
        core.state = to;
        core.state_changed_at = now;
        match to {
            CircuitState::Open => {
                core.opened_at = Some(now);
                core.opened_at_utc = Some(self.inner.clock.utc_now());
            }
            CircuitState::Closed => {
                core.opened_at = None;
                core.opened_at_utc = None;
            }
            CircuitState::HalfOpen => core.consecutive_successes = 0,
        }
        Some(CircuitEvent {
            name: self.inner.name.clone(),
            from,
            to,
            failure_count: core.consecutive_failures,
            at: self.inner.clock.utc_now(),
        })
    }

    fn on_success(&self, trial: bool) {
        let event = {
            let mut core = self.inner.core.lock();
            core.total_successes += 1;
            match core.state {
                CircuitState::Closed if !trial => {
                    core.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if trial => {
                    core.trial_in_flight = false;
                    core.consecutive_successes += 1;
                    if core.consecutive_successes >= self.inner.config.success_threshold {
                        let now = self.inner.clock.now();
                        let event = self.transition(&mut core, CircuitState::Closed, now);
                        core.consecutive_failures = 0;
                        core.consecutive_successes = 0;
                        event
                    } else {
                        None
                    }
                }
                // Late results from permits issued under an earlier state.
                _ => None,
            }
        };
        if let Some(event) = &event {
            info!(breaker = %self.inner.name, from = %event.from, "circuit breaker closed");
        }
        self.emit(event);
    }

    fn on_failure(&self, trial: bool, kind: FailureKind) {
        if !self.inner.config.tracked_failures.tracks(kind) {
            if trial {
                self.release_trial();
            }
            debug!(breaker = %self.inner.name, kind = %kind, "untracked failure ignored");
            return;
        }

        let event = {
            let mut core = self.inner.core.lock();
            let now = self.inner.clock.now();
            core.total_failures += 1;
            core.last_failure_at = Some(now);
            match core.state {
                CircuitState::Closed if !trial => {
                    core.consecutive_failures += 1;
                    if core.consecutive_failures >= self.inner.config.failure_threshold {
                        self.transition(&mut core, CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if trial => {
                    core.trial_in_flight = false;
                    self.transition(&mut core, CircuitState::Open, now)
                }
                _ => None,
            }
        };
        if let Some(event) = &event {
            warn!(
                breaker = %self.inner.name,
                from = %event.from,
                failures = event.failure_count,
                kind = %kind,
                "circuit breaker opened"
            );
        }
        self.emit(event);
    }

    fn release_trial(&self) {
        self.inner.core.lock().trial_in_flight = false;
    }

    fn emit(&self, event: Option<CircuitEvent>) {
        let Some(event) = event else { return };
        let listeners: Vec<Arc<dyn BreakerListener>> = self.inner.listeners.read().clone();
        for listener in listeners {
            listener.on_transition(&event);
        }
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// Record the outcome with [`BreakerPermit::record_success`] or
/// [`BreakerPermit::record_failure`]. Dropping it unrecorded releases a
/// trial slot without changing state.
#[must_use = "record the outcome of the admitted call"]
pub struct BreakerPermit<C: Clock = SystemClock> {
    breaker: CircuitBreaker<C>,
    trial: bool,
    settled: bool,
}

impl<C: Clock> BreakerPermit<C> {
    /// Whether this permit holds the half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(mut self, kind: FailureKind) {
        self.settled = true;
        self.breaker.on_failure(self.trial, kind);
    }

    pub(crate) fn settle<T, E, K>(self, result: &Result<T, E>, classify: K)
    where
        K: Fn(&E) -> FailureKind,
    {
        match result {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(classify(err)),
        }
    }
}

impl<C: Clock> Drop for BreakerPermit<C> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            debug!(breaker = %self.breaker.name(), "trial permit dropped without outcome");
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::clock::MockClock;

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "refused")
    }

    fn breaker(threshold: u32, successes: u32, clock: &MockClock) -> CircuitBreaker<MockClock> {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .success_threshold(successes)
            .recovery_timeout(Duration::from_secs(30))
            .build()
            .expect("valid config");
        CircuitBreaker::with_clock("exchange", config, clock.clone()).expect("valid breaker")
    }

    fn fail(cb: &CircuitBreaker<MockClock>) -> ResilienceResult<(), io::Error> {
        cb.call(|| Err::<(), _>(refused()))
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder()
            .tracked_failures(TrackedFailures::Kinds(HashSet::new()))
            .build()
            .is_err());
    }

    /// Opens after exactly `failure_threshold` consecutive tracked failures.
    #[test]
    fn test_opens_at_threshold() {
        let clock = MockClock::new();
        let cb = breaker(3, 1, &clock);

        assert!(fail(&cb).is_err());
        assert!(fail(&cb).is_err());
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(fail(&cb).is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let clock = MockClock::new();
        let cb = breaker(3, 1, &clock);

        let _ = fail(&cb);
        let _ = fail(&cb);
        assert!(cb.call(|| Ok::<_, io::Error>(1)).is_ok());
        let _ = fail(&cb);
        let _ = fail(&cb);

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 2);
    }

    /// While open, the operation is never invoked, however many calls arrive.
    #[test]
    fn test_open_fast_fails_without_invoking() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let _ = fail(&cb);

        let invoked = AtomicU32::new(0);
        for _ in 0..100 {
            let result = cb.call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            });
            assert!(matches!(result, Err(ResilienceError::CircuitOpen { ref name }) if name == "exchange"));
        }
        clock.advance_secs(29);
        assert!(fail(&cb).unwrap_err().is_circuit_open());

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().rejected_calls, 101);
    }

    #[test]
    fn test_trial_success_closes_with_threshold_one() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let _ = fail(&cb);

        clock.advance_secs(30);
        assert_eq!(cb.call(|| Ok::<_, io::Error>("up")).unwrap(), "up");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trial_failure_reopens_and_resets_timer() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let _ = fail(&cb);
        let first_open = cb.metrics().opened_at;

        clock.advance_secs(30);
        let _ = fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.metrics().opened_at > first_open);

        clock.advance_secs(10);
        assert!(cb.try_acquire().is_none());
    }

    /// With `success_threshold = 2`, trials are granted one at a time and two
    /// must succeed before closing.
    #[test]
    fn test_success_threshold_requires_consecutive_trials() {
        let clock = MockClock::new();
        let cb = breaker(1, 2, &clock);
        let _ = fail(&cb);
        clock.advance_secs(30);

        let trial = cb.try_acquire().expect("trial granted");
        assert!(trial.is_trial());
        assert!(cb.try_acquire().is_none(), "second caller rejected while trial in flight");
        trial.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial = cb.try_acquire().expect("next trial granted");
        trial.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_trial_permit_releases_slot() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let _ = fail(&cb);
        clock.advance_secs(30);

        let trial = cb.try_acquire().expect("trial granted");
        drop(trial);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_some());
    }

    #[test]
    fn test_untracked_failures_do_not_affect_state() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);

        for _ in 0..5 {
            let result =
                cb.call(|| Err::<(), _>(io::Error::new(io::ErrorKind::InvalidInput, "bad request")));
            assert!(matches!(result, Err(ResilienceError::Operation { .. })));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().total_failures, 0);
    }

    #[test]
    fn test_custom_classifier() {
        let clock = MockClock::new();
        let cb = breaker(2, 1, &clock);
        let classify = |msg: &io::Error| {
            if msg.to_string().contains("503") { FailureKind::Server } else { FailureKind::Client }
        };

        let _ = cb.call_classified(|| Err::<(), _>(io::Error::other("HTTP 400")), classify);
        let _ = cb.call_classified(|| Err::<(), _>(io::Error::other("HTTP 400")), classify);
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = cb.call_classified(|| Err::<(), _>(io::Error::other("HTTP 503")), classify);
        let _ = cb.call_classified(|| Err::<(), _>(io::Error::other("HTTP 503")), classify);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_listeners_receive_transitions() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cb.add_listener(Arc::new(move |event: &CircuitEvent| sink.lock().push((event.from, event.to))));

        let _ = fail(&cb);
        clock.advance_secs(30);
        let _ = cb.call(|| Ok::<_, io::Error>(()));

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_same_listener_attached_once() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let listener: Arc<dyn BreakerListener> = Arc::new(move |_: &CircuitEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cb.add_listener(Arc::clone(&listener));
        cb.add_listener(listener);

        let _ = fail(&cb);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_successes_never_change_closed_state() {
        let clock = MockClock::new();
        let cb = breaker(3, 1, &clock);
        for _ in 0..50 {
            assert!(cb.call(|| Ok::<_, io::Error>(())).is_ok());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().total_successes, 50);
    }

    #[test]
    fn test_reset_closes_open_breaker() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let _ = fail(&cb);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.snapshot().opened_at.is_none());
    }

    /// Many threads race for the trial slot after recovery; exactly one wins.
    #[test]
    fn test_single_trial_under_thread_contention() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let _ = fail(&cb);
        clock.advance_secs(30);

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cb = cb.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cb.try_acquire().map(|permit| {
                        // Hold the slot until every contender has tried.
                        thread::sleep(Duration::from_millis(50));
                        permit.record_success();
                    })
                })
            })
            .collect();

        let granted = handles.into_iter().filter_map(|h| h.join().ok().flatten()).count();
        assert_eq!(granted, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_async_call_cancellation_releases_trial() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let _ = fail(&cb);
        clock.advance_secs(30);

        let pending = cb.call_async(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, io::Error>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let result = cb.call_async(|| async { Ok::<_, io::Error>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
