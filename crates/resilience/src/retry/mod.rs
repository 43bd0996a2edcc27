//! Bounded retry with exponential backoff and jitter
//!
//! [`RetryExecutor`] re-runs a failing operation up to `max_attempts` times,
//! sleeping between attempts according to a [`BackoffSchedule`]. Whether a
//! failure is worth another attempt is decided by a [`RetryPolicy`].
//!
//! An executor can also compose the other guards in this crate. Each attempt
//! then runs this pipeline:
//!
//! 1. rate limiter and bulkhead admission (rejections propagate immediately)
//! 2. circuit breaker admission (`CircuitOpen` propagates immediately)
//! 3. the operation itself, bounded by `attempt_timeout` in the async variant
//! 4. outcome recorded to the metrics sink and the request trace
//!
//! When every attempt fails the executor raises an alert, if an
//! [`AlertManager`] is attached, and returns `RetryExhausted`.

mod backoff;
pub mod policies;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

pub use backoff::BackoffSchedule;
pub use policies::{AlwaysRetry, NeverRetry, PredicateRetry, RetryOnKinds};

use crate::alerts::{Alert, AlertLevel, AlertManager};
use crate::bulkhead::{Bulkhead, BulkheadPermit};
use crate::circuit_breaker::{BreakerPermit, CircuitBreaker};
use crate::error::{
    ConfigError, ConfigResult, ErrorClassification, ResilienceError, ResilienceResult,
};
use crate::metrics::{Component, MetricsSink, OutcomeEvent};
use crate::rate_limiter::RateLimiter;
use crate::tracer::{RequestTracer, SpanGuard, TraceHandle};

/// Decides whether a failed attempt should be retried
pub trait RetryPolicy<E>: Send + Sync {
    /// `attempt` is the 1-based number of the attempt that just failed.
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the scheduled backoff delay
    Retry,
    /// Retry after this delay instead of the scheduled one, still capped at
    /// `max_delay`
    RetryAfter(Duration),
    /// Propagate the failure
    Stop,
}

/// Retry policy numbers
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction in `0.0..=1.0`; each delay is scaled by `1 ± U(jitter)`
    pub jitter_fraction: f64,
    /// Deadline for a single attempt. Only the async executor can enforce it.
    pub attempt_timeout: Option<Duration>,
    /// Fixes the jitter sequence
    pub seed: Option<u64>,
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.1,
            attempt_timeout: None,
            seed: None,
            retry_on_timeout: true,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "multiplier",
                format!("must be a finite value >= 1.0, got {}", self.multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::invalid(
                "jitter_fraction",
                format!("must be within 0.0..=1.0, got {}", self.jitter_fraction),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "base_delay",
                format!(
                    "({:?}) cannot be greater than max_delay ({:?})",
                    self.base_delay, self.max_delay
                ),
            ));
        }
        if self.attempt_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("attempt_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`RetryConfig`]
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.config.jitter_fraction = fraction;
        self
    }

    pub fn no_jitter(self) -> Self {
        self.jitter_fraction(0.0)
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.attempt_timeout = Some(timeout);
        self
    }

    pub fn seed(self, seed: u64) -> Self {
        self.seed_opt(Some(seed))
    }

    pub fn seed_opt(mut self, seed: Option<u64>) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.config.retry_on_timeout = retry;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Result of a retry run together with what it took to get there.
#[derive(Debug)]
pub struct RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub result: ResilienceResult<T, E>,
    /// Attempts started, including rejected ones
    pub attempts: u32,
    /// Delay slept before each retry, in order
    pub delays: Vec<Duration>,
    pub total_delay: Duration,
    pub trace_id: Option<Uuid>,
}

impl<T, E> RetryOutcome<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn into_result(self) -> ResilienceResult<T, E> {
        self.result
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// Mean delay between attempts.
    pub fn average_delay(&self) -> Duration {
        match u32::try_from(self.delays.len()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(count) => self.total_delay / count,
        }
    }
}

enum Step {
    Propagate,
    Exhausted,
    Wait(Duration),
}

/// Per-run bookkeeping shared by the blocking and async loops.
struct RunState {
    schedule: BackoffSchedule,
    delays: Vec<Duration>,
    trace: Option<TraceHandle>,
    root: Option<SpanGuard>,
}

impl RunState {
    fn finish<T, E>(self, result: ResilienceResult<T, E>, attempts: u32) -> RetryOutcome<T, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(root) = self.root {
            match &result {
                Ok(_) => root.succeed(),
                Err(err) => root.fail(err.to_string()),
            }
        }
        let trace_id = self.trace.map(|trace| {
            let id = trace.trace_id();
            trace.finish();
            id
        });
        let total_delay = self.delays.iter().sum();
        RetryOutcome { result, attempts, delays: self.delays, total_delay, trace_id }
    }
}

/// Retry executor composing the optional admission guards.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use steadfast_resilience::retry::{RetryConfig, RetryExecutor};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RetryConfig::builder()
///     .max_attempts(4)
///     .base_delay(Duration::from_millis(10))
///     .build()?;
/// let executor = RetryExecutor::new(config).named("price-feed");
///
/// let price = executor.run(|| Ok::<_, std::io::Error>(42.0))?;
/// # Ok(())
/// # }
/// ```
pub struct RetryExecutor<P = RetryOnKinds> {
    config: RetryConfig,
    policy: P,
    resource: String,
    breaker: Option<CircuitBreaker>,
    rate_limiter: Option<Arc<RateLimiter>>,
    bulkhead: Option<Bulkhead>,
    admission_timeout: Duration,
    metrics: Option<Arc<dyn MetricsSink>>,
    tracer: Option<RequestTracer>,
    alerts: Option<Arc<AlertManager>>,
}

impl RetryExecutor<RetryOnKinds> {
    /// Executor retrying transient failures under `config`.
    pub fn new(config: RetryConfig) -> Self {
        Self::with_policy(config, RetryOnKinds::default())
    }
}

impl<P> RetryExecutor<P> {
    pub fn with_policy(config: RetryConfig, policy: P) -> Self {
        Self {
            config,
            policy,
            resource: "operation".to_string(),
            breaker: None,
            rate_limiter: None,
            bulkhead: None,
            admission_timeout: Duration::ZERO,
            metrics: None,
            tracer: None,
            alerts: None,
        }
    }

    /// Resource name used in logs, metrics and alerts.
    pub fn named(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// How long each attempt may wait for rate limiter and bulkhead
    /// admission. Zero (the default) fails fast.
    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn with_tracer(mut self, tracer: RequestTracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Run `operation` on the current thread until it succeeds, fails
    /// permanently, or runs out of attempts.
    pub fn run<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: RetryPolicy<E>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        self.run_with_outcome(operation).into_result()
    }

    /// Like [`RetryExecutor::run`], also reporting attempts and delays.
    #[instrument(
        skip(self, operation),
        fields(resource = %self.resource, max_attempts = self.config.max_attempts)
    )]
    pub fn run_with_outcome<F, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: RetryPolicy<E>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        let mut state = self.begin();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let span = state.trace.as_ref().map(|trace| trace.span(format!("attempt {attempt}")));
            let started = Instant::now();
            let result = self.attempt_blocking(&mut operation);
            self.observe(attempt, started.elapsed(), &result, span);

            let err = match result {
                Ok(value) => return state.finish(Ok(value), attempt),
                Err(err) => err,
            };
            match self.plan(&err, attempt, &mut state.schedule) {
                Step::Propagate => return state.finish(Err(err), attempt),
                Step::Exhausted => return state.finish(Err(self.exhausted(attempt, err)), attempt),
                Step::Wait(delay) => {
                    self.log_retry(attempt, delay, &err);
                    std::thread::sleep(delay);
                    state.delays.push(delay);
                }
            }
        }
    }

    /// Run `operation` on the current task, with the same semantics as
    /// [`RetryExecutor::run`] plus per-attempt timeouts.
    pub async fn run_async<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: RetryPolicy<E>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        self.run_async_with_outcome(operation).await.into_result()
    }

    /// Like [`RetryExecutor::run_async`], also reporting attempts and delays.
    ///
    /// Dropping the future releases any bulkhead slot, breaker trial and open
    /// span held by the current attempt.
    #[instrument(
        skip(self, operation),
        fields(resource = %self.resource, max_attempts = self.config.max_attempts)
    )]
    pub async fn run_async_with_outcome<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: RetryPolicy<E>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        let mut state = self.begin();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let span = state.trace.as_ref().map(|trace| trace.span(format!("attempt {attempt}")));
            let started = Instant::now();
            let result = self.attempt_async(&mut operation).await;
            self.observe(attempt, started.elapsed(), &result, span);

            let err = match result {
                Ok(value) => return state.finish(Ok(value), attempt),
                Err(err) => err,
            };
            match self.plan(&err, attempt, &mut state.schedule) {
                Step::Propagate => return state.finish(Err(err), attempt),
                Step::Exhausted => return state.finish(Err(self.exhausted(attempt, err)), attempt),
                Step::Wait(delay) => {
                    self.log_retry(attempt, delay, &err);
                    tokio::time::sleep(delay).await;
                    state.delays.push(delay);
                }
            }
        }
    }

    /// Turn `operation` into a closure with the same call shape that runs
    /// through this executor.
    pub fn wrap<F, T, E>(self, mut operation: F) -> impl FnMut() -> ResilienceResult<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: RetryPolicy<E>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        move || self.run(&mut operation)
    }

    fn begin(&self) -> RunState {
        let trace = self.tracer.as_ref().map(RequestTracer::start_trace);
        let root = trace.as_ref().map(|trace| trace.span(format!("retry {}", self.resource)));
        RunState { schedule: BackoffSchedule::new(&self.config), delays: Vec::new(), trace, root }
    }

    fn admit_breaker<E>(&self) -> ResilienceResult<Option<BreakerPermit>, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &self.breaker {
            None => Ok(None),
            Some(breaker) => breaker
                .try_acquire()
                .map(Some)
                .ok_or_else(|| ResilienceError::CircuitOpen { name: breaker.name().to_string() }),
        }
    }

    fn attempt_blocking<F, T, E>(&self, operation: &mut F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire(self.admission_timeout)?;
        }
        let _slot: Option<BulkheadPermit> = match &self.bulkhead {
            Some(bulkhead) => Some(bulkhead.acquire(self.admission_timeout)?),
            None => None,
        };
        // Taken last so a trial slot is never held while queued for admission.
        let permit = self.admit_breaker()?;

        let result = operation().map_err(ResilienceError::operation);
        settle(permit, &result);
        result
    }

    async fn attempt_async<F, Fut, T, E>(&self, operation: &mut F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + ErrorClassification + Send + Sync + 'static,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire_async(self.admission_timeout).await?;
        }
        let _slot: Option<BulkheadPermit> = match &self.bulkhead {
            Some(bulkhead) => Some(bulkhead.acquire_async(self.admission_timeout).await?),
            None => None,
        };
        let permit = self.admit_breaker()?;

        let result = match self.config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result.map_err(ResilienceError::operation),
                Err(_) => Err(ResilienceError::Timeout { timeout: limit }),
            },
            None => operation().await.map_err(ResilienceError::operation),
        };
        settle(permit, &result);
        result
    }

    fn plan<E>(&self, err: &ResilienceError<E>, attempt: u32, schedule: &mut BackoffSchedule) -> Step
    where
        P: RetryPolicy<E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let decision = match err {
            ResilienceError::Operation { source } => self.policy.should_retry(source, attempt),
            ResilienceError::Timeout { .. } if self.config.retry_on_timeout => RetryDecision::Retry,
            _ => RetryDecision::Stop,
        };
        match decision {
            RetryDecision::Stop => {
                debug!(resource = %self.resource, attempt, error = %err, "failure not retried");
                Step::Propagate
            }
            _ if attempt >= self.config.max_attempts => Step::Exhausted,
            RetryDecision::Retry => Step::Wait(schedule.next_delay(attempt)),
            RetryDecision::RetryAfter(delay) => Step::Wait(delay.min(self.config.max_delay)),
        }
    }

    fn observe<T, E>(
        &self,
        attempt: u32,
        latency: Duration,
        result: &ResilienceResult<T, E>,
        span: Option<SpanGuard>,
    ) where
        E: std::error::Error + Send + Sync + 'static,
    {
        let label = match result {
            Ok(_) => "success",
            Err(err) => err.label(),
        };
        if let Some(span) = span {
            match result {
                Ok(_) => span.succeed(),
                Err(err) => span.fail(err.to_string()),
            }
        }
        if let Some(sink) = &self.metrics {
            sink.record(
                OutcomeEvent::new(Component::Retry, &self.resource, label)
                    .with_latency(latency)
                    .with_attempt(attempt),
            );
        }
    }

    fn log_retry<E>(&self, attempt: u32, delay: Duration, err: &ResilienceError<E>)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        warn!(
            resource = %self.resource,
            attempt,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, retrying"
        );
    }

    fn exhausted<E>(&self, attempts: u32, last: ResilienceError<E>) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        error!(resource = %self.resource, attempts, error = %last, "all retry attempts exhausted");
        if let Some(alerts) = &self.alerts {
            alerts.notify(
                Alert::new(
                    AlertLevel::Warning,
                    format!("{} failed after {attempts} attempts: {last}", self.resource),
                )
                .with_dedup_key(format!("retry_exhausted:{}", self.resource))
                .with_source(self.resource.clone()),
            );
        }
        ResilienceError::RetryExhausted { attempts, last: last.into() }
    }
}

impl<P> fmt::Debug for RetryExecutor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("resource", &self.resource)
            .field("config", &self.config)
            .field("circuit_breaker", &self.breaker.as_ref().map(CircuitBreaker::name))
            .field("rate_limiter", &self.rate_limiter.is_some())
            .field("bulkhead", &self.bulkhead.is_some())
            .finish()
    }
}

fn settle<T, E>(permit: Option<BreakerPermit>, result: &ResilienceResult<T, E>)
where
    E: std::error::Error + ErrorClassification + Send + Sync + 'static,
{
    if let Some(permit) = permit {
        permit.settle(result, ErrorClassification::failure_kind);
    }
}

/// Run `operation` under `config` and `policy` on the current thread.
pub fn retry<F, T, E, P>(config: RetryConfig, policy: P, operation: F) -> ResilienceResult<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: RetryPolicy<E>,
    E: std::error::Error + ErrorClassification + Send + Sync + 'static,
{
    RetryExecutor::with_policy(config, policy).run(operation)
}

/// Run `operation` under `config` and `policy` on the current task.
pub async fn retry_async<F, Fut, T, E, P>(
    config: RetryConfig,
    policy: P,
    operation: F,
) -> ResilienceResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: std::error::Error + ErrorClassification + Send + Sync + 'static,
{
    RetryExecutor::with_policy(config, policy).run_async(operation).await
}
