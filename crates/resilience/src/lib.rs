//! Fault-tolerance primitives for unreliable remote operations.
//!
//! Steadfast wraps calls to flaky dependencies (exchanges, price feeds,
//! webhooks) with composable guards:
//!
//! - [`retry`]: bounded retries with exponential backoff and jitter
//! - [`circuit_breaker`]: fail-fast state machine plus a named registry
//! - [`rate_limiter`]: sliding-window admission
//! - [`bulkhead`]: concurrency compartments
//! - [`cache`]: stale-on-failure cache
//! - [`health`], [`tracer`], [`metrics`], [`alerts`]: operational visibility
//!
//! Every guard works from plain threads and from tokio tasks. Shared state is
//! behind a single `parking_lot` lock per instance, never held across an
//! `.await` or a caller-supplied closure.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//!
//! use steadfast_resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryExecutor};
//!
//! let breaker = CircuitBreaker::new("exchange", CircuitBreakerConfig::default())?;
//! let executor = RetryExecutor::new(RetryConfig::builder().max_attempts(4).build()?)
//!     .named("exchange")
//!     .with_circuit_breaker(breaker);
//!
//! let price = executor.run(|| -> Result<f64, std::io::Error> { Ok(42_000.0) })?;
//! # let _ = (price, Duration::ZERO);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod alerts;
pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod observability;
pub mod rate_limiter;
pub mod retry;
pub mod tracer;

// Re-export commonly used types
// ------------------------
pub use alerts::{Alert, AlertError, AlertHandler, AlertLevel, AlertManager, FileAlertHandler};
#[cfg(feature = "webhook")]
pub use alerts::WebhookAlertHandler;
pub use bulkhead::{Bulkhead, BulkheadMetrics, BulkheadPermit};
pub use cache::{CacheConfig, CacheStats, Cached, Freshness, GracefulCache, TtlPolicy};
pub use circuit_breaker::{
    get_all_circuit_breaker_states, get_circuit_breaker, BreakerListener, BreakerRegistry,
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitEvent, CircuitState,
    TrackedFailures,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::ToolkitConfig;
pub use error::{
    AdmissionError, AttemptError, ConfigError, ConfigResult, ErrorClassification, ErrorSeverity,
    FailureKind, ResilienceError, ResilienceResult,
};
pub use health::{
    CircuitBreakerProbe, FnProbe, HealthCheckResult, HealthChecker, HealthProbe, HealthReport,
    ProbeOutcome,
};
pub use metrics::{Component, InMemoryMetrics, MetricsSink, MetricsStore, OutcomeEvent};
pub use observability::{init_logging, LogFormat};
pub use rate_limiter::RateLimiter;
pub use retry::{
    retry, retry_async, RetryConfig, RetryDecision, RetryExecutor, RetryOnKinds, RetryOutcome,
    RetryPolicy,
};
pub use tracer::{RequestTracer, SpanGuard, SpanOutcome, SpanRecord, TraceHandle};
