//! Shared helpers for integration tests

#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use steadfast_resilience::{ErrorClassification, FailureKind, RetryConfig};

/// Operation error with an explicit failure category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError {
    pub kind: FailureKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl TestError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after: None }
    }

    /// A connection failure; retried and counted by breakers.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Connection, message)
    }

    /// A caller mistake; never retried, ignored by breakers.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Client, message)
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        Self { retry_after: Some(retry_after), ..Self::new(FailureKind::RateLimited, "429") }
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for TestError {}

impl ErrorClassification for TestError {
    fn failure_kind(&self) -> FailureKind {
        self.kind
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Deterministic backoff: exact exponential delays, no jitter.
pub fn exact_backoff(max_attempts: u32, base_ms: u64, max_ms: u64) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(base_ms))
        .max_delay(Duration::from_millis(max_ms))
        .multiplier(2.0)
        .no_jitter()
        .build()
        .expect("valid retry config")
}

/// Shared call counter for closures moved into executors.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU32>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new count.
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}
