//! Error taxonomy and failure classification
//!
//! Callers of the toolkit always receive either their value or one of the
//! typed failures in [`ResilienceError`]. Construction-time problems are
//! reported separately as [`ConfigError`] and never surface from a call.
//!
//! # Classification
//!
//! Retry policies and circuit breakers decide what to do with an error by
//! asking it for its [`FailureKind`] through [`ErrorClassification`]:
//!
//! | Kind | Transient | Typical source |
//! |------|-----------|----------------|
//! | `Timeout` | yes | deadline exceeded, attempt timeout |
//! | `Connection` | yes | refused/reset sockets, DNS |
//! | `RateLimited` | yes | HTTP 429, exchange throttling |
//! | `Server` | yes | HTTP 5xx |
//! | `Client` | no | HTTP 4xx, bad input |
//! | `Rejected` | no | fast-fail from a local guard |
//! | `Other` | no | anything unclassified |
//!
//! Implement the trait for your own error types, or hand a closure to
//! `CircuitBreaker::call_classified` / `PredicateRetry` when the error type
//! is foreign.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid policy or configuration values, raised at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {message}")]
    Invalid { field: &'static str, message: String },

    #[error("failed to read configuration from {path}: {message}")]
    Load { path: String, message: String },

    #[error("invalid {format} configuration: {message}")]
    Parse { format: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Result of a validating constructor or builder.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Severity used for logging and alert levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Coarse category of a failure, used to decide retry and breaker behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    RateLimited,
    Server,
    Client,
    Rejected,
    Other,
}

impl FailureKind {
    /// Kinds retried by the default policy.
    pub const TRANSIENT: [FailureKind; 4] =
        [FailureKind::Timeout, FailureKind::Connection, FailureKind::RateLimited, FailureKind::Server];

    /// Whether a failure of this kind is worth retrying.
    pub fn is_transient(self) -> bool {
        Self::TRANSIENT.contains(&self)
    }

    /// Stable lowercase label for logs and persisted records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Client => "client",
            Self::Rejected => "rejected",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error for retry and circuit-breaker decisions.
pub trait ErrorClassification {
    /// The failure category of this error.
    fn failure_kind(&self) -> FailureKind;

    /// Whether the operation may be retried.
    fn is_retryable(&self) -> bool {
        self.failure_kind().is_transient()
    }

    /// How loudly this failure should be reported.
    fn severity(&self) -> ErrorSeverity {
        match self.failure_kind() {
            FailureKind::RateLimited | FailureKind::Rejected => ErrorSeverity::Warning,
            FailureKind::Timeout | FailureKind::Connection => ErrorSeverity::Warning,
            FailureKind::Server | FailureKind::Client | FailureKind::Other => ErrorSeverity::Error,
        }
    }

    /// Server-suggested delay before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl ErrorClassification for io::Error {
    fn failure_kind(&self) -> FailureKind {
        match self.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted => FailureKind::Connection,
            io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied => FailureKind::Client,
            _ => FailureKind::Other,
        }
    }
}

/// Typed failures returned by the toolkit's wrappers.
///
/// `E` is the caller's operation error; it is preserved untouched inside
/// [`ResilienceError::Operation`].
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Every permitted attempt failed; `last` is the final attempt's failure.
    #[error("all {attempts} attempts failed: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: AttemptError<E>,
    },

    /// The breaker is open, or half-open with its trial slot taken.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Admission was not granted before the acquire timeout.
    #[error("rate limit exceeded: {max_calls} calls per {window:?}")]
    RateLimitExceeded { max_calls: usize, window: Duration },

    /// No bulkhead slot became free before the acquire timeout.
    #[error("bulkhead full: {capacity} concurrent operations")]
    BulkheadFull { capacity: usize },

    /// A single attempt exceeded its deadline.
    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The wrapped operation failed.
    #[error("operation failed: {source}")]
    Operation {
        #[source]
        source: E,
    },
}

/// Failure of one attempt inside a retry run.
#[derive(Debug, Error)]
pub enum AttemptError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("rate limit exceeded: {max_calls} calls per {window:?}")]
    RateLimitExceeded { max_calls: usize, window: Duration },

    #[error("bulkhead full: {capacity} concurrent operations")]
    BulkheadFull { capacity: usize },

    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("operation failed: {source}")]
    Operation {
        #[source]
        source: E,
    },
}

impl<E> AttemptError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation { source } => Some(source),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::BulkheadFull { .. } => "bulkhead_full",
            Self::Timeout { .. } => "timeout",
            Self::Operation { .. } => "failure",
        }
    }
}

impl<E> ErrorClassification for AttemptError<E>
where
    E: std::error::Error + ErrorClassification + Send + Sync + 'static,
{
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::CircuitOpen { .. } | Self::BulkheadFull { .. } => FailureKind::Rejected,
            Self::RateLimitExceeded { .. } => FailureKind::RateLimited,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Operation { source } => source.failure_kind(),
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::Operation { source } => source.is_retryable(),
            other => other.failure_kind().is_transient(),
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Operation { source } => source.severity(),
            _ => ErrorSeverity::Warning,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.operation_error().and_then(ErrorClassification::retry_after)
    }
}

impl<E> From<ResilienceError<E>> for AttemptError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: ResilienceError<E>) -> Self {
        match err {
            ResilienceError::RetryExhausted { last, .. } => last,
            ResilienceError::CircuitOpen { name } => Self::CircuitOpen { name },
            ResilienceError::RateLimitExceeded { max_calls, window } => {
                Self::RateLimitExceeded { max_calls, window }
            }
            ResilienceError::BulkheadFull { capacity } => Self::BulkheadFull { capacity },
            ResilienceError::Timeout { timeout } => Self::Timeout { timeout },
            ResilienceError::Operation { source } => Self::Operation { source },
        }
    }
}

/// Admission refused by a local guard, before any operation ran.
///
/// Returned by the standalone `acquire` calls; converts into the matching
/// [`ResilienceError`] variant so guards compose with `?`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("rate limit exceeded: {max_calls} calls per {window:?}")]
    RateLimitExceeded { max_calls: usize, window: Duration },

    #[error("bulkhead full: {capacity} concurrent operations")]
    BulkheadFull { capacity: usize },
}

impl<E> From<AdmissionError> for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::RateLimitExceeded { max_calls, window } => {
                Self::RateLimitExceeded { max_calls, window }
            }
            AdmissionError::BulkheadFull { capacity } => Self::BulkheadFull { capacity },
        }
    }
}

/// Result alias used by every wrapper in the crate.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Wrap an operation failure.
    pub fn operation(source: E) -> Self {
        Self::Operation { source }
    }

    /// The final attempt's failure, when this is `RetryExhausted`.
    pub fn last_attempt(&self) -> Option<&AttemptError<E>> {
        match self {
            Self::RetryExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// The caller's error, if the last failure came from the operation itself.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::RetryExhausted { last, .. } => last.operation_error(),
            Self::Operation { source } => Some(source),
            _ => None,
        }
    }

    /// Consume and return the caller's error, if any.
    pub fn into_operation_error(self) -> Option<E> {
        match AttemptError::from(self) {
            AttemptError::Operation { source } => Some(source),
            _ => None,
        }
    }

    /// Number of attempts consumed, when this is `RetryExhausted`.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RetryExhausted { last: AttemptError::CircuitOpen { .. }, .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::RetryExhausted { last: AttemptError::Timeout { .. }, .. }
        )
    }

    /// Failures produced by local admission guards rather than the operation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RateLimitExceeded { .. } | Self::BulkheadFull { .. }
        )
    }

    /// Short label for logs and persisted outcome records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimitExceeded { .. } => "rate_limited",
            Self::BulkheadFull { .. } => "bulkhead_full",
            Self::Timeout { .. } => "timeout",
            Self::Operation { .. } => "failure",
        }
    }
}

impl<E> ErrorClassification for ResilienceError<E>
where
    E: std::error::Error + ErrorClassification + Send + Sync + 'static,
{
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::RetryExhausted { last, .. } => last.failure_kind(),
            Self::CircuitOpen { .. } | Self::BulkheadFull { .. } => FailureKind::Rejected,
            Self::RateLimitExceeded { .. } => FailureKind::RateLimited,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Operation { source } => source.failure_kind(),
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            Self::RetryExhausted { .. } => false,
            Self::Operation { source } => source.is_retryable(),
            other => other.failure_kind().is_transient(),
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::RetryExhausted { .. } => ErrorSeverity::Error,
            Self::Operation { source } => source.severity(),
            _ => ErrorSeverity::Warning,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Operation { source } => source.retry_after(),
            _ => None,
        }
    }
}
