//! Stock retry policies

use std::collections::HashSet;
use std::fmt;

use super::{RetryDecision, RetryPolicy};
use crate::error::{ErrorClassification, FailureKind};

/// Always retry policy - retries on any error
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<E> RetryPolicy<E> for AlwaysRetry {
    fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
        RetryDecision::Retry
    }
}

/// Never retry policy - the first failure propagates
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl<E> RetryPolicy<E> for NeverRetry {
    fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
        RetryDecision::Stop
    }
}

/// Predicate-based retry policy
#[derive(Clone)]
pub struct PredicateRetry<F> {
    predicate: F,
}

impl<F> PredicateRetry<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> fmt::Debug for PredicateRetry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PredicateRetry(<function>)")
    }
}

impl<F, E> RetryPolicy<E> for PredicateRetry<F>
where
    F: Fn(&E, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
        if (self.predicate)(error, attempt) {
            RetryDecision::Retry
        } else {
            RetryDecision::Stop
        }
    }
}

/// Retry errors whose [`FailureKind`] is in a set, honouring `retry_after`
/// hints. The default set is [`FailureKind::TRANSIENT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOnKinds {
    kinds: HashSet<FailureKind>,
}

impl RetryOnKinds {
    pub fn new(kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        Self { kinds: kinds.into_iter().collect() }
    }

    pub fn transient() -> Self {
        Self::new(FailureKind::TRANSIENT)
    }

    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    pub fn retries(&self, kind: FailureKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl Default for RetryOnKinds {
    fn default() -> Self {
        Self::transient()
    }
}

impl<E: ErrorClassification> RetryPolicy<E> for RetryOnKinds {
    fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
        if !self.retries(error.failure_kind()) {
            return RetryDecision::Stop;
        }
        match error.retry_after() {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::*;

    #[derive(Debug)]
    struct Throttled;

    impl ErrorClassification for Throttled {
        fn failure_kind(&self) -> FailureKind {
            FailureKind::RateLimited
        }

        fn retry_after(&self) -> Option<Duration> {
            Some(Duration::from_secs(3))
        }
    }

    #[test]
    fn test_retry_decision_equality() {
        assert_eq!(RetryDecision::Retry, RetryDecision::Retry);
        assert_ne!(RetryDecision::Retry, RetryDecision::Stop);
    }

    #[test]
    fn test_always_and_never() {
        let err = io::Error::other("boom");
        assert_eq!(AlwaysRetry.should_retry(&err, 1), RetryDecision::Retry);
        assert_eq!(NeverRetry.should_retry(&err, 1), RetryDecision::Stop);
    }

    #[test]
    fn test_predicate_retry_sees_attempt_number() {
        let policy = PredicateRetry::new(|_: &io::Error, attempt: u32| attempt < 2);
        let err = io::Error::other("boom");
        assert_eq!(policy.should_retry(&err, 1), RetryDecision::Retry);
        assert_eq!(policy.should_retry(&err, 2), RetryDecision::Stop);
    }

    /// The default policy retries transient kinds only.
    #[test]
    fn test_retry_on_kinds_default() {
        let policy = RetryOnKinds::default();
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let invalid = io::Error::new(io::ErrorKind::InvalidInput, "bad");

        assert_eq!(policy.should_retry(&reset, 1), RetryDecision::Retry);
        assert_eq!(policy.should_retry(&invalid, 1), RetryDecision::Stop);
        assert!(RetryOnKinds::transient().with_kind(FailureKind::Client).retries(FailureKind::Client));
    }

    #[test]
    fn test_retry_after_hint_is_honoured() {
        let policy = RetryOnKinds::default();
        assert_eq!(
            policy.should_retry(&Throttled, 1),
            RetryDecision::RetryAfter(Duration::from_secs(3))
        );
    }
}
