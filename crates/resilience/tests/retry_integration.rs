//! Integration tests for the retry executor
//!
//! Covers backoff timing, classification-driven retry decisions, and
//! composition with the breaker, rate limiter and bulkhead.

mod support;

use std::sync::Arc;
use std::time::Duration;

use steadfast_resilience::retry::{AlwaysRetry, PredicateRetry};
use steadfast_resilience::{
    retry, retry_async, AlertManager, Bulkhead, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    Component, InMemoryMetrics, RateLimiter, ResilienceError, RetryConfig, RetryExecutor,
};
use support::{exact_backoff, Counter, TestError};

/// Validates the documented backoff schedule end to end.
///
/// # Test Steps
/// 1. Configure 4 attempts, base 100ms, multiplier 2, max 1s, no jitter
/// 2. Fail every attempt with a transient error
/// 3. Verify exactly 4 attempts and delays of 100, 200 and 400 ms
/// 4. Verify the error is `RetryExhausted` carrying the last failure
#[tokio::test(start_paused = true)]
async fn test_exponential_schedule_is_exact() {
    let calls = Counter::new();
    let executor = RetryExecutor::new(exact_backoff(4, 100, 1_000)).named("price-feed");

    let outcome = executor
        .run_async_with_outcome(|| {
            let calls = calls.clone();
            async move {
                calls.bump();
                Err::<(), _>(TestError::transient("connection reset"))
            }
        })
        .await;

    assert_eq!(calls.get(), 4);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(
        outcome.delays,
        vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
    );
    assert_eq!(outcome.total_delay, Duration::from_millis(700));

    let err = outcome.into_result().unwrap_err();
    assert_eq!(err.attempts(), Some(4));
    assert_eq!(err.operation_error().unwrap().message, "connection reset");
}

/// Tests that delays are capped at `max_delay`.
#[tokio::test(start_paused = true)]
async fn test_delays_capped_at_max() {
    let executor = RetryExecutor::new(exact_backoff(6, 100, 300));
    let outcome = executor
        .run_async_with_outcome(|| async { Err::<(), _>(TestError::transient("down")) })
        .await;

    let millis: Vec<u128> = outcome.delays.iter().map(Duration::as_millis).collect();
    assert_eq!(millis, vec![100, 200, 300, 300, 300]);
}

#[test]
fn test_permanent_error_fails_on_first_attempt() {
    let calls = Counter::new();
    let executor = RetryExecutor::new(exact_backoff(5, 1, 10));

    let result: Result<(), _> = executor.run(|| {
        calls.bump();
        Err(TestError::permanent("bad symbol"))
    });

    assert_eq!(calls.get(), 1);
    let err = result.unwrap_err();
    assert!(matches!(err, ResilienceError::Operation { .. }));
    assert_eq!(err.attempts(), None);
}

#[test]
fn test_recovers_after_transient_failures() {
    let calls = Counter::new();
    let result = retry(exact_backoff(5, 1, 10), AlwaysRetry, || {
        if calls.bump() < 3 {
            Err(TestError::transient("flaky"))
        } else {
            Ok("filled")
        }
    });

    assert_eq!(result.unwrap(), "filled");
    assert_eq!(calls.get(), 3);
}

/// Tests that a server-supplied `retry_after` replaces the computed backoff.
#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_overrides_backoff() {
    let calls = Counter::new();
    let executor = RetryExecutor::new(exact_backoff(2, 10, 5_000));
    let outcome = executor
        .run_async_with_outcome(|| {
            let calls = calls.clone();
            async move {
                if calls.bump() == 1 {
                    Err(TestError::rate_limited(Duration::from_secs(2)))
                } else {
                    Ok(1)
                }
            }
        })
        .await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.delays, vec![Duration::from_secs(2)]);
}

/// Tests that a `retry_after` hint longer than `max_delay` is clamped.
///
/// # Test Steps
/// 1. Configure a 500ms `max_delay`
/// 2. Fail the first attempt with a one-day `retry_after`
/// 3. Verify the run waited 500ms and then succeeded
#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_is_capped_at_max_delay() {
    let calls = Counter::new();
    let executor = RetryExecutor::new(exact_backoff(2, 10, 500));
    let started = tokio::time::Instant::now();
    let outcome = executor
        .run_async_with_outcome(|| {
            let calls = calls.clone();
            async move {
                if calls.bump() == 1 {
                    Err(TestError::rate_limited(Duration::from_secs(86_400)))
                } else {
                    Ok(1)
                }
            }
        })
        .await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.delays, vec![Duration::from_millis(500)]);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_custom_predicate_policy() {
    let calls = Counter::new();
    let policy = PredicateRetry::new(|err: &TestError, _attempt: u32| err.message.contains("retry"));
    let result: Result<(), _> = retry_async(exact_backoff(4, 1, 5), policy, || {
        let calls = calls.clone();
        async move {
            calls.bump();
            Err(TestError::permanent("please retry"))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.get(), 4);
}

/// Tests that a per-attempt timeout surfaces as `Timeout` and is retried.
#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_is_retried() {
    let calls = Counter::new();
    let config = RetryConfig::builder()
        .max_attempts(3)
        .base_delay(Duration::from_millis(10))
        .no_jitter()
        .attempt_timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    let result = RetryExecutor::new(config)
        .run_async(|| {
            let calls = calls.clone();
            async move {
                if calls.bump() < 3 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, TestError>("quote")
            }
        })
        .await;

    assert_eq!(result.unwrap(), "quote");
    assert_eq!(calls.get(), 3);
}

/// Validates the executor stops calling a dependency once its breaker opens.
///
/// # Test Steps
/// 1. Attach a breaker with threshold 2 to an executor with 5 attempts
/// 2. Fail every attempt
/// 3. Verify the operation ran twice and the run ended with `CircuitOpen`
#[test]
fn test_breaker_short_circuits_retries() {
    let breaker = CircuitBreaker::new(
        "exchange",
        CircuitBreakerConfig::builder()
            .failure_threshold(2)
            .recovery_timeout(Duration::from_secs(60))
            .build()
            .unwrap(),
    )
    .unwrap();
    let calls = Counter::new();
    let executor =
        RetryExecutor::new(exact_backoff(5, 1, 5)).named("exchange").with_circuit_breaker(breaker.clone());

    let result: Result<(), _> = executor.run(|| {
        calls.bump();
        Err(TestError::transient("503"))
    });

    assert_eq!(calls.get(), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(result.unwrap_err().is_circuit_open());
}

#[test]
fn test_rate_limiter_rejection_is_not_retried() {
    let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)).unwrap());
    let executor = RetryExecutor::new(exact_backoff(3, 1, 5)).with_rate_limiter(Arc::clone(&limiter));

    assert_eq!(executor.run(|| Ok::<_, TestError>(1)).unwrap(), 1);
    let err = executor.run(|| Ok::<_, TestError>(2)).unwrap_err();
    assert!(matches!(err, ResilienceError::RateLimitExceeded { max_calls: 1, .. }));
    assert_eq!(limiter.rejected_count(), 1);
}

#[tokio::test]
async fn test_bulkhead_slot_released_between_runs() {
    let bulkhead = Bulkhead::new(1).unwrap();
    let executor = RetryExecutor::new(exact_backoff(2, 1, 5)).with_bulkhead(bulkhead.clone());

    for _ in 0..3 {
        executor.run_async(|| async { Ok::<_, TestError>(()) }).await.unwrap();
    }
    assert_eq!(bulkhead.in_use(), 0);
    assert_eq!(bulkhead.metrics().accepted, 3);
}

/// Validates that an attempt queued on a full bulkhead leaves the breaker's
/// half-open trial slot free.
///
/// # Test Steps
/// 1. Open a breaker with a 30ms recovery timeout and let it elapse
/// 2. Fill a one-slot bulkhead and start a run that queues on it
/// 3. Verify another caller is still granted the trial permit
/// 4. Release the bulkhead slot and verify the queued run closes the breaker
#[test]
fn test_queued_attempt_does_not_hold_trial_slot() {
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(1)
        .recovery_timeout(Duration::from_millis(30))
        .build()
        .unwrap();
    let breaker = CircuitBreaker::new("quotes", config).unwrap();
    let _ = breaker.call(|| Err::<(), _>(TestError::transient("reset")));
    assert_eq!(breaker.state(), CircuitState::Open);
    std::thread::sleep(Duration::from_millis(50));

    let bulkhead = Bulkhead::new(1).unwrap();
    let held = bulkhead.try_acquire().unwrap();
    let executor = RetryExecutor::new(exact_backoff(1, 1, 1))
        .with_circuit_breaker(breaker.clone())
        .with_bulkhead(bulkhead.clone())
        .with_admission_timeout(Duration::from_secs(5));
    let queued = std::thread::spawn(move || executor.run(|| Ok::<_, TestError>("quote")));
    std::thread::sleep(Duration::from_millis(100));

    let trial = breaker.try_acquire().expect("trial slot should be free");
    assert!(trial.is_trial());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    drop(trial);

    drop(held);
    assert_eq!(queued.join().unwrap().unwrap(), "quote");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(bulkhead.in_use(), 0);
}

/// Tests that every attempt is recorded and exhaustion raises one alert.
#[test]
fn test_metrics_and_alert_on_exhaustion() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let alerts = Arc::new(AlertManager::new(Duration::from_secs(300)));
    let executor = RetryExecutor::new(exact_backoff(3, 1, 5))
        .named("settlement")
        .with_metrics(metrics.clone())
        .with_alerts(Arc::clone(&alerts));

    for _ in 0..2 {
        let _ = executor.run(|| Err::<(), _>(TestError::transient("timeout")));
    }

    let events = metrics.events_for(Component::Retry);
    assert_eq!(events.len(), 6);
    assert_eq!(events.iter().map(|e| e.attempt_number).max(), Some(3));
    assert!(events.iter().all(|e| e.resource_name == "settlement"));

    let stats = alerts.stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.throttled, 1);
}

#[test]
fn test_wrap_keeps_call_shape() {
    let calls = Counter::new();
    let mut fetch = RetryExecutor::new(exact_backoff(3, 1, 5)).wrap(|| {
        if calls.bump() % 2 == 1 {
            Err(TestError::transient("blip"))
        } else {
            Ok(calls.get())
        }
    });

    assert_eq!(fetch().unwrap(), 2);
    assert_eq!(fetch().unwrap(), 4);
}
