use std::io;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use steadfast_resilience::{
    Alert, AlertManager, Bulkhead, CacheConfig, CircuitBreaker, CircuitBreakerConfig,
    GracefulCache, RateLimiter, RequestTracer, RetryConfig, RetryExecutor,
};
use tokio::runtime::Runtime;

fn benchmark_guards(c: &mut Criterion) {
    // ---------------------------------------------------------------------
    // Admission fast paths
    // ---------------------------------------------------------------------
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default())
        .expect("breaker config");
    c.bench_function("circuit_breaker_call_closed", |b| {
        b.iter(|| breaker.call(|| Ok::<_, io::Error>(black_box(1))))
    });

    let limiter = RateLimiter::new(1_000_000, Duration::from_millis(1)).expect("limiter");
    c.bench_function("rate_limiter_try_acquire", |b| b.iter(|| black_box(limiter.try_acquire())));

    let bulkhead = Bulkhead::new(64).expect("bulkhead");
    c.bench_function("bulkhead_try_acquire_release", |b| {
        b.iter(|| drop(black_box(bulkhead.try_acquire())))
    });
}

fn benchmark_retry(c: &mut Criterion) {
    let config = RetryConfig::builder().max_attempts(3).build().expect("retry config");
    let executor = RetryExecutor::new(config.clone()).named("bench");
    c.bench_function("retry_run_first_attempt_success", |b| {
        b.iter(|| executor.run(|| Ok::<_, io::Error>(black_box(42))))
    });

    let traced = RetryExecutor::new(config)
        .named("bench-traced")
        .with_tracer(RequestTracer::new(128).expect("tracer"));
    c.bench_function("retry_run_traced", |b| {
        b.iter(|| traced.run(|| Ok::<_, io::Error>(black_box(42))))
    });

    let rt = Runtime::new().expect("tokio runtime");
    let async_executor =
        RetryExecutor::new(RetryConfig::default()).with_bulkhead(Bulkhead::new(8).expect("bulkhead"));
    c.bench_function("retry_run_async_with_bulkhead", |b| {
        b.to_async(&rt).iter(|| async {
            async_executor.run_async(|| async { Ok::<_, io::Error>(black_box(7)) }).await
        })
    });
}

fn benchmark_cache_and_alerts(c: &mut Criterion) {
    let cache: GracefulCache<u64, u64> =
        GracefulCache::new(CacheConfig::builder().max_entries(1_024).build().expect("cache config"))
            .expect("cache");
    for key in 0..1_024 {
        cache.insert(key, key);
    }
    let mut key = 0u64;
    c.bench_function("cache_fresh_hit", |b| {
        b.iter(|| {
            key = (key + 1) % 1_024;
            cache.get_or_compute(key, || Ok::<_, io::Error>(0))
        })
    });

    let alerts = Arc::new(AlertManager::new(Duration::from_secs(300)));
    alerts.notify(Alert::warning("warm"));
    c.bench_function("alert_notify_throttled", |b| {
        b.iter(|| black_box(alerts.notify(Alert::warning("warm"))))
    });
}

criterion_group!(benches, benchmark_guards, benchmark_retry, benchmark_cache_and_alerts);
criterion_main!(benches);
