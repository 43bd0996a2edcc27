//! Bulkhead pattern for limiting concurrent operations
//!
//! A bulkhead caps how many callers may be inside a compartment at once, so
//! one slow dependency cannot exhaust threads or tasks shared with others.
//! Slots are held through [`BulkheadPermit`] guards; dropping the guard frees
//! the slot, which also covers cancelled tasks and panicking callers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::error::{AdmissionError, ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// Bulkhead metrics for monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct BulkheadMetrics {
    pub capacity: usize,
    /// Permits currently held
    pub in_use: usize,
    /// Highest `in_use` ever observed
    pub peak: usize,
    pub accepted: u64,
    pub rejected: u64,
}

impl BulkheadMetrics {
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use)
    }

    /// Current utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.in_use as f64 / self.capacity as f64
    }

    pub fn rejection_rate(&self) -> f64 {
        let total = self.accepted + self.rejected;
        if total == 0 {
            return 0.0;
        }
        self.rejected as f64 / total as f64
    }

    pub fn is_at_capacity(&self) -> bool {
        self.in_use >= self.capacity
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Bulkhead: {}/{} in use ({:.1}% utilized), peak {}, {} rejected",
            self.in_use,
            self.capacity,
            self.utilization() * 100.0,
            self.peak,
            self.rejected
        )
    }
}

#[derive(Debug, Default)]
struct Slots {
    in_use: usize,
    peak: usize,
    accepted: u64,
    rejected: u64,
}

struct BulkheadInner {
    capacity: usize,
    acquire_timeout: Duration,
    slots: Mutex<Slots>,
    freed: Condvar,
    freed_async: Notify,
}

impl BulkheadInner {
    fn try_take(&self) -> bool {
        let mut slots = self.slots.lock();
        self.take_locked(&mut slots)
    }

    fn take_locked(&self, slots: &mut Slots) -> bool {
        if slots.in_use >= self.capacity {
            return false;
        }
        slots.in_use += 1;
        slots.peak = slots.peak.max(slots.in_use);
        slots.accepted += 1;
        true
    }

    fn count_rejection(&self) {
        self.slots.lock().rejected += 1;
    }

    fn full(&self) -> AdmissionError {
        AdmissionError::BulkheadFull { capacity: self.capacity }
    }

    fn give_back(&self) {
        {
            let mut slots = self.slots.lock();
            slots.in_use = slots.in_use.saturating_sub(1);
        }
        self.freed.notify_one();
        self.freed_async.notify_one();
    }
}

/// Bounded-concurrency gate shared by threads and tasks.
///
/// Cloning yields another handle to the same compartment.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use steadfast_resilience::Bulkhead;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bulkhead = Bulkhead::new(2)?;
///
/// let permit = bulkhead.acquire(Duration::from_millis(100))?;
/// // ... guarded work ...
/// bulkhead.release(permit);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<BulkheadInner>,
}

impl Bulkhead {
    /// Allow at most `capacity` concurrent holders.
    ///
    /// `execute` fails fast when full; see [`Bulkhead::with_acquire_timeout`].
    pub fn new(capacity: usize) -> ConfigResult<Self> {
        Self::with_acquire_timeout(capacity, Duration::ZERO)
    }

    /// Like [`Bulkhead::new`], with `execute` waiting up to `acquire_timeout`.
    pub fn with_acquire_timeout(capacity: usize, acquire_timeout: Duration) -> ConfigResult<Self> {
        if capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be greater than 0"));
        }
        Ok(Self {
            inner: Arc::new(BulkheadInner {
                capacity,
                acquire_timeout,
                slots: Mutex::new(Slots::default()),
                freed: Condvar::new(),
                freed_async: Notify::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_use(&self) -> usize {
        self.inner.slots.lock().in_use
    }

    /// Take a slot if one is free. Never blocks.
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        if self.inner.try_take() {
            Some(self.permit())
        } else {
            debug!(capacity = self.inner.capacity, "bulkhead full");
            self.inner.count_rejection();
            None
        }
    }

    /// Block the current thread until a slot frees or `timeout` elapses.
    pub fn acquire(&self, timeout: Duration) -> Result<BulkheadPermit, AdmissionError> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.inner.slots.lock();
        loop {
            if self.inner.take_locked(&mut slots) {
                return Ok(self.permit());
            }
            if self.inner.freed.wait_until(&mut slots, deadline).timed_out() {
                if self.inner.take_locked(&mut slots) {
                    return Ok(self.permit());
                }
                slots.rejected += 1;
                drop(slots);
                debug!(capacity = self.inner.capacity, "bulkhead acquire timed out");
                return Err(self.inner.full());
            }
        }
    }

    /// Wait on the current task until a slot frees or `timeout` elapses.
    ///
    /// Dropping the future while waiting leaves the bulkhead untouched.
    pub async fn acquire_async(&self, timeout: Duration) -> Result<BulkheadPermit, AdmissionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.freed_async.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.try_take() {
                return Ok(self.permit());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                if self.inner.try_take() {
                    return Ok(self.permit());
                }
                debug!(capacity = self.inner.capacity, "bulkhead acquire timed out");
                self.inner.count_rejection();
                return Err(self.inner.full());
            }
        }
    }

    /// Return a slot early. Equivalent to dropping the permit.
    pub fn release(&self, permit: BulkheadPermit) {
        permit.release();
    }

    /// Run `operation` inside the compartment.
    #[instrument(skip(self, operation), fields(capacity = self.inner.capacity))]
    pub fn execute<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _permit = self.acquire(self.inner.acquire_timeout).map_err(|err| {
            warn!(capacity = self.inner.capacity, "bulkhead rejected operation");
            ResilienceError::from(err)
        })?;
        operation().map_err(ResilienceError::operation)
    }

    /// Async form of [`Bulkhead::execute`].
    #[instrument(skip(self, operation), fields(capacity = self.inner.capacity))]
    pub async fn execute_async<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _permit = self.acquire_async(self.inner.acquire_timeout).await.map_err(|err| {
            warn!(capacity = self.inner.capacity, "bulkhead rejected operation");
            ResilienceError::from(err)
        })?;
        operation().await.map_err(ResilienceError::operation)
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        let slots = self.inner.slots.lock();
        BulkheadMetrics {
            capacity: self.inner.capacity,
            in_use: slots.in_use,
            peak: slots.peak,
            accepted: slots.accepted,
            rejected: slots.rejected,
        }
    }

    fn permit(&self) -> BulkheadPermit {
        BulkheadPermit { inner: Arc::clone(&self.inner), released: false }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("capacity", &self.inner.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// A held bulkhead slot. Dropping it frees the slot exactly once.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit {
    inner: Arc<BulkheadInner>,
    released: bool,
}

impl BulkheadPermit {
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.give_back();
        }
    }
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit").field("capacity", &self.inner.capacity).finish()
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.give_back();
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Bulkhead::new(0).is_err());
    }

    #[test]
    fn test_try_acquire_respects_capacity() {
        let bulkhead = Bulkhead::new(2).unwrap();
        let first = bulkhead.try_acquire().unwrap();
        let _second = bulkhead.try_acquire().unwrap();
        assert!(bulkhead.try_acquire().is_none());

        bulkhead.release(first);
        assert!(bulkhead.try_acquire().is_some());

        let metrics = bulkhead.metrics();
        assert_eq!(metrics.peak, 2);
        assert_eq!(metrics.accepted, 3);
        assert_eq!(metrics.rejected, 1);
    }

    #[test]
    fn test_metrics_status_message() {
        let bulkhead = Bulkhead::new(4).unwrap();
        let _permit = bulkhead.try_acquire().unwrap();
        let metrics = bulkhead.metrics();

        assert_eq!(metrics.available(), 3);
        assert!((metrics.utilization() - 0.25).abs() < f64::EPSILON);
        assert_eq!(metrics.status_message(), "Bulkhead: 1/4 in use (25.0% utilized), peak 1, 0 rejected");
    }

    #[test]
    fn test_acquire_times_out_when_full() {
        let bulkhead = Bulkhead::new(1).unwrap();
        let _held = bulkhead.try_acquire().unwrap();

        let started = Instant::now();
        let err = bulkhead.acquire(Duration::from_millis(30)).unwrap_err();
        assert_eq!(err, AdmissionError::BulkheadFull { capacity: 1 });
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(bulkhead.metrics().rejected, 1);
    }

    /// Each refused admission is counted once, whichever path refused it.
    #[tokio::test(start_paused = true)]
    async fn test_every_rejection_path_counts_once() {
        let bulkhead = Bulkhead::new(1).unwrap();
        let _held = bulkhead.try_acquire().unwrap();

        assert!(bulkhead.try_acquire().is_none());
        assert_eq!(bulkhead.metrics().rejected, 1);

        let err = bulkhead.acquire_async(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, AdmissionError::BulkheadFull { capacity: 1 });
        assert_eq!(bulkhead.metrics().rejected, 2);

        assert!(bulkhead.acquire(Duration::ZERO).is_err());
        assert_eq!(bulkhead.metrics().rejected, 3);
        assert_eq!(bulkhead.metrics().accepted, 1);
    }

    #[test]
    fn test_blocked_thread_wakes_on_release() {
        let bulkhead = Bulkhead::new(1).unwrap();
        let held = bulkhead.try_acquire().unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            thread::spawn(move || bulkhead.acquire(Duration::from_secs(5)).map(drop))
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(bulkhead.in_use(), 0);
    }

    /// No more than `capacity` operations ever run at once.
    #[test]
    fn test_execute_never_exceeds_capacity() {
        let bulkhead = Bulkhead::with_acquire_timeout(3, Duration::from_secs(5)).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let bulkhead = bulkhead.clone();
                let running = Arc::clone(&running);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    bulkhead.execute(|| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, io::Error>(())
                    })
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        let metrics = bulkhead.metrics();
        assert!(metrics.peak <= 3);
        assert_eq!(metrics.accepted, 12);
        assert_eq!(metrics.in_use, 0);
    }

    #[test]
    fn test_execute_fails_fast_without_timeout() {
        let bulkhead = Bulkhead::new(1).unwrap();
        let _held = bulkhead.try_acquire().unwrap();
        let result = bulkhead.execute(|| Ok::<_, io::Error>(()));
        assert!(matches!(result, Err(ResilienceError::BulkheadFull { capacity: 1 })));
    }

    #[test]
    fn test_panicking_holder_releases_slot() {
        let bulkhead = Bulkhead::new(1).unwrap();
        let cloned = bulkhead.clone();
        let outcome = thread::spawn(move || {
            let _permit = cloned.try_acquire().unwrap();
            panic!("holder crashed");
        })
        .join();

        assert!(outcome.is_err());
        assert_eq!(bulkhead.in_use(), 0);
    }

    #[tokio::test]
    async fn test_async_waiter_wakes_on_release() {
        let bulkhead = Bulkhead::new(1).unwrap();
        let held = bulkhead.try_acquire().unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire_async(Duration::from_secs(5)).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_execute_releases_slot() {
        let bulkhead = Bulkhead::new(1).unwrap();
        let pending = bulkhead.execute_async(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, io::Error>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), pending).await.is_err());

        assert_eq!(bulkhead.in_use(), 0);
        assert!(bulkhead.acquire_async(Duration::ZERO).await.is_ok());
    }
}
