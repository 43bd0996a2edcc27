//! Health checks over registered probes
//!
//! A [`HealthChecker`] owns named [`HealthProbe`]s and runs them concurrently,
//! each under its own timeout. A probe that overruns, or panics, is reported
//! unhealthy; it never takes the whole report down.
//!
//! When an [`AlertManager`] is attached, a probe flipping between healthy and
//! unhealthy raises an alert. Probes start out presumed healthy, so a probe
//! that is unhealthy on its first run alerts immediately.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::alerts::{Alert, AlertLevel, AlertManager};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::{Clock, SystemClock};

/// What a single probe reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub message: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy() -> Self {
        Self { healthy: true, message: None }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { healthy: false, message: Some(message.into()) }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl From<bool> for ProbeOutcome {
    fn from(healthy: bool) -> Self {
        Self { healthy, message: None }
    }
}

/// A named liveness check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> ProbeOutcome;
}

/// Probe backed by an async closure.
pub struct FnProbe<F> {
    check: F,
}

impl<F> FnProbe<F> {
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

impl<F> fmt::Debug for FnProbe<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProbe").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ProbeOutcome> + Send,
{
    async fn check(&self) -> ProbeOutcome {
        (self.check)().await
    }
}

/// Healthy only while the breaker is CLOSED.
#[derive(Debug, Clone)]
pub struct CircuitBreakerProbe<C: Clock = SystemClock> {
    breaker: CircuitBreaker<C>,
}

impl<C: Clock> CircuitBreakerProbe<C> {
    pub fn new(breaker: CircuitBreaker<C>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl<C: Clock> HealthProbe for CircuitBreakerProbe<C> {
    async fn check(&self) -> ProbeOutcome {
        match self.breaker.state() {
            CircuitState::Closed => ProbeOutcome::healthy(),
            state => ProbeOutcome::unhealthy(format!(
                "circuit breaker '{}' is {state}",
                self.breaker.name()
            )),
        }
    }
}

/// One probe's result within a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    pub latency_ms: u64,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate of one [`HealthChecker::run_all`] pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// True iff every probe is healthy
    pub healthy: bool,
    /// In registration order
    pub results: Vec<HealthCheckResult>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn result(&self, name: &str) -> Option<&HealthCheckResult> {
        self.results.iter().find(|result| result.name == name)
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.results.iter().filter(|result| !result.healthy)
    }

    /// Fraction of probes reporting healthy; 1.0 when nothing is registered.
    pub fn score(&self) -> f64 {
        if self.results.is_empty() {
            return 1.0;
        }
        let healthy = self.results.iter().filter(|result| result.healthy).count();
        healthy as f64 / self.results.len() as f64
    }
}

type ProbeList = Vec<(String, Arc<dyn HealthProbe>)>;

/// Registry and runner of health probes.
#[derive(Default)]
pub struct HealthChecker {
    probes: Mutex<ProbeList>,
    last_healthy: Mutex<HashMap<String, bool>>,
    alerts: Option<Arc<AlertManager>>,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.probes.lock().iter().map(|(name, _)| name.clone()).collect();
        f.debug_struct("HealthChecker")
            .field("probes", &names)
            .field("alerts", &self.alerts.is_some())
            .finish()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alert through `alerts` when a probe changes state.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Register `probe` under `name`. Re-registering a name replaces the probe
    /// in place.
    pub fn register(&self, name: impl Into<String>, probe: impl HealthProbe + 'static) {
        self.register_arc(name, Arc::new(probe));
    }

    pub fn register_arc(&self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        let name = name.into();
        let mut probes = self.probes.lock();
        match probes.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = probe,
            None => probes.push((name, probe)),
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut probes = self.probes.lock();
        let before = probes.len();
        probes.retain(|(existing, _)| existing != name);
        self.last_healthy.lock().remove(name);
        probes.len() != before
    }

    pub fn len(&self) -> usize {
        self.probes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.lock().is_empty()
    }

    /// Run every probe concurrently, each bounded by `timeout`.
    ///
    /// Every check runs on its own tokio task, so one that blocks its thread
    /// is still cut off at `timeout` on a multi-threaded runtime. An
    /// overrunning task is aborted.
    #[instrument(skip(self), fields(probes = self.len()))]
    pub async fn run_all(&self, timeout: Duration) -> HealthReport {
        let probes: ProbeList = self.probes.lock().clone();

        let checks = probes.into_iter().map(|(name, probe)| async move {
            let started = Instant::now();
            let mut task = tokio::spawn(async move { probe.check().await });
            let outcome = match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) if err.is_panic() => ProbeOutcome::unhealthy("probe panicked"),
                Ok(Err(_)) => ProbeOutcome::unhealthy("probe cancelled"),
                Err(_) => {
                    task.abort();
                    ProbeOutcome::unhealthy(format!("timed out after {timeout:?}"))
                }
            };
            HealthCheckResult {
                name,
                healthy: outcome.healthy,
                latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                message: outcome.message,
                timestamp: Utc::now(),
            }
        });
        let results = join_all(checks).await;

        for result in &results {
            self.track_transition(result);
        }

        let healthy = results.iter().all(|result| result.healthy);
        if healthy {
            debug!(probes = results.len(), "all health probes passed");
        } else {
            warn!(
                failing = results.iter().filter(|result| !result.healthy).count(),
                "health check found unhealthy probes"
            );
        }
        HealthReport { healthy, results, checked_at: Utc::now() }
    }

    fn track_transition(&self, result: &HealthCheckResult) {
        let previous = self.last_healthy.lock().insert(result.name.clone(), result.healthy);
        if previous.unwrap_or(true) == result.healthy {
            return;
        }

        let alert = if result.healthy {
            info!(probe = %result.name, "health probe recovered");
            Alert::new(AlertLevel::Info, format!("health check '{}' recovered", result.name))
        } else {
            warn!(probe = %result.name, message = ?result.message, "health probe became unhealthy");
            Alert::new(
                AlertLevel::Warning,
                format!(
                    "health check '{}' failing: {}",
                    result.name,
                    result.message.as_deref().unwrap_or("unhealthy")
                ),
            )
        };
        if let Some(alerts) = &self.alerts {
            let key = format!("health:{}:{}", result.name, if result.healthy { "up" } else { "down" });
            alerts.notify(alert.with_dedup_key(key).with_source(result.name.clone()));
        }
    }
}
