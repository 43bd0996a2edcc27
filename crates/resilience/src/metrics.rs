//! Durable outcome metrics
//!
//! Components report what happened to each protected call as an
//! [`OutcomeEvent`] through the [`MetricsSink`] trait. [`MetricsStore`]
//! appends those events to a local JSON-lines file; [`InMemoryMetrics`] keeps
//! them in memory for tests and short-lived processes.
//!
//! Persistence never fails the caller: write errors are logged and counted,
//! then dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit_breaker::{BreakerListener, CircuitEvent};

/// Toolkit component that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Retry,
    CircuitBreaker,
    RateLimiter,
    Bulkhead,
    Cache,
    Tracer,
    Health,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Retry => "retry",
            Self::CircuitBreaker => "circuit_breaker",
            Self::RateLimiter => "rate_limiter",
            Self::Bulkhead => "bulkhead",
            Self::Cache => "cache",
            Self::Tracer => "tracer",
            Self::Health => "health",
        };
        f.write_str(label)
    }
}

/// One persisted outcome record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub timestamp: DateTime<Utc>,
    pub component: Component,
    pub resource_name: String,
    /// `success`, `failure`, `timeout`, `circuit_open`, `state:OPEN`, ...
    pub outcome: String,
    pub latency_ms: u64,
    pub attempt_number: u32,
}

impl OutcomeEvent {
    pub fn new(
        component: Component,
        resource_name: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            component,
            resource_name: resource_name.into(),
            outcome: outcome.into(),
            latency_ms: 0,
            attempt_number: 1,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_attempt(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == "success"
    }
}

/// Destination for outcome events.
///
/// `record` must not block on, or report, persistence failures.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: OutcomeEvent);
}

/// Append-only JSON-lines metrics file.
///
/// Each event is serialized in full and written with a single `write_all`
/// on a file opened in append mode, so concurrent readers only ever observe
/// whole lines plus at most one trailing partial line.
#[derive(Debug)]
pub struct MetricsStore {
    path: PathBuf,
    file: Mutex<File>,
    written: AtomicU64,
    write_failures: AtomicU64,
}

impl MetricsStore {
    /// Open (creating if needed) the metrics file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "metrics store opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
            written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events successfully appended since open.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Events dropped because serialization or I/O failed.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    fn append(&self, event: &OutcomeEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event).map_err(io::Error::other)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()
    }
}

impl MetricsSink for MetricsStore {
    fn record(&self, event: OutcomeEvent) {
        match self.append(&event) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    path = %self.path.display(),
                    component = %event.component,
                    resource = %event.resource_name,
                    error = %err,
                    "failed to persist outcome event"
                );
            }
        }
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetrics {
    events: Arc<Mutex<Vec<OutcomeEvent>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutcomeEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Events for one component, in recording order.
    pub fn events_for(&self, component: Component) -> Vec<OutcomeEvent> {
        self.events.lock().iter().filter(|e| e.component == component).cloned().collect()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, event: OutcomeEvent) {
        self.events.lock().push(event);
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Arc<S> {
    fn record(&self, event: OutcomeEvent) {
        (**self).record(event);
    }
}

/// Breaker transitions are persisted as `state:<STATE>` outcomes.
fn transition_event(event: &CircuitEvent) -> OutcomeEvent {
    OutcomeEvent::new(Component::CircuitBreaker, event.name.clone(), format!("state:{}", event.to))
        .at(event.at)
        .with_attempt(0)
}

impl BreakerListener for MetricsStore {
    fn on_transition(&self, event: &CircuitEvent) {
        self.record(transition_event(event));
    }
}

impl BreakerListener for InMemoryMetrics {
    fn on_transition(&self, event: &CircuitEvent) {
        self.record(transition_event(event));
    }
}

/// Read every complete record from a metrics file.
///
/// Lines that do not parse (a record still being written, or corruption) are
/// skipped with a debug log.
pub fn read_events(path: impl AsRef<Path>) -> io::Result<Vec<OutcomeEvent>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OutcomeEvent>(&line) {
            Ok(event) => events.push(event),
            Err(err) => debug!(line = index + 1, error = %err, "skipping unreadable metrics line"),
        }
    }
    Ok(events)
}

/// Per-resource aggregate over a set of events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSummary {
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
}

impl ResourceSummary {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total() as f64
    }

    pub fn mean_latency_ms(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.total() as f64
    }
}

/// Aggregate call outcomes by `(component, resource_name)`.
///
/// State-change records (`state:*`) are not call outcomes and are skipped.
pub fn summarize(events: &[OutcomeEvent]) -> BTreeMap<(Component, String), ResourceSummary> {
    let mut summary: BTreeMap<(Component, String), ResourceSummary> = BTreeMap::new();
    for event in events.iter().filter(|e| !e.outcome.starts_with("state:")) {
        let entry = summary.entry((event.component, event.resource_name.clone())).or_default();
        if event.is_success() {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.total_latency_ms = entry.total_latency_ms.saturating_add(event.latency_ms);
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn store_appends_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics").join("outcomes.jsonl");
        let store = MetricsStore::open(&path).unwrap();

        store.record(
            OutcomeEvent::new(Component::Retry, "binance", "success")
                .with_latency(Duration::from_millis(42))
                .with_attempt(2),
        );
        store.record(OutcomeEvent::new(Component::Retry, "binance", "failure"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"resource_name\":\"binance\""));
        assert!(contents.contains("\"attempt_number\":2"));

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].latency_ms, 42);
        assert_eq!(store.written(), 2);
    }

    /// Reopening appends instead of truncating.
    #[test]
    fn store_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        MetricsStore::open(&path).unwrap().record(OutcomeEvent::new(Component::Cache, "k", "success"));
        MetricsStore::open(&path).unwrap().record(OutcomeEvent::new(Component::Cache, "k", "stale"));

        assert_eq!(read_events(&path).unwrap().len(), 2);
    }

    #[test]
    fn reader_skips_partial_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        let store = MetricsStore::open(&path).unwrap();
        store.record(OutcomeEvent::new(Component::Bulkhead, "orders", "success"));

        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"timestamp\":\"2024-01-").unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn summarize_groups_by_resource() {
        let events = vec![
            OutcomeEvent::new(Component::Retry, "a", "success").with_latency(Duration::from_millis(10)),
            OutcomeEvent::new(Component::Retry, "a", "failure").with_latency(Duration::from_millis(30)),
            OutcomeEvent::new(Component::Retry, "b", "success"),
            OutcomeEvent::new(Component::CircuitBreaker, "a", "state:OPEN"),
        ];

        let summary = summarize(&events);
        let a = &summary[&(Component::Retry, "a".to_string())];
        assert_eq!(a.total(), 2);
        assert!((a.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!((a.mean_latency_ms() - 20.0).abs() < f64::EPSILON);
        assert_eq!(summary.len(), 2);
    }

    #[test]
    fn in_memory_filters_by_component() {
        let sink = InMemoryMetrics::new();
        sink.record(OutcomeEvent::new(Component::Retry, "x", "success"));
        sink.record(OutcomeEvent::new(Component::Cache, "x", "success"));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_for(Component::Cache).len(), 1);
    }
}
