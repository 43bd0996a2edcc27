//! Deduplicated, throttled alert dispatch
//!
//! [`AlertManager::notify`] forwards an [`Alert`] to every registered
//! [`AlertHandler`] unless the same dedup key was dispatched within the
//! throttle window, or the alert is below the configured minimum level.
//! Handlers run after the dedup map is unlocked; their failures are logged
//! and never reach the caller.
//!
//! The manager is also a [`BreakerListener`]: breaker transitions become
//! alerts (OPEN is critical; HALF_OPEN and recovery are informational).

mod handlers;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use handlers::FileAlertHandler;
#[cfg(feature = "webhook")]
pub use handlers::WebhookAlertHandler;

use crate::circuit_breaker::{BreakerListener, CircuitEvent, CircuitState};
use crate::clock::{Clock, SystemClock};

/// Alert urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A notification for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Alerts sharing a key are throttled together; defaults to the message
    pub dedup_key: String,
    pub source: Option<String>,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        Self { level, dedup_key: message.clone(), message, timestamp: Utc::now(), source: None }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Warning, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Critical, message)
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = key.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Failure reported by an [`AlertHandler`]
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode alert: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Destination for dispatched alerts.
pub trait AlertHandler: Send + Sync {
    fn handle(&self, alert: &Alert) -> Result<(), AlertError>;

    /// Label used in delivery-failure logs.
    fn name(&self) -> &str {
        "handler"
    }
}

impl<F> AlertHandler for F
where
    F: Fn(&Alert) -> Result<(), AlertError> + Send + Sync,
{
    fn handle(&self, alert: &Alert) -> Result<(), AlertError> {
        self(alert)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// Dispatch counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertStats {
    pub dispatched: u64,
    pub throttled: u64,
    pub filtered: u64,
    pub handler_failures: u64,
}

/// Throttled dispatcher of alerts to handlers.
pub struct AlertManager {
    throttle_window: Duration,
    min_level: AlertLevel,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    last_sent: Mutex<HashMap<String, Instant>>,
    clock: Arc<dyn Clock>,
    dispatched: AtomicU64,
    throttled: AtomicU64,
    filtered: AtomicU64,
    handler_failures: AtomicU64,
}

impl fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertManager")
            .field("throttle_window", &self.throttle_window)
            .field("min_level", &self.min_level)
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl AlertManager {
    /// Suppress repeats of a dedup key for `throttle_window`.
    pub fn new(throttle_window: Duration) -> Self {
        Self {
            throttle_window,
            min_level: AlertLevel::Info,
            handlers: RwLock::new(Vec::new()),
            last_sent: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            dispatched: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    /// Drop alerts below `level`.
    pub fn with_min_level(mut self, level: AlertLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn throttle_window(&self) -> Duration {
        self.throttle_window
    }

    pub fn add_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().push(handler);
    }

    /// Dispatch `alert` unless filtered or throttled. Returns whether it was
    /// dispatched.
    pub fn notify(&self, alert: Alert) -> bool {
        if alert.level < self.min_level {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            debug!(level = %alert.level, key = %alert.dedup_key, "alert below minimum level");
            return false;
        }

        let now = self.clock.now();
        {
            let mut last_sent = self.last_sent.lock();
            if let Some(sent) = last_sent.get(&alert.dedup_key) {
                if now.saturating_duration_since(*sent) < self.throttle_window {
                    self.throttled.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %alert.dedup_key, "alert throttled");
                    return false;
                }
            }
            let window = self.throttle_window;
            last_sent.retain(|_, sent| now.saturating_duration_since(*sent) < window);
            last_sent.insert(alert.dedup_key.clone(), now);
        }

        info!(level = %alert.level, key = %alert.dedup_key, message = %alert.message, "dispatching alert");
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let handlers: Vec<Arc<dyn AlertHandler>> = self.handlers.read().clone();
        for handler in handlers {
            if let Err(err) = handler.handle(&alert) {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(handler = handler.name(), error = %err, "alert handler failed");
            }
        }
        true
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Alert describing a breaker transition.
pub fn transition_alert(event: &CircuitEvent) -> Alert {
    let (level, message) = match (event.from, event.to) {
        (_, CircuitState::Open) => (
            AlertLevel::Critical,
            format!(
                "circuit breaker '{}' opened after {} consecutive failures",
                event.name, event.failure_count
            ),
        ),
        (_, CircuitState::HalfOpen) => (
            AlertLevel::Info,
            format!("circuit breaker '{}' half-open, probing recovery", event.name),
        ),
        (from, CircuitState::Closed) => (
            AlertLevel::Info,
            format!("circuit breaker '{}' recovered ({from} -> CLOSED)", event.name),
        ),
    };
    Alert::new(level, message)
        .with_dedup_key(format!("circuit:{}:{}", event.name, event.to))
        .with_source(event.name.clone())
        .at(event.at)
}

impl BreakerListener for AlertManager {
    fn on_transition(&self, event: &CircuitEvent) {
        self.notify(transition_alert(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn recording() -> (Arc<Mutex<Vec<Alert>>>, Arc<dyn AlertHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = Arc::new(move |alert: &Alert| {
            sink.lock().push(alert.clone());
            Ok(())
        });
        (seen, handler)
    }

    /// Two same-key alerts within one minute of a five-minute window are
    /// dispatched once.
    #[test]
    fn test_same_key_throttled_within_window() {
        let clock = Arc::new(MockClock::new());
        let manager = AlertManager::new(Duration::from_secs(300)).with_clock(clock.clone());
        let (seen, handler) = recording();
        manager.add_handler(handler);

        assert!(manager.notify(Alert::warning("feed stale").with_dedup_key("feed")));
        clock.advance_secs(60);
        assert!(!manager.notify(Alert::warning("feed still stale").with_dedup_key("feed")));

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(manager.stats().throttled, 1);

        clock.advance_secs(240);
        assert!(manager.notify(Alert::warning("feed stale again").with_dedup_key("feed")));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_distinct_keys_not_throttled() {
        let manager = AlertManager::new(Duration::from_secs(300));
        assert!(manager.notify(Alert::warning("a")));
        assert!(manager.notify(Alert::warning("b")));
        assert_eq!(manager.stats().dispatched, 2);
    }

    #[test]
    fn test_min_level_filters() {
        let manager = AlertManager::new(Duration::ZERO).with_min_level(AlertLevel::Warning);
        assert!(!manager.notify(Alert::info("noise")));
        assert!(manager.notify(Alert::critical("outage")));
        assert_eq!(manager.stats().filtered, 1);
    }

    #[test]
    fn test_handler_failure_is_swallowed() {
        let manager = AlertManager::new(Duration::ZERO);
        manager.add_handler(Arc::new(|_: &Alert| Err(AlertError::Delivery("smtp down".into()))));
        let (seen, handler) = recording();
        manager.add_handler(handler);

        assert!(manager.notify(Alert::critical("exchange unreachable")));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(manager.stats().handler_failures, 1);
    }

    #[test]
    fn test_breaker_transitions_map_to_levels() {
        let open = CircuitEvent {
            name: "binance".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            failure_count: 5,
            at: Utc::now(),
        };
        let alert = transition_alert(&open);
        assert_eq!(alert.level, AlertLevel::Critical);
        assert!(alert.message.contains("after 5 consecutive failures"));
        assert_eq!(alert.dedup_key, "circuit:binance:OPEN");

        let closed = CircuitEvent { from: CircuitState::HalfOpen, to: CircuitState::Closed, ..open };
        assert_eq!(transition_alert(&closed).level, AlertLevel::Info);
        assert_eq!(transition_alert(&closed).source.as_deref(), Some("binance"));
    }

    #[test]
    fn test_alert_serializes_lowercase_level() {
        let json = serde_json::to_value(Alert::critical("x")).unwrap();
        assert_eq!(json["level"], "critical");
        assert_eq!(json["dedup_key"], "x");
    }
}
