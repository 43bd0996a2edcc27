//! Name-keyed breaker registry

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::{same_listener, BreakerListener, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigResult;

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// At most one breaker per name; breakers are created lazily and never
/// removed.
pub struct BreakerRegistry<C: Clock + Clone = SystemClock> {
    breakers: DashMap<String, CircuitBreaker<C>>,
    default_config: CircuitBreakerConfig,
    listeners: RwLock<Vec<Arc<dyn BreakerListener>>>,
    clock: C,
}

impl Default for BreakerRegistry<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry<SystemClock> {
    pub fn new() -> Self {
        Self::from_parts(CircuitBreakerConfig::default(), SystemClock)
    }

    /// Registry whose `get_or_default` uses `default_config`.
    pub fn with_default_config(default_config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(default_config, SystemClock)
    }
}

impl<C: Clock + Clone> BreakerRegistry<C> {
    pub fn with_clock(default_config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        default_config.validate()?;
        Ok(Self::from_parts(default_config, clock))
    }

    fn from_parts(default_config: CircuitBreakerConfig, clock: C) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            listeners: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Install `listener` on every breaker, existing and future.
    ///
    /// A breaker created concurrently may be reached both through the
    /// listener list and through the sweep; breakers ignore the repeat.
    pub fn add_listener(&self, listener: Arc<dyn BreakerListener>) {
        {
            let mut listeners = self.listeners.write();
            if listeners.iter().any(|existing| same_listener(existing, &listener)) {
                return;
            }
            listeners.push(Arc::clone(&listener));
        }
        for entry in self.breakers.iter() {
            entry.value().add_listener(Arc::clone(&listener));
        }
    }

    /// Return the breaker for `name`, creating it with `config` if absent.
    ///
    /// The first config registered under a name wins; later configs are
    /// ignored. Validation only happens on the create path.
    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> ConfigResult<CircuitBreaker<C>> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(existing.clone());
        }
        match self.breakers.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let breaker = CircuitBreaker::with_clock(name, config, self.clock.clone())?;
                for listener in self.listeners.read().iter() {
                    breaker.add_listener(Arc::clone(listener));
                }
                debug!(breaker = name, "circuit breaker registered");
                Ok(entry.insert(breaker).clone())
            }
        }
    }

    /// Return the breaker for `name`, creating it with the registry default.
    pub fn get_or_default(&self, name: &str) -> CircuitBreaker<C> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let breaker = CircuitBreaker::from_validated(
                    name,
                    self.default_config.clone(),
                    self.clock.clone(),
                );
                for listener in self.listeners.read().iter() {
                    breaker.add_listener(Arc::clone(listener));
                }
                breaker
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker<C>> {
        self.breakers.get(name).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// State of every registered breaker, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers.iter().map(|entry| (entry.key().clone(), entry.value().snapshot())).collect()
    }

    /// Drop every breaker and listener.
    pub fn reset(&self) {
        self.breakers.clear();
        self.listeners.write().clear();
    }
}

static GLOBAL: Lazy<BreakerRegistry> = Lazy::new(BreakerRegistry::new);

/// Process-lifetime registry behind [`get_circuit_breaker`].
///
/// Prefer passing an explicit [`BreakerRegistry`]. Tests that touch the
/// global instance should call [`BreakerRegistry::reset`] during teardown.
pub fn global() -> &'static BreakerRegistry {
    &GLOBAL
}

/// Breaker `name` from the global registry, created with defaults if absent.
pub fn get_circuit_breaker(name: &str) -> CircuitBreaker {
    global().get_or_default(name)
}

/// Snapshot of every breaker in the global registry.
pub fn get_all_circuit_breaker_states() -> BTreeMap<String, BreakerSnapshot> {
    global().snapshot()
}
