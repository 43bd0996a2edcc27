//! Stale-on-failure cache

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::config::{CacheConfig, TtlPolicy};
use super::stats::{CacheStats, StatsCollector};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigResult;

/// How a value returned by a `lookup_*` call was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Freshness {
    /// Served from a fresh entry without computing
    Fresh,
    /// Produced by the compute function just now
    Computed,
    /// Served past its freshness because compute failed
    Stale,
}

/// A value tagged with its [`Freshness`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<V> {
    pub value: V,
    pub freshness: Freshness,
}

impl<V> Cached<V> {
    pub fn is_degraded(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Fresh,
    Stale,
    Expired,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: TtlPolicy,
    /// Creation sequence number, key into `Store::order`
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn stage(&self, now: Instant) -> Stage {
        let age = now.saturating_duration_since(self.created_at);
        if age < self.ttl.fresh_ttl() {
            Stage::Fresh
        } else if age < self.ttl.stale_ttl() {
            Stage::Stale
        } else {
            Stage::Expired
        }
    }
}

#[derive(Debug)]
struct Store<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Creation order for `max_entries` eviction
    order: BTreeMap<u64, K>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V> Store<K, V> {
    fn new() -> Self {
        Self { entries: HashMap::new(), order: BTreeMap::new(), next_seq: 0 }
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

/// Cache that falls back to stale values when recomputation fails.
///
/// `compute` always runs without the cache lock held, so concurrent callers
/// for the same key may each compute; the last successful result wins.
///
/// # Example
/// ```
/// use std::time::Duration;
///
/// use steadfast_resilience::cache::{CacheConfig, GracefulCache, TtlPolicy};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ttl = TtlPolicy::new(Duration::from_secs(10), Duration::from_secs(60))?;
/// let cache: GracefulCache<String, f64> =
///     GracefulCache::new(CacheConfig::builder().default_ttl(ttl).build()?)?;
///
/// let price = cache.get_or_compute("BTC-USD".to_string(), || Ok::<_, std::io::Error>(64_000.0))?;
/// # Ok(())
/// # }
/// ```
pub struct GracefulCache<K, V, C = SystemClock>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock,
{
    store: Arc<Mutex<Store<K, V>>>,
    config: CacheConfig,
    stats: Arc<StatsCollector>,
    clock: C,
}

impl<K, V> GracefulCache<K, V, SystemClock>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: CacheConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<K, V, C> GracefulCache<K, V, C>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock,
{
    /// Create a cache with a custom clock (useful for testing)
    pub fn with_clock(config: CacheConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(Mutex::new(Store::new())),
            config,
            stats: Arc::new(StatsCollector::default()),
            clock,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the fresh value for `key`, or compute it under the default
    /// policy, falling back to a stale value if `compute` fails.
    pub fn get_or_compute<F, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: fmt::Display,
    {
        self.lookup_with(key, self.config.default_ttl, compute).map(Cached::into_value)
    }

    /// [`GracefulCache::get_or_compute`] with an explicit policy.
    pub fn get_or_compute_with<F, E>(&self, key: K, ttl: TtlPolicy, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: fmt::Display,
    {
        self.lookup_with(key, ttl, compute).map(Cached::into_value)
    }

    /// Like [`GracefulCache::get_or_compute`], reporting how the value was
    /// obtained.
    pub fn lookup<F, E>(&self, key: K, compute: F) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: fmt::Display,
    {
        self.lookup_with(key, self.config.default_ttl, compute)
    }

    pub fn lookup_with<F, E>(&self, key: K, ttl: TtlPolicy, compute: F) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
        E: fmt::Display,
    {
        if let Some(value) = self.fresh(&key) {
            return Ok(Cached { value, freshness: Freshness::Fresh });
        }
        let computed = compute();
        self.settle(key, ttl, computed)
    }

    /// Async form of [`GracefulCache::get_or_compute`].
    pub async fn get_or_compute_async<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: fmt::Display,
    {
        self.lookup_with_async(key, self.config.default_ttl, compute).await.map(Cached::into_value)
    }

    /// Async form of [`GracefulCache::get_or_compute_with`].
    pub async fn get_or_compute_with_async<F, Fut, E>(
        &self,
        key: K,
        ttl: TtlPolicy,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: fmt::Display,
    {
        self.lookup_with_async(key, ttl, compute).await.map(Cached::into_value)
    }

    pub async fn lookup_async<F, Fut, E>(&self, key: K, compute: F) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: fmt::Display,
    {
        self.lookup_with_async(key, self.config.default_ttl, compute).await
    }

    pub async fn lookup_with_async<F, Fut, E>(
        &self,
        key: K,
        ttl: TtlPolicy,
        compute: F,
    ) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: fmt::Display,
    {
        if let Some(value) = self.fresh(&key) {
            return Ok(Cached { value, freshness: Freshness::Fresh });
        }
        let computed = compute().await;
        self.settle(key, ttl, computed)
    }

    /// Store `value` under the default policy.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with(key, value, self.config.default_ttl);
    }

    pub fn insert_with(&self, key: K, value: V, ttl: TtlPolicy) {
        let mut store = self.store.lock();
        self.store_locked(&mut store, key, value, ttl);
    }

    /// Servable value for `key` (fresh or stale) without computing.
    pub fn peek(&self, key: &K) -> Option<Cached<V>> {
        let store = self.store.lock();
        let entry = store.entries.get(key)?;
        let freshness = match entry.stage(self.clock.now()) {
            Stage::Fresh => Freshness::Fresh,
            Stage::Stale => Freshness::Stale,
            Stage::Expired => return None,
        };
        Some(Cached { value: entry.value.clone(), freshness })
    }

    /// Drop `key`; returns whether an entry existed.
    pub fn invalidate(&self, key: &K) -> bool {
        self.store.lock().remove(key).is_some()
    }

    /// Drop every entry past its staleness ceiling; returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut store = self.store.lock();
        let expired: Vec<K> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.stage(now) == Stage::Expired)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            store.remove(key);
        }
        drop(store);
        self.stats.record_expirations(expired.len());
        if !expired.is_empty() {
            debug!(count = expired.len(), "purged expired cache entries");
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.entries.clear();
        store.order.clear();
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        self.stats.snapshot(size, self.config.max_entries)
    }

    /// Fresh value for `key`, evicting it if expired.
    fn fresh(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut store = self.store.lock();
        let stage = store.entries.get(key).map(|entry| entry.stage(now));
        match stage {
            Some(Stage::Fresh) => {
                self.stats.record_hit();
                return store.entries.get(key).map(|entry| entry.value.clone());
            }
            Some(Stage::Expired) => {
                store.remove(key);
                self.stats.record_expirations(1);
            }
            Some(Stage::Stale) | None => {}
        }
        self.stats.record_miss();
        None
    }

    /// Store a successful compute, or fall back to whatever is still
    /// servable for `key`.
    fn settle<E>(&self, key: K, ttl: TtlPolicy, computed: Result<V, E>) -> Result<Cached<V>, E>
    where
        E: fmt::Display,
    {
        let err = match computed {
            Ok(value) => {
                self.stats.record_compute();
                let mut store = self.store.lock();
                self.store_locked(&mut store, key, value.clone(), ttl);
                return Ok(Cached { value, freshness: Freshness::Computed });
            }
            Err(err) => err,
        };

        let now = self.clock.now();
        let mut store = self.store.lock();
        let stage = store.entries.get(&key).map(|entry| entry.stage(now));
        let freshness = match stage {
            Some(Stage::Fresh) => Freshness::Fresh,
            Some(Stage::Stale) => Freshness::Stale,
            Some(Stage::Expired) => {
                store.remove(&key);
                self.stats.record_expirations(1);
                return Err(err);
            }
            None => return Err(err),
        };
        let value = match store.entries.get(&key) {
            Some(entry) => entry.value.clone(),
            None => return Err(err),
        };
        drop(store);

        if freshness == Freshness::Stale {
            self.stats.record_stale_served();
            warn!(error = %err, "compute failed, serving stale cache entry");
        }
        Ok(Cached { value, freshness })
    }

    fn store_locked(&self, store: &mut Store<K, V>, key: K, value: V, ttl: TtlPolicy) {
        store.remove(&key);
        if let Some(max) = self.config.max_entries {
            while store.entries.len() >= max {
                let Some((_, oldest)) = store.order.pop_first() else { break };
                store.entries.remove(&oldest);
                self.stats.record_eviction();
            }
        }
        let seq = store.next_seq;
        store.next_seq += 1;
        store.order.insert(seq, key.clone());
        store.entries.insert(key, CacheEntry { value, created_at: self.clock.now(), ttl, seq });
    }
}

impl<K, V, C> Clone for GracefulCache<K, V, C>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
            clock: self.clock.clone(),
        }
    }
}

impl<K, V, C> fmt::Debug for GracefulCache<K, V, C>
where
    K: Eq + Hash + Clone,
    V: Clone,
    C: Clock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GracefulCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish()
    }
}
