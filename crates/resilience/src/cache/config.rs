//! Cache configuration types
//!
//! A [`TtlPolicy`] gives every entry two lifetimes. Within `fresh_ttl` the
//! entry is served directly. Between `fresh_ttl` and `stale_ttl` it is kept
//! only as a fallback for when recomputation fails. After `stale_ttl` it is
//! evicted.

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Freshness and staleness bounds for one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    fresh_ttl: Duration,
    stale_ttl: Duration,
}

impl TtlPolicy {
    /// Validated policy; `stale_ttl` must be at least `fresh_ttl`.
    pub fn new(fresh_ttl: Duration, stale_ttl: Duration) -> ConfigResult<Self> {
        if stale_ttl < fresh_ttl {
            return Err(ConfigError::invalid(
                "stale_ttl",
                format!("({stale_ttl:?}) must be at least fresh_ttl ({fresh_ttl:?})"),
            ));
        }
        Ok(Self { fresh_ttl, stale_ttl })
    }

    /// Policy whose entries are never served stale.
    pub fn fresh_only(ttl: Duration) -> Self {
        Self { fresh_ttl: ttl, stale_ttl: ttl }
    }

    pub fn fresh_ttl(&self) -> Duration {
        self.fresh_ttl
    }

    pub fn stale_ttl(&self) -> Duration {
        self.stale_ttl
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self { fresh_ttl: Duration::from_secs(60), stale_ttl: Duration::from_secs(600) }
    }
}

/// Configuration for [`GracefulCache`](super::GracefulCache)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConfig {
    /// Policy used by `get_or_compute` and `insert`
    pub default_ttl: TtlPolicy,
    /// Upper bound on stored entries; the oldest-created entry goes first
    pub max_entries: Option<usize>,
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_entries == Some(0) {
            return Err(ConfigError::invalid("max_entries", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`]
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_ttl(mut self, ttl: TtlPolicy) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = Some(max);
        self
    }

    pub fn build(self) -> ConfigResult<CacheConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_policy_requires_stale_at_least_fresh() {
        assert!(TtlPolicy::new(Duration::from_secs(10), Duration::from_secs(60)).is_ok());
        assert!(TtlPolicy::new(Duration::from_secs(10), Duration::from_secs(10)).is_ok());
        assert!(TtlPolicy::new(Duration::from_secs(60), Duration::from_secs(10)).is_err());
    }

    #[test]
    fn test_zero_max_entries_rejected() {
        assert!(CacheConfig::builder().max_entries(0).build().is_err());
        assert_eq!(CacheConfig::builder().max_entries(3).build().unwrap().max_entries, Some(3));
    }
}
