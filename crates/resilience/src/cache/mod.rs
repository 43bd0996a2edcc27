//! Graceful-degradation cache
//!
//! [`GracefulCache`] answers from fresh entries, recomputes otherwise, and
//! when recomputation fails serves the last good value for as long as its
//! staleness ceiling allows. Typical use is wrapping a price feed or an
//! exchange call whose latest value is better than an error.

mod config;
mod core;
mod stats;

pub use config::{CacheConfig, CacheConfigBuilder, TtlPolicy};
pub use self::core::{Cached, Freshness, GracefulCache};
pub use stats::CacheStats;
