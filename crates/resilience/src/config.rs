//! Toolkit configuration
//!
//! [`ToolkitConfig`] is the serde view of every component's settings, one
//! section per component. Durations are written in milliseconds.
//!
//! ## Loading
//! 1. [`load_from_file`] reads TOML or JSON, chosen by file extension
//! 2. [`load_from_env`] overlays `STEADFAST_*` variables on a base config
//! 3. [`load`] probes `./steadfast.toml` then `./steadfast.json`, falls back
//!    to defaults, then applies the environment
//!
//! ## Environment Variables
//! - `STEADFAST_RETRY_MAX_ATTEMPTS`, `STEADFAST_RETRY_BASE_DELAY_MS`,
//!   `STEADFAST_RETRY_MAX_DELAY_MS`
//! - `STEADFAST_BREAKER_FAILURE_THRESHOLD`,
//!   `STEADFAST_BREAKER_RECOVERY_TIMEOUT_MS`
//! - `STEADFAST_RATE_LIMIT_MAX_CALLS`, `STEADFAST_RATE_LIMIT_WINDOW_MS`
//! - `STEADFAST_BULKHEAD_CAPACITY`
//! - `STEADFAST_CACHE_FRESH_TTL_MS`, `STEADFAST_CACHE_STALE_TTL_MS`
//! - `STEADFAST_ALERT_THROTTLE_MS`, `STEADFAST_ALERT_WEBHOOK_URL`
//! - `STEADFAST_METRICS_PATH`
//! - `STEADFAST_LOG_FORMAT` (`pretty` or `json`), `STEADFAST_LOG_LEVEL`
//!
//! Sections are checked by [`ToolkitConfig::validate`], which returns the
//! runtime configs the components are constructed from.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::alerts::{AlertError, AlertLevel, AlertManager, FileAlertHandler};
use crate::bulkhead::Bulkhead;
use crate::cache::{CacheConfig, TtlPolicy};
use crate::circuit_breaker::{CircuitBreakerConfig, TrackedFailures};
use crate::error::{ConfigError, ConfigResult, FailureKind};
use crate::metrics::MetricsStore;
use crate::observability::LogFormat;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryConfig;

/// File names probed by [`load`], in order.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["steadfast.toml", "steadfast.json"];

/// Serde helper storing a `Duration` as integer milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    /// Same encoding for `Option<Duration>`; absent or null means `None`.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// Complete toolkit configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    pub retry: RetrySettings,
    pub circuit_breaker: BreakerSettings,
    pub rate_limiter: RateLimiterSettings,
    pub bulkhead: BulkheadSettings,
    pub cache: CacheSettings,
    pub alerts: AlertSettings,
    pub metrics: MetricsSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
    #[serde(with = "duration_millis::option", skip_serializing_if = "Option::is_none")]
    pub attempt_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub retry_on_timeout: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            max_delay: defaults.max_delay,
            multiplier: defaults.multiplier,
            jitter_fraction: defaults.jitter_fraction,
            attempt_timeout: defaults.attempt_timeout,
            seed: defaults.seed,
            retry_on_timeout: defaults.retry_on_timeout,
        }
    }
}

impl RetrySettings {
    pub fn to_config(&self) -> ConfigResult<RetryConfig> {
        let mut builder = RetryConfig::builder()
            .max_attempts(self.max_attempts)
            .base_delay(self.base_delay)
            .max_delay(self.max_delay)
            .multiplier(self.multiplier)
            .jitter_fraction(self.jitter_fraction)
            .seed_opt(self.seed)
            .retry_on_timeout(self.retry_on_timeout);
        if let Some(timeout) = self.attempt_timeout {
            builder = builder.attempt_timeout(timeout);
        }
        builder.build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
    /// Failure kinds that count toward opening; absent means the default set,
    /// an empty list is rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracked_failures: Option<Vec<FailureKind>>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            recovery_timeout: defaults.recovery_timeout,
            tracked_failures: None,
        }
    }
}

impl BreakerSettings {
    pub fn to_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        let tracked = match &self.tracked_failures {
            Some(kinds) => TrackedFailures::kinds(kinds.iter().copied()),
            None => TrackedFailures::default(),
        };
        CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .success_threshold(self.success_threshold)
            .recovery_timeout(self.recovery_timeout)
            .tracked_failures(tracked)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub max_calls: usize,
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self { max_calls: 10, window: Duration::from_secs(1) }
    }
}

impl RateLimiterSettings {
    pub fn build(&self) -> ConfigResult<RateLimiter> {
        RateLimiter::new(self.max_calls, self.window)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadSettings {
    pub capacity: usize,
    /// Zero rejects immediately when full
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        Self { capacity: 10, acquire_timeout: Duration::ZERO }
    }
}

impl BulkheadSettings {
    pub fn build(&self) -> ConfigResult<Bulkhead> {
        Bulkhead::with_acquire_timeout(self.capacity, self.acquire_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    #[serde(with = "duration_millis")]
    pub fresh_ttl: Duration,
    #[serde(with = "duration_millis")]
    pub stale_ttl: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let ttl = TtlPolicy::default();
        Self { fresh_ttl: ttl.fresh_ttl(), stale_ttl: ttl.stale_ttl(), max_entries: None }
    }
}

impl CacheSettings {
    pub fn to_config(&self) -> ConfigResult<CacheConfig> {
        let mut builder =
            CacheConfig::builder().default_ttl(TtlPolicy::new(self.fresh_ttl, self.stale_ttl)?);
        if let Some(max) = self.max_entries {
            builder = builder.max_entries(max);
        }
        builder.build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    #[serde(with = "duration_millis")]
    pub throttle_window: Duration,
    pub min_level: AlertLevel,
    /// JSON-lines alert log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            throttle_window: Duration::from_secs(300),
            min_level: AlertLevel::Info,
            file: None,
            webhook_url: None,
        }
    }
}

impl AlertSettings {
    /// Build a manager with the configured file and webhook handlers attached.
    pub fn build(&self) -> Result<AlertManager, AlertError> {
        let manager = AlertManager::new(self.throttle_window).with_min_level(self.min_level);
        if let Some(path) = &self.file {
            manager.add_handler(Arc::new(FileAlertHandler::open(path)?));
        }
        if let Some(url) = &self.webhook_url {
            #[cfg(feature = "webhook")]
            manager.add_handler(Arc::new(crate::alerts::WebhookAlertHandler::new(url.clone())?));
            #[cfg(not(feature = "webhook"))]
            tracing::warn!(url = %url, "webhook alerts configured but the webhook feature is disabled");
        }
        Ok(manager)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// JSON-lines outcome log; unset disables persistence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl MetricsSettings {
    pub fn open(&self) -> std::io::Result<Option<MetricsStore>> {
        self.path.as_ref().map(MetricsStore::open).transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { format: LogFormat::Pretty, level: "info".to_string() }
    }
}

/// Validated runtime configs produced by [`ToolkitConfig::validate`]
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    pub rate_limiter: RateLimiterSettings,
    pub bulkhead: BulkheadSettings,
}

impl ToolkitConfig {
    /// Check every section, returning the first problem found.
    pub fn validate(&self) -> ConfigResult<RuntimeConfig> {
        let retry = self.retry.to_config()?;
        let circuit_breaker = self.circuit_breaker.to_config()?;
        let cache = self.cache.to_config()?;
        self.rate_limiter.build()?;
        self.bulkhead.build()?;
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level", "must not be empty"));
        }
        Ok(RuntimeConfig {
            retry,
            circuit_breaker,
            cache,
            rate_limiter: self.rate_limiter.clone(),
            bulkhead: self.bulkhead.clone(),
        })
    }
}

/// Load configuration from `./steadfast.toml` or `./steadfast.json` when
/// present, otherwise defaults, then apply `STEADFAST_*` overrides.
pub fn load() -> ConfigResult<ToolkitConfig> {
    let base = match probe_config_paths() {
        Some(path) => load_from_file(path)?,
        None => {
            debug!("no configuration file found, using defaults");
            ToolkitConfig::default()
        }
    };
    load_from_env(base)
}

/// First existing file among [`CONFIG_FILE_NAMES`] in the working directory.
pub fn probe_config_paths() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    CONFIG_FILE_NAMES.iter().map(|name| cwd.join(name)).find(|path| path.is_file())
}

/// Load configuration from a TOML or JSON file.
///
/// # Errors
/// Returns `ConfigError::Load` when the file cannot be read or has an
/// unsupported extension, and `ConfigError::Parse` when it is malformed.
pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<ToolkitConfig> {
    let path = path.as_ref();
    info!(path = %path.display(), "loading configuration");
    let contents = std::fs::read_to_string(path).map_err(|err| ConfigError::Load {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> ConfigResult<ToolkitConfig> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(contents)
            .map_err(|err| ConfigError::Parse { format: "TOML", message: err.to_string() }),
        Some("json") => serde_json::from_str(contents)
            .map_err(|err| ConfigError::Parse { format: "JSON", message: err.to_string() }),
        other => Err(ConfigError::Load {
            path: path.display().to_string(),
            message: format!("unsupported config format: {}", other.unwrap_or("<none>")),
        }),
    }
}

/// Overlay `STEADFAST_*` environment variables on `base`.
pub fn load_from_env(base: ToolkitConfig) -> ConfigResult<ToolkitConfig> {
    apply_overrides(base, |key| std::env::var(key).ok())
}

fn apply_overrides<L>(mut config: ToolkitConfig, lookup: L) -> ConfigResult<ToolkitConfig>
where
    L: Fn(&str) -> Option<String>,
{
    let env = Overrides { lookup };

    if let Some(v) = env.parse("STEADFAST_RETRY_MAX_ATTEMPTS")? {
        config.retry.max_attempts = v;
    }
    if let Some(v) = env.millis("STEADFAST_RETRY_BASE_DELAY_MS")? {
        config.retry.base_delay = v;
    }
    if let Some(v) = env.millis("STEADFAST_RETRY_MAX_DELAY_MS")? {
        config.retry.max_delay = v;
    }
    if let Some(v) = env.parse("STEADFAST_BREAKER_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = v;
    }
    if let Some(v) = env.millis("STEADFAST_BREAKER_RECOVERY_TIMEOUT_MS")? {
        config.circuit_breaker.recovery_timeout = v;
    }
    if let Some(v) = env.parse("STEADFAST_RATE_LIMIT_MAX_CALLS")? {
        config.rate_limiter.max_calls = v;
    }
    if let Some(v) = env.millis("STEADFAST_RATE_LIMIT_WINDOW_MS")? {
        config.rate_limiter.window = v;
    }
    if let Some(v) = env.parse("STEADFAST_BULKHEAD_CAPACITY")? {
        config.bulkhead.capacity = v;
    }
    if let Some(v) = env.millis("STEADFAST_CACHE_FRESH_TTL_MS")? {
        config.cache.fresh_ttl = v;
    }
    if let Some(v) = env.millis("STEADFAST_CACHE_STALE_TTL_MS")? {
        config.cache.stale_ttl = v;
    }
    if let Some(v) = env.millis("STEADFAST_ALERT_THROTTLE_MS")? {
        config.alerts.throttle_window = v;
    }
    if let Some(v) = env.raw("STEADFAST_ALERT_WEBHOOK_URL") {
        config.alerts.webhook_url = Some(v);
    }
    if let Some(v) = env.raw("STEADFAST_METRICS_PATH") {
        config.metrics.path = Some(PathBuf::from(v));
    }
    if let Some(v) = env.parse("STEADFAST_LOG_FORMAT")? {
        config.logging.format = v;
    }
    if let Some(v) = env.raw("STEADFAST_LOG_LEVEL") {
        config.logging.level = v;
    }
    Ok(config)
}

struct Overrides<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> Overrides<L> {
    fn raw(&self, key: &'static str) -> Option<String> {
        (self.lookup)(key).map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, key: &'static str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(key)
            .map(|value| {
                debug!(key, value = %value, "configuration override from environment");
                value.parse::<T>().map_err(|err| {
                    ConfigError::invalid(key, format!("could not parse '{value}': {err}"))
                })
            })
            .transpose()
    }

    fn millis(&self, key: &'static str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}
