//! Configuration management
//!
//! Per-command settings resolve through a two-level table: the `defaults`
//! block applies to every command, and entries under `commands` override it
//! for a specific command key. Collapsers have their own table.

use std::{collections::HashMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings applied to commands without a dedicated entry
    pub defaults: CommandConfig,
    /// Per-command overrides, keyed by command key name
    pub commands: HashMap<String, CommandConfig>,
    /// Per-collapser settings, keyed by collapser key name
    pub collapsers: HashMap<String, CollapserConfig>,
    /// Event stream configuration
    pub events: EventsConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (SHUNT_ prefix)
        figment = figment.merge(Env::prefixed("SHUNT_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective configuration for a command key
    #[must_use]
    pub fn command(&self, key: &str) -> &CommandConfig {
        self.commands.get(key).unwrap_or(&self.defaults)
    }

    /// Resolve the effective configuration for a collapser key
    #[must_use]
    pub fn collapser(&self, key: &str) -> CollapserConfig {
        self.collapsers.get(key).cloned().unwrap_or_default()
    }

    /// Validate all command and collapser entries
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending entry.
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate("defaults")?;
        for (key, command) in &self.commands {
            command.validate(key)?;
        }
        for (key, collapser) in &self.collapsers {
            collapser.validate(key)?;
        }
        if self.events.buffer_size == 0 {
            return Err(Error::Config(
                "events.buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for one command key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Execution timeout
    pub timeout: TimeoutConfig,
    /// Bulkhead strategy and sizing
    pub isolation: IsolationConfig,
    /// Circuit breaker thresholds
    pub circuit_breaker: BreakerConfig,
    /// Fallback gating
    pub fallback: FallbackConfig,
    /// Rolling statistics sizing
    pub metrics: MetricsConfig,
    /// Request cache participation
    pub cache: CacheConfig,
}

impl CommandConfig {
    fn validate(&self, key: &str) -> Result<()> {
        if self.timeout.enabled && self.timeout.duration.is_zero() {
            return Err(Error::Config(format!(
                "{key}: timeout.duration must be nonzero when enabled"
            )));
        }
        self.isolation.validate(key)?;
        self.circuit_breaker.validate(key)?;
        self.metrics.validate(key)?;
        if self.fallback.max_concurrent == 0 {
            return Err(Error::Config(format!(
                "{key}: fallback.max_concurrent must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Execution timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Enforce the timeout
    pub enabled: bool,
    /// How long the action may run before it is abandoned
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration: Duration::from_secs(1),
        }
    }
}

/// Bulkhead strategy selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// Bounded worker pool with a bounded queue; the action runs on its own task
    #[default]
    Pool,
    /// Counting semaphore; the action runs inline on the caller's task
    Semaphore,
}

/// Bulkhead configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Which strategy gates this command
    pub strategy: IsolationStrategy,
    /// Pool sizing (used when `strategy` is `pool`)
    pub pool: PoolConfig,
    /// Semaphore sizing (used when `strategy` is `semaphore`)
    pub semaphore: SemaphoreConfig,
}

impl IsolationConfig {
    fn validate(&self, key: &str) -> Result<()> {
        if self.pool.core_size == 0 {
            return Err(Error::Config(format!(
                "{key}: isolation.pool.core_size must be at least 1"
            )));
        }
        if self.pool.max_size < self.pool.core_size {
            return Err(Error::Config(format!(
                "{key}: isolation.pool.max_size must be >= core_size"
            )));
        }
        if self.semaphore.max_concurrent == 0 {
            return Err(Error::Config(format!(
                "{key}: isolation.semaphore.max_concurrent must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Steady-state worker count
    pub core_size: usize,
    /// Upper bound on concurrent executions
    pub max_size: usize,
    /// Slots for acquisitions waiting on a busy pool; 0 disables queueing
    pub queue_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 10,
            max_size: 10,
            queue_size: 5,
        }
    }
}

/// Semaphore sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaphoreConfig {
    /// Maximum concurrent executions
    pub max_concurrent: usize,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Enable the breaker
    pub enabled: bool,
    /// Minimum rolling request volume before the breaker may trip
    pub request_volume_threshold: u64,
    /// Rolling error percentage (0-100) at or above which the breaker trips
    pub error_threshold_percentage: u8,
    /// How long an open circuit rejects before granting a trial request
    #[serde(with = "humantime_serde")]
    pub sleep_window: Duration,
    /// Reject every request regardless of statistics (takes precedence)
    pub force_open: bool,
    /// Allow every request regardless of statistics
    pub force_closed: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            request_volume_threshold: 20,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_secs(5),
            force_open: false,
            force_closed: false,
        }
    }
}

impl BreakerConfig {
    fn validate(&self, key: &str) -> Result<()> {
        if self.error_threshold_percentage > 100 {
            return Err(Error::Config(format!(
                "{key}: circuit_breaker.error_threshold_percentage must be 0-100"
            )));
        }
        if self.enabled && self.sleep_window.is_zero() {
            return Err(Error::Config(format!(
                "{key}: circuit_breaker.sleep_window must be nonzero"
            )));
        }
        Ok(())
    }
}

/// Fallback gating configuration
///
/// Fallbacks run behind their own semaphore so a flood of fallbacks cannot
/// exhaust the primary gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Attempt the fallback on failure
    pub enabled: bool,
    /// Maximum concurrent fallback executions
    pub max_concurrent: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 10,
        }
    }
}

/// Rolling statistics sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Span of the rolling counter window
    #[serde(with = "humantime_serde")]
    pub rolling_window: Duration,
    /// Number of buckets the counter window is divided into
    pub rolling_buckets: usize,
    /// Track latency percentiles
    pub percentile_enabled: bool,
    /// Span of the latency percentile window
    #[serde(with = "humantime_serde")]
    pub percentile_window: Duration,
    /// Number of buckets the percentile window is divided into
    pub percentile_buckets: usize,
    /// Latency samples retained per bucket; further samples are dropped
    pub percentile_bucket_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            percentile_enabled: true,
            percentile_window: Duration::from_secs(60),
            percentile_buckets: 6,
            percentile_bucket_capacity: 100,
        }
    }
}

impl MetricsConfig {
    fn validate(&self, key: &str) -> Result<()> {
        Self::check_window(key, "rolling", self.rolling_window, self.rolling_buckets)?;
        if self.percentile_enabled {
            Self::check_window(
                key,
                "percentile",
                self.percentile_window,
                self.percentile_buckets,
            )?;
            if self.percentile_bucket_capacity == 0 {
                return Err(Error::Config(format!(
                    "{key}: metrics.percentile_bucket_capacity must be at least 1"
                )));
            }
        }
        Ok(())
    }

    fn check_window(key: &str, which: &str, window: Duration, buckets: usize) -> Result<()> {
        if buckets == 0 {
            return Err(Error::Config(format!(
                "{key}: metrics.{which}_buckets must be at least 1"
            )));
        }
        let window_ms = window.as_millis() as u64;
        if window_ms == 0 || window_ms % buckets as u64 != 0 {
            return Err(Error::Config(format!(
                "{key}: metrics.{which}_window must divide evenly into {buckets} buckets"
            )));
        }
        Ok(())
    }
}

/// Request cache participation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Deduplicate same-key calls within a request scope
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Settings for one collapser key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollapserConfig {
    /// How long the first request in an empty window waits for companions
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Seal the batch early once this many requests joined; 0 = unbounded
    pub max_batch_size: usize,
}

impl Default for CollapserConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(10),
            max_batch_size: 0,
        }
    }
}

impl CollapserConfig {
    fn validate(&self, key: &str) -> Result<()> {
        if self.window.is_zero() {
            return Err(Error::Config(format!(
                "{key}: collapser window must be nonzero"
            )));
        }
        Ok(())
    }
}

/// Event stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Undelivered events retained per subscriber before the oldest are dropped
    pub buffer_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { buffer_size: 100 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_command_lookup_falls_back_to_defaults() {
        let mut config = Config::default();
        let mut custom = CommandConfig::default();
        custom.timeout.duration = Duration::from_secs(3);
        config.commands.insert("slow".to_string(), custom);

        assert_eq!(
            config.command("slow").timeout.duration,
            Duration::from_secs(3)
        );
        assert_eq!(
            config.command("other").timeout.duration,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_window_must_divide_into_buckets() {
        let mut config = Config::default();
        config.defaults.metrics.rolling_window = Duration::from_millis(1001);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("divide evenly"));
    }

    #[test]
    fn test_pool_sizing_rules() {
        let mut config = Config::default();
        config.defaults.isolation.pool.max_size = 2;
        config.defaults.isolation.pool.core_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_error_percentage_bounds() {
        let mut config = Config::default();
        config.defaults.circuit_breaker.error_threshold_percentage = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&yaml).unwrap();
        assert_eq!(
            parsed.defaults.circuit_breaker.request_volume_threshold,
            20
        );
        assert_eq!(parsed.events.buffer_size, 100);
    }
}
