//! Per-command statistics: rolling counters, latency percentiles, health
//!
//! One [`CommandMetrics`] exists per command key. Every execution feeds it
//! exactly one terminal event (plus any fallback event) and one latency
//! sample; the circuit breaker reads [`HealthCounts`] from it, and external
//! publishers read the serializable [`MetricsSnapshot`].

mod rolling_number;
mod rolling_percentile;

pub use rolling_number::RollingNumber;
pub use rolling_percentile::RollingPercentile;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::clock::Clock;
use crate::config::MetricsConfig;
use crate::events::EventType;
use crate::keys::CommandKey;

/// Rolling health view the circuit breaker trips on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthCounts {
    /// Requests completed inside the rolling window
    pub total_requests: u64,
    /// Failures, timeouts, and rejections inside the window
    pub error_count: u64,
    /// `error_count` as an integer percentage of `total_requests`
    pub error_percentage: u8,
}

/// Statistics for one command key
pub struct CommandMetrics {
    key: CommandKey,
    counter: RollingNumber,
    latency: RollingPercentile,
    concurrent: AtomicU64,
}

impl CommandMetrics {
    /// Create metrics sized by the command's configuration
    #[must_use]
    pub fn new(key: CommandKey, config: &MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            key,
            counter: RollingNumber::new(
                clock.clone(),
                config.rolling_window,
                config.rolling_buckets,
            ),
            latency: RollingPercentile::new(
                clock,
                config.percentile_window,
                config.percentile_buckets,
                config.percentile_bucket_capacity,
                config.percentile_enabled,
            ),
            concurrent: AtomicU64::new(0),
        }
    }

    /// Record one occurrence of an event
    pub fn record_event(&self, event: EventType) {
        self.counter.increment(event);
    }

    /// Record an event carrying a count (e.g. `COLLAPSED` with the batch size)
    pub fn record_event_with_count(&self, event: EventType, count: u64) {
        self.counter.add(event, count);
    }

    /// Record an execution latency sample
    pub fn record_latency(&self, latency: Duration) {
        self.latency.add_value(latency.as_millis() as u64);
    }

    /// Note an execution starting; feeds the concurrency watermark
    pub(crate) fn execution_started(&self) {
        let active = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
        self.counter.update_max(active);
    }

    /// Note an execution finishing
    pub(crate) fn execution_finished(&self) {
        self.concurrent.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of executions in flight right now
    pub fn current_concurrency(&self) -> u64 {
        self.concurrent.load(Ordering::Acquire)
    }

    /// Highest concurrent-execution watermark inside the rolling window
    pub fn rolling_max_concurrency(&self) -> u64 {
        self.counter.rolling_max()
    }

    /// Rolling count of an event inside the window
    pub fn rolling_count(&self, event: EventType) -> u64 {
        self.counter.rolling_sum(event)
    }

    /// All-time count of an event
    pub fn cumulative_count(&self, event: EventType) -> u64 {
        self.counter.cumulative_sum(event)
    }

    /// Rolling count looked up by event name
    ///
    /// Unknown names (e.g. a publisher built against a newer event set)
    /// degrade to zero with a logged warning rather than failing the caller.
    pub fn rolling_count_named(&self, name: &str) -> u64 {
        match EventType::from_name(name) {
            Some(event) => self.rolling_count(event),
            None => {
                warn!(key = %self.key, event = name, "Unknown event type requested; returning 0");
                0
            }
        }
    }

    /// Latency at percentile `p` (0.0–100.0); `None` when disabled or empty
    pub fn latency_percentile(&self, p: f64) -> Option<u64> {
        self.latency.percentile(p)
    }

    /// Mean latency over the window; `None` when disabled or empty
    pub fn latency_mean(&self) -> Option<u64> {
        self.latency.mean()
    }

    /// Health view over the rolling window
    ///
    /// Errors are failures, timeouts, and rejections; short-circuited
    /// requests are excluded because they never executed.
    pub fn health_counts(&self) -> HealthCounts {
        let mut error_count = 0;
        let mut total_requests = self.counter.rolling_sum(EventType::Success);
        for event in EventType::ALL {
            if event.is_error() {
                let count = self.counter.rolling_sum(event);
                error_count += count;
                total_requests += count;
            }
        }

        let error_percentage = if total_requests == 0 {
            0
        } else {
            ((error_count * 100) / total_requests) as u8
        };

        HealthCounts {
            total_requests,
            error_count,
            error_percentage,
        }
    }

    /// Read-only snapshot for external publishers
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut rolling = BTreeMap::new();
        let mut cumulative = BTreeMap::new();
        for event in EventType::ALL {
            rolling.insert(event.as_str().to_string(), self.rolling_count(event));
            cumulative.insert(event.as_str().to_string(), self.cumulative_count(event));
        }
        let health = self.health_counts();

        MetricsSnapshot {
            key: self.key.name().to_string(),
            rolling,
            cumulative,
            total_requests: health.total_requests,
            error_percentage: health.error_percentage,
            current_concurrency: self.current_concurrency(),
            rolling_max_concurrency: self.rolling_max_concurrency(),
            latency_mean_ms: self.latency_mean(),
            latency_p50_ms: self.latency_percentile(50.0),
            latency_p95_ms: self.latency_percentile(95.0),
            latency_p99_ms: self.latency_percentile(99.0),
        }
    }

    /// Clear the rolling window (cumulative totals survive)
    pub fn reset(&self) {
        self.counter.reset();
        self.latency.reset();
    }
}

/// Snapshot of one command's statistics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Command key
    pub key: String,
    /// Rolling counts by event name
    pub rolling: BTreeMap<String, u64>,
    /// All-time counts by event name
    pub cumulative: BTreeMap<String, u64>,
    /// Requests completed inside the rolling window
    pub total_requests: u64,
    /// Error percentage over the rolling window
    pub error_percentage: u8,
    /// Executions in flight right now
    pub current_concurrency: u64,
    /// Highest concurrency watermark inside the window
    pub rolling_max_concurrency: u64,
    /// Mean latency (milliseconds)
    pub latency_mean_ms: Option<u64>,
    /// 50th percentile latency (milliseconds)
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile latency (milliseconds)
    pub latency_p95_ms: Option<u64>,
    /// 99th percentile latency (milliseconds)
    pub latency_p99_ms: Option<u64>,
}
