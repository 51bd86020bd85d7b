//! Per-key registry of statistics, breakers, gates, and event streams
//!
//! The registry is the owned replacement for process-wide statics: the
//! application creates one, hands it to an [`Executor`](crate::Executor),
//! and controls its lifecycle. Instruments are created on first use of a
//! key and live until [`Registry::reset`].

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::config::{CommandConfig, Config, IsolationStrategy};
use crate::events::{CommandEvent, EventStream, EventType};
use crate::isolation::{PoolGate, PoolSnapshot, SemaphoreGate};
use crate::keys::{CommandKey, GroupKey, PoolKey};
use crate::metrics::{CommandMetrics, MetricsSnapshot};
use crate::request_cache::RequestScope;

/// The isolation gate a command executes behind
pub(crate) enum PrimaryGate {
    /// Bounded worker pool; the action runs on its own task
    Pool(Arc<PoolGate>),
    /// Counting semaphore; the action runs inline
    Semaphore(Arc<SemaphoreGate>),
}

/// Everything the pipeline needs for one command key
pub(crate) struct CommandInstruments {
    pub(crate) key: CommandKey,
    pub(crate) group: GroupKey,
    pub(crate) config: CommandConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<CommandMetrics>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) gate: PrimaryGate,
    pub(crate) fallback_gate: Arc<SemaphoreGate>,
    pub(crate) events: Arc<EventStream>,
}

impl CommandInstruments {
    /// Record and publish a cache hit (no latency sample: nothing executed)
    pub(crate) fn record_cache_hit(&self) {
        self.metrics.record_event(EventType::ResponseFromCache);
        self.publish(vec![EventType::ResponseFromCache], None);
    }

    /// Publish a terminal event record to this key's stream
    pub(crate) fn publish(&self, event_types: Vec<EventType>, latency: Option<Duration>) {
        self.events.publish(CommandEvent {
            key: self.key.name().to_string(),
            group: self.group.name().to_string(),
            event_types,
            latency_ms: latency.map(|d| d.as_millis() as u64),
            timestamp_ms: self.clock.now_millis(),
        });
    }
}

/// Owns all per-key state: metrics, breakers, pools, and event streams
pub struct Registry {
    config: Config,
    clock: Arc<dyn Clock>,
    commands: DashMap<CommandKey, Arc<CommandInstruments>>,
    pools: DashMap<PoolKey, Arc<PoolGate>>,
    streams: DashMap<CommandKey, Arc<EventStream>>,
}

impl Registry {
    /// Create a registry using the wall clock
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a registry with an injected time source (tests)
    #[must_use]
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            commands: DashMap::new(),
            pools: DashMap::new(),
            streams: DashMap::new(),
        }
    }

    /// The configuration this registry resolves commands against
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a request scope for cache participation
    #[must_use]
    pub fn new_scope(&self) -> RequestScope {
        RequestScope::new()
    }

    /// Subscribe to a command key's terminal events
    ///
    /// Works before the key's first execution; slow subscribers lose the
    /// oldest events rather than blocking producers.
    pub fn subscribe(&self, key: &CommandKey) -> broadcast::Receiver<CommandEvent> {
        self.stream(key).subscribe()
    }

    /// Snapshot one command's statistics, if the key has been used
    pub fn metrics_snapshot(&self, key: &CommandKey) -> Option<MetricsSnapshot> {
        self.commands.get(key).map(|i| i.metrics.snapshot())
    }

    /// Snapshot every command's statistics
    pub fn all_metrics_snapshots(&self) -> Vec<MetricsSnapshot> {
        self.commands
            .iter()
            .map(|entry| entry.metrics.snapshot())
            .collect()
    }

    /// Snapshot one pool's state, if the key has been used
    pub fn pool_snapshot(&self, key: &PoolKey) -> Option<PoolSnapshot> {
        self.pools.get(key).map(|pool| pool.snapshot())
    }

    /// Snapshot every pool's state
    pub fn all_pool_snapshots(&self) -> Vec<PoolSnapshot> {
        self.pools.iter().map(|entry| entry.snapshot()).collect()
    }

    /// Current breaker state for a command key, if the key has been used
    pub fn circuit_state(&self, key: &CommandKey) -> Option<CircuitState> {
        self.commands.get(key).map(|i| i.breaker.state())
    }

    /// Drop all per-key statistics, breaker states, pools, and streams
    ///
    /// Instruments rebuild on next use. Event subscribers observe their
    /// stream closing. In-flight commands finish against the old instances.
    pub fn reset(&self) {
        self.commands.clear();
        self.pools.clear();
        self.streams.clear();
        debug!("Registry reset; all per-key state dropped");
    }

    /// Fetch or create the instruments for a command key
    pub(crate) fn instruments(
        &self,
        key: &CommandKey,
        group: &GroupKey,
        pool: &PoolKey,
    ) -> Arc<CommandInstruments> {
        if let Some(existing) = self.commands.get(key) {
            return existing.clone();
        }
        self.commands
            .entry(key.clone())
            .or_insert_with(|| self.build_instruments(key, group, pool))
            .clone()
    }

    fn build_instruments(
        &self,
        key: &CommandKey,
        group: &GroupKey,
        pool: &PoolKey,
    ) -> Arc<CommandInstruments> {
        let config = self.config.command(key.name()).clone();
        let metrics = Arc::new(CommandMetrics::new(
            key.clone(),
            &config.metrics,
            self.clock.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            key.clone(),
            config.circuit_breaker.clone(),
            self.clock.clone(),
            metrics.clone(),
        ));
        let gate = match config.isolation.strategy {
            IsolationStrategy::Pool => PrimaryGate::Pool(self.pool_gate(pool, &config)),
            IsolationStrategy::Semaphore => PrimaryGate::Semaphore(Arc::new(SemaphoreGate::new(
                format!("{key}:execution"),
                config.isolation.semaphore.max_concurrent,
            ))),
        };
        let fallback_gate = Arc::new(SemaphoreGate::new(
            format!("{key}:fallback"),
            config.fallback.max_concurrent,
        ));
        let events = self.stream(key);

        debug!(key = %key, pool = %pool, "Created command instruments");
        Arc::new(CommandInstruments {
            key: key.clone(),
            group: group.clone(),
            config,
            clock: self.clock.clone(),
            metrics,
            breaker,
            gate,
            fallback_gate,
            events,
        })
    }

    fn pool_gate(&self, pool: &PoolKey, config: &CommandConfig) -> Arc<PoolGate> {
        if let Some(existing) = self.pools.get(pool) {
            return existing.clone();
        }
        self.pools
            .entry(pool.clone())
            .or_insert_with(|| {
                Arc::new(PoolGate::new(
                    pool.clone(),
                    config.isolation.pool.clone(),
                    self.clock.clone(),
                    config.metrics.rolling_window,
                    config.metrics.rolling_buckets,
                ))
            })
            .clone()
    }

    fn stream(&self, key: &CommandKey) -> Arc<EventStream> {
        if let Some(existing) = self.streams.get(key) {
            return existing.clone();
        }
        self.streams
            .entry(key.clone())
            .or_insert_with(|| Arc::new(EventStream::new(self.config.events.buffer_size)))
            .clone()
    }
}
