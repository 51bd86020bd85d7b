//! Circuit breaker driven by rolling statistics
//!
//! One instance per command key. The breaker trips open when the rolling
//! request volume and error percentage both cross their thresholds, rejects
//! while open, and after the sleep window grants exactly one trial request:
//! a successful trial closes the circuit, a failed one re-arms the window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::keys::CommandKey;
use crate::metrics::CommandMetrics;

/// Circuit breaker state as exposed to snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the sleep window elapses
    Open,
    /// The sleep window elapsed and a single trial request is in flight
    HalfOpen,
}

/// Per-command circuit breaker
pub struct CircuitBreaker {
    key: CommandKey,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<CommandMetrics>,
    /// Latched once tripped; cleared only by a successful trial
    open: AtomicBool,
    /// When the circuit opened (or the last trial failed), epoch millis
    opened_at_ms: AtomicU64,
    /// Set while the single post-sleep trial request is outstanding
    trial_in_flight: AtomicBool,
}

impl CircuitBreaker {
    /// Create a breaker reading health from the command's metrics
    #[must_use]
    pub fn new(
        key: CommandKey,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<CommandMetrics>,
    ) -> Self {
        Self {
            key,
            config,
            clock,
            metrics,
            open: AtomicBool::new(false),
            opened_at_ms: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a request may proceed
    ///
    /// Evaluated lazily on every call; this is where the circuit trips.
    /// Forced states take precedence over computed state, force-open first.
    pub fn allow_request(&self) -> bool {
        if self.config.force_open {
            return false;
        }
        if self.config.force_closed {
            // Keep evaluating so removing the override exposes computed state
            let _ = self.is_open();
            return true;
        }
        if !self.config.enabled {
            return true;
        }
        if !self.is_open() {
            return true;
        }
        self.allow_single_trial()
    }

    /// Whether the circuit is open (latched or freshly tripped)
    pub fn is_open(&self) -> bool {
        if self.open.load(Ordering::Acquire) {
            return true;
        }

        let health = self.metrics.health_counts();
        if health.total_requests < self.config.request_volume_threshold {
            return false;
        }
        if health.error_percentage < self.config.error_threshold_percentage {
            return false;
        }

        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.opened_at_ms
                .store(self.clock.now_millis(), Ordering::Release);
            warn!(
                key = %self.key,
                requests = health.total_requests,
                error_percentage = health.error_percentage,
                "Circuit breaker opened"
            );
        }
        true
    }

    /// Record that a request completed successfully
    ///
    /// Closes the circuit if it was open (the trial succeeded) and resets the
    /// rolling window so the recovered circuit does not immediately re-trip.
    pub fn mark_success(&self) {
        if self
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.trial_in_flight.store(false, Ordering::Release);
            self.metrics.reset();
            info!(key = %self.key, "Circuit breaker closed after successful trial");
        }
    }

    /// Record that a request failed
    ///
    /// If the failed request was the post-sleep trial, the circuit stays open
    /// and the sleep window restarts from now.
    pub fn mark_non_success(&self) {
        if self.trial_in_flight.swap(false, Ordering::AcqRel) {
            self.opened_at_ms
                .store(self.clock.now_millis(), Ordering::Release);
            debug!(key = %self.key, "Trial request failed; sleep window re-armed");
        }
    }

    /// Current state for snapshots
    pub fn state(&self) -> CircuitState {
        if !self.open.load(Ordering::Acquire) {
            return CircuitState::Closed;
        }
        if self.trial_in_flight.load(Ordering::Acquire) {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Clear all breaker state
    pub fn reset(&self) {
        self.open.store(false, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
        self.opened_at_ms.store(0, Ordering::Release);
    }

    /// Grant the single post-sleep trial to exactly one caller
    fn allow_single_trial(&self) -> bool {
        let now = self.clock.now_millis();
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        if now.saturating_sub(opened_at) < self.config.sleep_window.as_millis() as u64 {
            return false;
        }
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MetricsConfig;
    use crate::events::EventType;
    use std::time::Duration;

    fn setup(config: BreakerConfig) -> (Arc<ManualClock>, Arc<CommandMetrics>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::default());
        let key = CommandKey::new("breaker-test");
        let metrics = Arc::new(CommandMetrics::new(
            key.clone(),
            &MetricsConfig::default(),
            clock.clone(),
        ));
        let breaker = CircuitBreaker::new(key, config, clock.clone(), metrics.clone());
        (clock, metrics, breaker)
    }

    fn feed(metrics: &CommandMetrics, failures: u64, successes: u64) {
        for _ in 0..failures {
            metrics.record_event(EventType::Failure);
        }
        for _ in 0..successes {
            metrics.record_event(EventType::Success);
        }
    }

    fn config(volume: u64, error_pct: u8, sleep: Duration) -> BreakerConfig {
        BreakerConfig {
            request_volume_threshold: volume,
            error_threshold_percentage: error_pct,
            sleep_window: sleep,
            ..BreakerConfig::default()
        }
    }

    #[test]
    fn test_stays_closed_below_volume_threshold() {
        let (_clock, metrics, breaker) = setup(config(10, 50, Duration::from_secs(5)));

        // 100% errors but under the volume minimum
        feed(&metrics, 9, 0);
        assert!(breaker.allow_request());
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_stays_closed_below_error_threshold() {
        let (_clock, metrics, breaker) = setup(config(10, 50, Duration::from_secs(5)));

        feed(&metrics, 4, 6);
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_at_both_thresholds() {
        let (_clock, metrics, breaker) = setup(config(10, 50, Duration::from_secs(5)));

        feed(&metrics, 6, 4);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_single_trial_after_sleep_window() {
        let (clock, metrics, breaker) = setup(config(10, 50, Duration::from_secs(5)));

        feed(&metrics, 6, 4);
        assert!(!breaker.allow_request());

        // Still inside the sleep window
        clock.advance(Duration::from_secs(4));
        assert!(!breaker.allow_request());

        // Window elapsed: exactly one trial is granted
        clock.advance(Duration::from_secs(2));
        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_successful_trial_closes_and_resets() {
        let (clock, metrics, breaker) = setup(config(10, 50, Duration::from_secs(5)));

        feed(&metrics, 6, 4);
        assert!(!breaker.allow_request());

        clock.advance(Duration::from_secs(6));
        assert!(breaker.allow_request());
        breaker.mark_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
        // Window was reset so the old failures cannot re-trip the circuit
        assert_eq!(metrics.rolling_count(EventType::Failure), 0);
    }

    #[test]
    fn test_failed_trial_rearms_sleep_window() {
        let (clock, metrics, breaker) = setup(config(10, 50, Duration::from_secs(5)));

        feed(&metrics, 6, 4);
        assert!(!breaker.allow_request());

        clock.advance(Duration::from_secs(6));
        assert!(breaker.allow_request());
        breaker.mark_non_success();

        // Re-armed from the failure time: rejected again for a full window
        assert!(!breaker.allow_request());
        clock.advance(Duration::from_secs(4));
        assert!(!breaker.allow_request());
        clock.advance(Duration::from_secs(2));
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_force_open_rejects_everything() {
        let mut cfg = config(10, 50, Duration::from_secs(5));
        cfg.force_open = true;
        let (_clock, _metrics, breaker) = setup(cfg);

        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_force_closed_allows_despite_statistics() {
        let mut cfg = config(10, 50, Duration::from_secs(5));
        cfg.force_closed = true;
        let (_clock, metrics, breaker) = setup(cfg);

        feed(&metrics, 20, 0);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_force_open_wins_over_force_closed() {
        let mut cfg = config(10, 50, Duration::from_secs(5));
        cfg.force_open = true;
        cfg.force_closed = true;
        let (_clock, _metrics, breaker) = setup(cfg);

        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_disabled_breaker_never_opens() {
        let mut cfg = config(10, 50, Duration::from_secs(5));
        cfg.enabled = false;
        let (_clock, metrics, breaker) = setup(cfg);

        feed(&metrics, 100, 0);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_concurrent_trial_requests_get_one_grant() {
        let (clock, metrics, breaker) = setup(config(10, 50, Duration::from_secs(5)));
        feed(&metrics, 10, 0);
        assert!(!breaker.allow_request());
        clock.advance(Duration::from_secs(6));

        let breaker = Arc::new(breaker);
        let granted: Vec<bool> = {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let breaker = breaker.clone();
                    std::thread::spawn(move || breaker.allow_request())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        };

        assert_eq!(granted.iter().filter(|g| **g).count(), 1);
    }
}
