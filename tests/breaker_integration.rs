//! Circuit breaker integration tests - full pipeline scenarios

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use shunt::{
    CircuitState, Command, CommandKey, Config, Error, EventType, Executor, ManualClock, Registry,
    Result,
};

struct FlakyCall {
    key: &'static str,
    succeed: bool,
}

#[async_trait]
impl Command for FlakyCall {
    type Output = &'static str;

    fn key(&self) -> CommandKey {
        CommandKey::new(self.key)
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<&'static str> {
        if self.succeed {
            Ok("ok")
        } else {
            Err(Error::execution(self.key, "dependency down"))
        }
    }
}

fn breaker_setup(key: &str) -> (Arc<ManualClock>, Arc<Registry>, Executor) {
    let mut config = Config::default();
    let mut command = shunt::CommandConfig::default();
    command.circuit_breaker.request_volume_threshold = 10;
    command.circuit_breaker.error_threshold_percentage = 50;
    command.circuit_breaker.sleep_window = Duration::from_secs(5);
    command.metrics.rolling_window = Duration::from_secs(10);
    config.commands.insert(key.to_string(), command);

    let clock = Arc::new(ManualClock::default());
    let registry = Arc::new(Registry::with_clock(config, clock.clone()));
    let executor = Executor::new(registry.clone());
    (clock, registry, executor)
}

#[tokio::test]
async fn test_breaker_opens_after_error_volume() {
    let key = "breaker-opens";
    let (_clock, registry, executor) = breaker_setup(key);

    // 6 failures + 4 successes inside the window: 60% errors over 10 requests
    for _ in 0..6 {
        let result = executor.execute(FlakyCall { key, succeed: false }).await;
        assert!(matches!(result.unwrap_err().original(), Error::Execution { .. }));
    }
    for _ in 0..4 {
        assert_eq!(
            executor.execute(FlakyCall { key, succeed: true }).await.unwrap(),
            "ok"
        );
    }

    // Next call short-circuits without executing
    let rejected = executor.execute(FlakyCall { key, succeed: true }).await;
    assert!(matches!(
        rejected.unwrap_err().original(),
        Error::ShortCircuited { .. }
    ));

    let command_key = CommandKey::new(key);
    assert_eq!(registry.circuit_state(&command_key), Some(CircuitState::Open));
    let snapshot = registry.metrics_snapshot(&command_key).unwrap();
    assert_eq!(snapshot.rolling["SHORT_CIRCUITED"], 1);
    assert_eq!(snapshot.rolling["FAILURE"], 6);
    assert_eq!(snapshot.rolling["SUCCESS"], 4);
}

#[tokio::test]
async fn test_successful_trial_closes_the_circuit() {
    let key = "breaker-recovers";
    let (clock, registry, executor) = breaker_setup(key);

    for _ in 0..6 {
        let _ = executor.execute(FlakyCall { key, succeed: false }).await;
    }
    for _ in 0..4 {
        let _ = executor.execute(FlakyCall { key, succeed: true }).await;
    }
    assert!(
        executor
            .execute(FlakyCall { key, succeed: true })
            .await
            .is_err()
    );

    // Sleep window elapses: one trial is allowed and succeeds
    clock.advance(Duration::from_secs(6));
    assert_eq!(
        executor.execute(FlakyCall { key, succeed: true }).await.unwrap(),
        "ok"
    );

    let command_key = CommandKey::new(key);
    assert_eq!(
        registry.circuit_state(&command_key),
        Some(CircuitState::Closed)
    );

    // Traffic flows again
    assert!(
        executor
            .execute(FlakyCall { key, succeed: true })
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_failed_trial_reopens_and_rearms_the_window() {
    let key = "breaker-retrip";
    let (clock, registry, executor) = breaker_setup(key);

    for _ in 0..10 {
        let _ = executor.execute(FlakyCall { key, succeed: false }).await;
    }
    assert!(
        executor
            .execute(FlakyCall { key, succeed: true })
            .await
            .is_err()
    );

    // Trial fails: circuit stays open, sleep window restarts from now
    clock.advance(Duration::from_secs(6));
    let trial = executor.execute(FlakyCall { key, succeed: false }).await;
    assert!(matches!(trial.unwrap_err().original(), Error::Execution { .. }));

    let command_key = CommandKey::new(key);
    assert_eq!(registry.circuit_state(&command_key), Some(CircuitState::Open));

    // Still rejecting inside the re-armed window
    clock.advance(Duration::from_secs(3));
    let rejected = executor.execute(FlakyCall { key, succeed: true }).await;
    assert!(matches!(
        rejected.unwrap_err().original(),
        Error::ShortCircuited { .. }
    ));

    // A full window after the failed trial, the next trial succeeds
    clock.advance(Duration::from_secs(3));
    assert!(
        executor
            .execute(FlakyCall { key, succeed: true })
            .await
            .is_ok()
    );
    assert_eq!(
        registry.circuit_state(&command_key),
        Some(CircuitState::Closed)
    );
}

#[tokio::test]
async fn test_short_circuited_calls_fall_back() {
    struct GuardedWithFallback;

    #[async_trait]
    impl Command for GuardedWithFallback {
        type Output = &'static str;

        fn key(&self) -> CommandKey {
            CommandKey::new("breaker-fallback")
        }

        async fn run(&self, _cancel: CancellationToken) -> Result<&'static str> {
            Err(Error::execution("breaker-fallback", "down"))
        }

        async fn fallback(&self, _error: &Error) -> Result<&'static str> {
            Ok("degraded")
        }
    }

    let (_clock, registry, executor) = breaker_setup("breaker-fallback");

    // Every call fails over to the fallback; after 10, the circuit opens
    for _ in 0..10 {
        assert_eq!(executor.execute(GuardedWithFallback).await.unwrap(), "degraded");
    }
    assert_eq!(executor.execute(GuardedWithFallback).await.unwrap(), "degraded");

    let snapshot = registry
        .metrics_snapshot(&CommandKey::new("breaker-fallback"))
        .unwrap();
    assert_eq!(snapshot.rolling["SHORT_CIRCUITED"], 1);
    assert_eq!(snapshot.rolling["FALLBACK_SUCCESS"], 11);
}

#[tokio::test]
async fn test_old_errors_age_out_of_the_window() {
    let key = "breaker-window";
    let (clock, _registry, executor) = breaker_setup(key);

    for _ in 0..9 {
        let _ = executor.execute(FlakyCall { key, succeed: false }).await;
    }

    // The failures age out before the volume threshold is ever reached
    clock.advance(Duration::from_secs(11));
    for _ in 0..5 {
        assert!(
            executor
                .execute(FlakyCall { key, succeed: true })
                .await
                .is_ok()
        );
    }
}

#[tokio::test]
async fn test_events_published_for_short_circuits() {
    let key = "breaker-events";
    let (_clock, registry, executor) = breaker_setup(key);
    let mut rx = registry.subscribe(&CommandKey::new(key));

    for _ in 0..10 {
        let _ = executor.execute(FlakyCall { key, succeed: false }).await;
    }
    let _ = executor.execute(FlakyCall { key, succeed: true }).await;

    let mut saw_short_circuit = false;
    while let Ok(event) = rx.try_recv() {
        if event.contains(EventType::ShortCircuited) {
            saw_short_circuit = true;
        }
    }
    assert!(saw_short_circuit);
}
