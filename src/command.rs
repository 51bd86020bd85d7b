//! Guarded command execution pipeline
//!
//! A [`Command`] wraps one invocation of a risky action plus its fallback.
//! The [`Executor`] runs it through the pipeline: request-cache lookup,
//! circuit breaker check, isolation acquire, timed run, outcome
//! classification, fallback. Every terminal path records exactly one
//! execution event set and one latency sample before the command completes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::IsolationStrategy;
use crate::error::{Error, Result};
use crate::events::EventType;
use crate::isolation::{PoolPermit, SemaphorePermit};
use crate::keys::{CommandKey, GroupKey, PoolKey};
use crate::registry::{CommandInstruments, PrimaryGate, Registry};
use crate::request_cache::RequestScope;

/// One guarded invocation of a risky action plus its fallback
///
/// Implementations are cheap descriptors: the executor owns all per-key
/// state (statistics, breaker, gates) and looks it up by [`Command::key`].
#[async_trait]
pub trait Command: Send + Sync + 'static {
    /// Result type delivered to the caller
    ///
    /// `Clone` because a cached result may be shared with several callers.
    type Output: Clone + Send + Sync + 'static;

    /// Command key: names the breaker, statistics, and configuration entry
    fn key(&self) -> CommandKey;

    /// Group the command reports under; defaults to the command key
    fn group_key(&self) -> GroupKey {
        GroupKey::new(self.key().name())
    }

    /// Isolation pool the command executes on; defaults to the group
    fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.group_key().name())
    }

    /// The risky action
    ///
    /// `cancel` fires when the execution is abandoned (timeout or caller
    /// cancellation); long-running actions should poll it at natural points.
    async fn run(&self, cancel: CancellationToken) -> Result<Self::Output>;

    /// Degraded result used when `run` fails, times out, or is rejected
    ///
    /// The default reports that no fallback is configured.
    async fn fallback(&self, error: &Error) -> Result<Self::Output> {
        let _ = error;
        Err(Error::FallbackMissing {
            key: self.key().name().to_string(),
        })
    }

    /// Cache key for request-scoped deduplication; `None` disables caching
    fn cache_key(&self) -> Option<String> {
        None
    }
}

/// Runs commands through the guarded pipeline
#[derive(Clone)]
pub struct Executor {
    registry: Arc<Registry>,
}

impl Executor {
    /// Create an executor over a registry
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// The registry backing this executor
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Execute a command without request-cache participation
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        let instruments = self.instruments_for(&command);
        run_guarded(instruments, Arc::new(command)).await
    }

    /// Execute a command inside a request scope
    ///
    /// If the command supplies a cache key and an execution for that key
    /// already exists in the scope (in flight or completed), the caller
    /// joins the shared result and `RESPONSE_FROM_CACHE` is recorded; the
    /// action does not run again.
    pub async fn execute_scoped<C: Command>(
        &self,
        scope: &RequestScope,
        command: C,
    ) -> Result<C::Output> {
        let instruments = self.instruments_for(&command);

        let cache_key = if instruments.config.cache.enabled {
            command.cache_key()
        } else {
            None
        };
        let Some(cache_key) = cache_key else {
            return run_guarded(instruments, Arc::new(command)).await;
        };

        let scoped_key = format!("{}::{}", command.key(), cache_key);
        let command = Arc::new(command);
        let future = {
            let instruments = instruments.clone();
            let command = command.clone();
            async move { run_guarded(instruments, command).await }.boxed()
        };

        let (shared, installed) = scope.get_or_insert(&scoped_key, future);
        if !installed {
            instruments.record_cache_hit();
        }
        shared.await
    }

    fn instruments_for<C: Command>(&self, command: &C) -> Arc<CommandInstruments> {
        self.registry
            .instruments(&command.key(), &command.group_key(), &command.pool_key())
    }
}

/// An acquired isolation slot, whichever strategy granted it
enum Permit {
    Pool(PoolPermit),
    Semaphore(SemaphorePermit),
}

/// The pipeline proper: breaker → gate → timed run → classify → fallback
async fn run_guarded<C: Command>(
    instruments: Arc<CommandInstruments>,
    command: Arc<C>,
) -> Result<C::Output> {
    let started = Instant::now();

    if !instruments.breaker.allow_request() {
        debug!(key = %instruments.key, "Short-circuiting; circuit is open");
        let error = Error::ShortCircuited {
            key: instruments.key.name().to_string(),
        };
        return finish_with_fallback(
            &instruments,
            command,
            EventType::ShortCircuited,
            error,
            started,
        )
        .await;
    }

    let permit = match acquire_permit(&instruments).await {
        Ok(permit) => permit,
        Err((event, error)) => {
            return finish_with_fallback(&instruments, command, event, error, started).await;
        }
    };

    instruments.metrics.execution_started();
    let outcome = run_action(&instruments, command.clone()).await;
    instruments.metrics.execution_finished();
    drop(permit);

    match outcome {
        Ok(value) => {
            instruments.breaker.mark_success();
            complete(&instruments, vec![EventType::Emit, EventType::Success], started);
            Ok(value)
        }
        Err(error) if error.is_bad_request() => {
            // Caller error: propagated as-is, breaker untouched, no fallback
            complete(&instruments, vec![EventType::BadRequest], started);
            Err(error)
        }
        Err(error) => {
            instruments.breaker.mark_non_success();
            let event = failure_event(&error);
            finish_with_fallback(&instruments, command, event, error, started).await
        }
    }
}

/// Classify a failed run into its terminal event
fn failure_event(error: &Error) -> EventType {
    match error {
        Error::Timeout { .. } => EventType::Timeout,
        Error::Internal(_) => EventType::ExceptionThrown,
        _ => EventType::Failure,
    }
}

async fn acquire_permit(
    instruments: &CommandInstruments,
) -> std::result::Result<Permit, (EventType, Error)> {
    let key = instruments.key.name().to_string();
    match &instruments.gate {
        PrimaryGate::Pool(pool) => match pool.acquire().await {
            Some(permit) => Ok(Permit::Pool(permit)),
            None => Err((
                EventType::ThreadPoolRejected,
                Error::PoolRejected { key },
            )),
        },
        PrimaryGate::Semaphore(gate) => match gate.try_acquire() {
            Some(permit) => Ok(Permit::Semaphore(permit)),
            None => Err((
                EventType::SemaphoreRejected,
                Error::SemaphoreRejected { key },
            )),
        },
    }
}

/// Run the action under the configured timeout
///
/// Pool-isolated actions run on their own task so a timeout can abort them
/// outright; semaphore-isolated actions run inline and are dropped at their
/// next await point. Either way a late result cannot be reported.
async fn run_action<C: Command>(
    instruments: &CommandInstruments,
    command: Arc<C>,
) -> Result<C::Output> {
    let cancel = CancellationToken::new();
    let timeout = instruments.config.timeout.clone();
    let key = instruments.key.name().to_string();

    match instruments.config.isolation.strategy {
        IsolationStrategy::Pool => {
            let mut handle = tokio::spawn({
                let command = command.clone();
                let token = cancel.clone();
                async move { command.run(token).await }
            });
            if timeout.enabled {
                match tokio::time::timeout(timeout.duration, &mut handle).await {
                    Ok(joined) => flatten_join(joined, &key),
                    Err(_) => {
                        cancel.cancel();
                        handle.abort();
                        Err(Error::Timeout {
                            key,
                            timeout_ms: timeout.duration.as_millis() as u64,
                        })
                    }
                }
            } else {
                flatten_join(handle.await, &key)
            }
        }
        IsolationStrategy::Semaphore => {
            let action = command.run(cancel.clone());
            if timeout.enabled {
                match tokio::time::timeout(timeout.duration, action).await {
                    Ok(result) => result,
                    Err(_) => {
                        cancel.cancel();
                        Err(Error::Timeout {
                            key,
                            timeout_ms: timeout.duration.as_millis() as u64,
                        })
                    }
                }
            } else {
                action.await
            }
        }
    }
}

fn flatten_join<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
    key: &str,
) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            Err(Error::Internal(format!("command '{key}' panicked")))
        }
        Err(_) => Err(Error::Cancelled {
            key: key.to_string(),
        }),
    }
}

/// Attempt the fallback and settle the command
///
/// The fallback runs behind its own semaphore. In every non-success fallback
/// outcome the original failure is what the caller receives; a fallback's
/// own failure is attached as context, never substituted.
async fn finish_with_fallback<C: Command>(
    instruments: &CommandInstruments,
    command: Arc<C>,
    cause: EventType,
    error: Error,
    started: Instant,
) -> Result<C::Output> {
    if !instruments.config.fallback.enabled {
        complete(instruments, vec![cause, EventType::FallbackMissing], started);
        return Err(error);
    }

    let Some(_permit) = instruments.fallback_gate.try_acquire() else {
        warn!(key = %instruments.key, "Fallback rejected; fallback semaphore exhausted");
        complete(
            instruments,
            vec![cause, EventType::FallbackRejection],
            started,
        );
        return Err(error);
    };

    match command.fallback(&error).await {
        Ok(value) => {
            complete(instruments, vec![cause, EventType::FallbackSuccess], started);
            Ok(value)
        }
        Err(Error::FallbackMissing { .. }) => {
            complete(instruments, vec![cause, EventType::FallbackMissing], started);
            Err(error)
        }
        Err(fallback_error) => {
            warn!(
                key = %instruments.key,
                error = %fallback_error,
                "Fallback itself failed"
            );
            complete(instruments, vec![cause, EventType::FallbackFailure], started);
            Err(Error::with_fallback_failure(error, fallback_error))
        }
    }
}

/// Record the terminal event set, one latency sample, and publish the event
fn complete(instruments: &CommandInstruments, events: Vec<EventType>, started: Instant) {
    let latency = started.elapsed();
    for event in &events {
        instruments.metrics.record_event(*event);
    }
    instruments.metrics.record_latency(latency);
    instruments.publish(events, Some(latency));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_event_classification() {
        let timeout = Error::Timeout {
            key: "c".to_string(),
            timeout_ms: 100,
        };
        let panic = Error::Internal("command 'c' panicked".to_string());
        let plain = Error::execution("c", "boom");

        assert_eq!(failure_event(&timeout), EventType::Timeout);
        assert_eq!(failure_event(&panic), EventType::ExceptionThrown);
        assert_eq!(failure_event(&plain), EventType::Failure);
    }
}
