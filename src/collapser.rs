//! Request collapsing: merge many small calls into one batched execution
//!
//! Requests submitted within a short window (or until a size cap) join the
//! current open batch. Sealing a batch and opening the next is a single
//! atomic handoff under the batch lock, so no request is lost or counted
//! twice. The sealed batch runs as one guarded command; its results are
//! demultiplexed back to the waiting callers by position, or through a
//! user-supplied mapping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::{Command, Executor};
use crate::config::CollapserConfig;
use crate::error::{Error, Result};
use crate::events::EventType;
use crate::keys::{CollapserKey, CommandKey, GroupKey, PoolKey};

/// A user-supplied batch executor
///
/// One batch invocation serves every request collapsed into it. The batch
/// runs as a single guarded command, so it gets the same breaker, isolation,
/// timeout, and fallback treatment as any other command under its key.
#[async_trait]
pub trait BatchCommand: Send + Sync + 'static {
    /// Argument of one collapsed request
    type Arg: Clone + Send + Sync + 'static;
    /// Result delivered to one collapsed request
    type Output: Clone + Send + Sync + 'static;

    /// Collapser key: names the batching window and the batch command
    fn key(&self) -> CollapserKey;

    /// Execute the batch; results correspond to `args` by position
    async fn run_batch(
        &self,
        args: Vec<Self::Arg>,
        cancel: CancellationToken,
    ) -> Result<Vec<Self::Output>>;

    /// Degraded per-request results when the batch fails
    ///
    /// The default reports that no fallback is configured.
    async fn fallback(&self, args: &[Self::Arg], error: &Error) -> Result<Vec<Self::Output>> {
        let _ = (args, error);
        Err(Error::FallbackMissing {
            key: self.key().name().to_string(),
        })
    }

    /// Map batch output back to one result per argument
    ///
    /// The default is positional and rejects count mismatches. Override to
    /// match results to arguments by key when the batch backend reorders or
    /// omits entries.
    fn map_results(&self, args: &[Self::Arg], results: Vec<Self::Output>) -> Result<Vec<Self::Output>> {
        if results.len() == args.len() {
            Ok(results)
        } else {
            Err(Error::BatchMismatch {
                key: self.key().name().to_string(),
                expected: args.len(),
                actual: results.len(),
            })
        }
    }
}

/// Adapter running one sealed batch as a guarded command
struct BatchExecution<B: BatchCommand> {
    command: Arc<B>,
    args: Vec<B::Arg>,
}

#[async_trait]
impl<B: BatchCommand> Command for BatchExecution<B> {
    type Output = Vec<B::Output>;

    fn key(&self) -> CommandKey {
        CommandKey::new(self.command.key().name())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<Self::Output> {
        self.command.run_batch(self.args.clone(), cancel).await
    }

    async fn fallback(&self, error: &Error) -> Result<Self::Output> {
        self.command.fallback(&self.args, error).await
    }
}

struct OpenBatch<B: BatchCommand> {
    generation: u64,
    /// Each waiting request: its argument and its single-assignment result slot
    requests: Vec<(B::Arg, oneshot::Sender<Result<B::Output>>)>,
}

/// Accumulates requests into batches and executes them as guarded commands
pub struct Collapser<B: BatchCommand> {
    command: Arc<B>,
    key: CollapserKey,
    config: CollapserConfig,
    executor: Executor,
    state: Mutex<Option<OpenBatch<B>>>,
    generation: AtomicU64,
    batches_submitted: AtomicU64,
    requests_collapsed: AtomicU64,
}

impl<B: BatchCommand> Collapser<B> {
    /// Create a collapser; its configuration resolves by the command's key
    #[must_use]
    pub fn new(executor: Executor, command: B) -> Arc<Self> {
        let key = command.key();
        let config = executor.registry().config().collapser(key.name());
        Arc::new(Self {
            command: Arc::new(command),
            key,
            config,
            executor,
            state: Mutex::new(None),
            generation: AtomicU64::new(0),
            batches_submitted: AtomicU64::new(0),
            requests_collapsed: AtomicU64::new(0),
        })
    }

    /// Submit one request and wait for its share of the batch result
    pub async fn submit(self: &Arc<Self>, arg: B::Arg) -> Result<B::Output> {
        let (tx, rx) = oneshot::channel();

        let sealed_at_cap = {
            let mut state = self.state.lock();
            let batch = state.get_or_insert_with(|| {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                self.spawn_window_timer(generation);
                OpenBatch {
                    generation,
                    requests: Vec::new(),
                }
            });
            batch.requests.push((arg, tx));

            let cap = self.config.max_batch_size;
            if cap > 0 && batch.requests.len() >= cap {
                state.take()
            } else {
                None
            }
        };

        if let Some(batch) = sealed_at_cap {
            debug!(
                key = %self.key,
                size = batch.requests.len(),
                "Batch sealed at size cap"
            );
            self.spawn_execution(batch);
        }

        rx.await.map_err(|_| Error::Cancelled {
            key: self.key.name().to_string(),
        })?
    }

    /// Read-only snapshot for external publishers
    pub fn snapshot(&self) -> CollapserSnapshot {
        CollapserSnapshot {
            key: self.key.name().to_string(),
            pending: self.state.lock().as_ref().map_or(0, |b| b.requests.len()),
            batches_submitted: self.batches_submitted.load(Ordering::Acquire),
            requests_collapsed: self.requests_collapsed.load(Ordering::Acquire),
        }
    }

    /// Start the window timer for a freshly opened batch
    fn spawn_window_timer(self: &Arc<Self>, generation: u64) {
        let this = Arc::clone(self);
        let window = self.config.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.seal_generation(generation);
        });
    }

    /// Seal the open batch if it is still the one this timer belongs to
    fn seal_generation(self: &Arc<Self>, generation: u64) {
        let sealed = {
            let mut state = self.state.lock();
            if state.as_ref().is_some_and(|b| b.generation == generation) {
                state.take()
            } else {
                // A size cap already sealed this batch; the timer is stale
                None
            }
        };
        if let Some(batch) = sealed {
            debug!(
                key = %self.key,
                size = batch.requests.len(),
                "Batch sealed at window end"
            );
            self.spawn_execution(batch);
        }
    }

    fn spawn_execution(self: &Arc<Self>, batch: OpenBatch<B>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute_batch(batch).await;
        });
    }

    /// Run the sealed batch as one guarded command and demux the results
    async fn execute_batch(self: Arc<Self>, batch: OpenBatch<B>) {
        let (args, senders): (Vec<_>, Vec<_>) = batch.requests.into_iter().unzip();
        let size = args.len() as u64;
        self.batches_submitted.fetch_add(1, Ordering::AcqRel);
        self.requests_collapsed.fetch_add(size, Ordering::AcqRel);

        let execution = BatchExecution {
            command: self.command.clone(),
            args: args.clone(),
        };
        let command_key = execution.key();
        let instruments = self.executor.registry().instruments(
            &command_key,
            &GroupKey::new(command_key.name()),
            &PoolKey::new(command_key.name()),
        );
        instruments
            .metrics
            .record_event_with_count(EventType::Collapsed, size);

        let outcome = match self.executor.execute(execution).await {
            Ok(results) => self.command.map_results(&args, results),
            Err(error) => Err(error),
        };

        match outcome {
            Ok(results) if results.len() == senders.len() => {
                for (sender, value) in senders.into_iter().zip(results) {
                    let _ = sender.send(Ok(value));
                }
            }
            Ok(results) => {
                // A custom mapping shortchanged the batch: fail every waiter
                let error = Error::BatchMismatch {
                    key: self.key.name().to_string(),
                    expected: senders.len(),
                    actual: results.len(),
                };
                warn!(key = %self.key, %error, "Batch result mismatch");
                for sender in senders {
                    let _ = sender.send(Err(error.clone()));
                }
            }
            Err(error) => {
                for sender in senders {
                    let _ = sender.send(Err(error.clone()));
                }
            }
        }
    }
}

/// Snapshot of one collapser's state
#[derive(Debug, Clone, Serialize)]
pub struct CollapserSnapshot {
    /// Collapser key
    pub key: String,
    /// Requests waiting in the current open batch
    pub pending: usize,
    /// Batches executed so far
    pub batches_submitted: u64,
    /// Requests collapsed into batches so far
    pub requests_collapsed: u64,
}
