//! Worker-pool bulkhead with a bounded wait queue
//!
//! Up to `max_size` executions run concurrently; when every worker slot is
//! busy an acquisition waits in a queue of `queue_size` slots, and once the
//! queue is also full the acquisition is rejected. The guarded action runs
//! on its own spawned task, so a timeout can abort it outright. Dropping a
//! pending acquisition (caller cancellation) releases its queue slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::keys::PoolKey;
use crate::metrics::RollingNumber;

/// Bounded worker pool gate
pub struct PoolGate {
    key: PoolKey,
    config: PoolConfig,
    workers: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    active: Arc<AtomicU64>,
    /// Watermark counter for rolling max concurrent executions
    watermark: RollingNumber,
    executed: AtomicU64,
    rejected: AtomicU64,
}

impl PoolGate {
    /// Create a gate from pool configuration
    #[must_use]
    pub fn new(
        key: PoolKey,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
        rolling_window: Duration,
        rolling_buckets: usize,
    ) -> Self {
        let workers = config.max_size.max(1);
        Self {
            key,
            workers: Arc::new(Semaphore::new(workers)),
            queue: Arc::new(Semaphore::new(config.queue_size)),
            active: Arc::new(AtomicU64::new(0)),
            watermark: RollingNumber::new(clock, rolling_window, rolling_buckets),
            executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            config,
        }
    }

    /// Acquire a worker slot, waiting in the bounded queue if the pool is busy
    ///
    /// Returns `None` when all workers are busy and the queue is full; the
    /// rejection consumes no capacity. Dropping the returned future while it
    /// waits releases its queue slot.
    pub async fn acquire(&self) -> Option<PoolPermit> {
        if let Ok(worker) = self.workers.clone().try_acquire_owned() {
            return Some(self.grant(worker));
        }

        let Ok(queue_slot) = self.queue.clone().try_acquire_owned() else {
            self.rejected.fetch_add(1, Ordering::AcqRel);
            debug!(pool = %self.key, "Worker pool and queue full; rejecting");
            return None;
        };

        match self.workers.clone().acquire_owned().await {
            Ok(worker) => {
                drop(queue_slot);
                Some(self.grant(worker))
            }
            // The worker semaphore is never closed while the gate lives
            Err(_) => None,
        }
    }

    /// Executions in flight right now
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Acquisitions currently waiting for a worker slot
    #[must_use]
    pub fn queued(&self) -> usize {
        self.config.queue_size - self.queue.available_permits()
    }

    /// Read-only snapshot for external publishers
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            key: self.key.name().to_string(),
            core_size: self.config.core_size,
            max_size: self.config.max_size,
            queue_size: self.config.queue_size,
            active: self.active(),
            queued: self.queued(),
            rolling_max_active: self.watermark.rolling_max(),
            cumulative_executed: self.executed.load(Ordering::Acquire),
            cumulative_rejected: self.rejected.load(Ordering::Acquire),
        }
    }

    /// Clear rolling statistics (live permit accounting is untouched)
    pub fn reset(&self) {
        self.watermark.reset();
        self.executed.store(0, Ordering::Release);
        self.rejected.store(0, Ordering::Release);
    }

    fn grant(&self, worker: OwnedSemaphorePermit) -> PoolPermit {
        let now_active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.watermark.update_max(now_active);
        self.executed.fetch_add(1, Ordering::AcqRel);
        PoolPermit {
            _worker: worker,
            active: self.active.clone(),
        }
    }
}

/// RAII worker slot; dropping it frees the worker exactly once
pub struct PoolPermit {
    _worker: OwnedSemaphorePermit,
    active: Arc<AtomicU64>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of one pool's state
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// Pool key
    pub key: String,
    /// Steady-state worker count
    pub core_size: usize,
    /// Upper bound on concurrent executions
    pub max_size: usize,
    /// Wait-queue capacity
    pub queue_size: usize,
    /// Executions in flight
    pub active: u64,
    /// Acquisitions waiting for a worker
    pub queued: usize,
    /// Highest concurrency watermark inside the rolling window
    pub rolling_max_active: u64,
    /// Total granted acquisitions
    pub cumulative_executed: u64,
    /// Total rejected acquisitions
    pub cumulative_rejected: u64,
}
