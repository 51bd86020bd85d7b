//! Counting-semaphore bulkhead
//!
//! The action runs inline on the caller's task; acquisition is non-blocking
//! and exhaustion rejects immediately.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Non-blocking counting permit gate
pub struct SemaphoreGate {
    name: String,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl SemaphoreGate {
    /// Create a gate with `max_concurrent` permits
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Try to take a permit without waiting
    ///
    /// Returns `None` when no permits are available; the failed attempt does
    /// not consume capacity.
    #[must_use]
    pub fn try_acquire(&self) -> Option<SemaphorePermit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(SemaphorePermit { _permit: permit }),
            Err(_) => {
                tracing::debug!(gate = %self.name, "Semaphore gate exhausted");
                None
            }
        }
    }

    /// Permits currently available
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Configured permit count
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// RAII execution permit; dropping it releases the slot exactly once
pub struct SemaphorePermit {
    _permit: OwnedSemaphorePermit,
}
