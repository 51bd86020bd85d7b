//! Bulkhead isolation strategies
//!
//! Two interchangeable gates bound concurrent load on a dependency: a
//! bounded worker pool with a bounded wait queue ([`PoolGate`]) and a
//! counting semaphore ([`SemaphoreGate`]). Permits are RAII guards, so
//! release happens exactly once and a rejected acquire never consumes
//! capacity. Fallbacks always run behind their own [`SemaphoreGate`] so a
//! flood of fallbacks cannot exhaust the primary gate.

mod pool;
mod semaphore;

pub use pool::{PoolGate, PoolPermit, PoolSnapshot};
pub use semaphore::{SemaphoreGate, SemaphorePermit};
