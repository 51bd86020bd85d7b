//! Shunt: guarded execution for unreliable dependencies
//!
//! Wraps risky calls (network hops, remote services, slow resources) in
//! guarded commands that protect the caller from cascading failures.
//!
//! # Features
//!
//! - **Circuit breaking**: per-key breakers driven by rolling error rates,
//!   with sleep-window single-trial recovery and forced overrides
//! - **Bulkhead isolation**: bounded worker pool or counting semaphore per
//!   command, plus an independent gate for fallbacks
//! - **Fallbacks**: degraded results on failure, timeout, or rejection; the
//!   original failure is always what surfaces
//! - **Request caching**: per-request-scope deduplication of identical calls
//! - **Request collapsing**: bursts of small calls batched into one execution
//! - **Observability**: non-blocking statistics snapshots and per-key event
//!   streams with drop-oldest backpressure
//!
//! # Example
//!
//! ```no_run
//! use shunt::{Command, CommandKey, Config, Error, Executor, Registry, Result};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct FetchUser {
//!     id: u64,
//! }
//!
//! #[async_trait]
//! impl Command for FetchUser {
//!     type Output = String;
//!
//!     fn key(&self) -> CommandKey {
//!         CommandKey::new("fetch-user")
//!     }
//!
//!     async fn run(&self, _cancel: CancellationToken) -> Result<String> {
//!         // Call the unreliable dependency here
//!         Ok(format!("user-{}", self.id))
//!     }
//!
//!     async fn fallback(&self, _error: &Error) -> Result<String> {
//!         Ok("anonymous".to_string())
//!     }
//! }
//!
//! # async fn demo() -> Result<()> {
//! let registry = Arc::new(Registry::new(Config::default()));
//! let executor = Executor::new(registry);
//! let user = executor.execute(FetchUser { id: 42 }).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod breaker;
pub mod clock;
pub mod collapser;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod isolation;
pub mod keys;
pub mod metrics;
pub mod registry;
pub mod request_cache;

pub use breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collapser::{BatchCommand, Collapser, CollapserSnapshot};
pub use command::{Command, Executor};
pub use config::{CollapserConfig, CommandConfig, Config, IsolationStrategy};
pub use error::{Error, Result};
pub use events::{CommandEvent, EventType};
pub use keys::{CollapserKey, CommandKey, GroupKey, PoolKey};
pub use metrics::{HealthCounts, MetricsSnapshot};
pub use registry::Registry;
pub use request_cache::RequestScope;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
