//! Request-scoped memoization of command results
//!
//! A [`RequestScope`] lives for one caller-defined logical request (for
//! example, one inbound API call fanning out to many dependencies). Commands
//! that supply a cache key share a single in-flight execution per key within
//! the scope: the first caller runs, every later caller joins the same
//! shared result. Entries live until the scope is cleared or dropped.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::warn;

use crate::Result;

type SharedResult<R> = Shared<BoxFuture<'static, Result<R>>>;

/// One logical request's cache of shared command results
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone, Default)]
pub struct RequestScope {
    entries: Arc<DashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl RequestScope {
    /// Create an empty scope
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the cached execution for `key`, or install `future` as it
    ///
    /// Returns the shared future to await and whether this caller installed
    /// it (`true` means this caller owns the actual execution; `false` means
    /// the result is served from the cache). The installed future only runs
    /// when polled, so the losing side of a race never executes.
    pub(crate) fn get_or_insert<R>(
        &self,
        key: &str,
        future: BoxFuture<'static, Result<R>>,
    ) -> (SharedResult<R>, bool)
    where
        R: Clone + Send + Sync + 'static,
    {
        let shared = future.shared();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                if let Some(existing) = entry.get().downcast_ref::<SharedResult<R>>() {
                    (existing.clone(), false)
                } else {
                    // Same key reused with a different result type; run this
                    // call uncached rather than fail it
                    warn!(cache_key = key, "Request cache type mismatch; bypassing cache");
                    (shared, true)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Box::new(shared.clone()));
                (shared, true)
            }
        }
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the scope holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached entry; call at the end of the logical request
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_future(counter: Arc<AtomicU64>, value: u64) -> BoxFuture<'static, Result<u64>> {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    }

    #[tokio::test]
    async fn test_same_key_executes_once() {
        let scope = RequestScope::new();
        let executions = Arc::new(AtomicU64::new(0));

        let (first, first_inserted) =
            scope.get_or_insert("k", counting_future(executions.clone(), 7));
        let (second, second_inserted) =
            scope.get_or_insert("k", counting_future(executions.clone(), 8));

        assert!(first_inserted);
        assert!(!second_inserted);

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_execute_independently() {
        let scope = RequestScope::new();
        let executions = Arc::new(AtomicU64::new(0));

        let (first, _) = scope.get_or_insert("a", counting_future(executions.clone(), 1));
        let (second, _) = scope.get_or_insert("b", counting_future(executions.clone(), 2));

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_forgets_results() {
        let scope = RequestScope::new();
        let executions = Arc::new(AtomicU64::new(0));

        let (first, _) = scope.get_or_insert("k", counting_future(executions.clone(), 1));
        assert_eq!(first.await.unwrap(), 1);

        scope.clear();
        assert!(scope.is_empty());

        let (second, inserted) = scope.get_or_insert("k", counting_future(executions.clone(), 2));
        assert!(inserted);
        assert_eq!(second.await.unwrap(), 2);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_type_mismatch_bypasses_cache() {
        let scope = RequestScope::new();
        let executions = Arc::new(AtomicU64::new(0));

        let (first, _) = scope.get_or_insert("k", counting_future(executions.clone(), 1));
        assert_eq!(first.await.unwrap(), 1);

        // Same key, different result type: runs uncached instead of failing
        let string_future: BoxFuture<'static, Result<String>> =
            Box::pin(async { Ok("fresh".to_string()) });
        let (second, inserted) = scope.get_or_insert("k", string_future);
        assert!(inserted);
        assert_eq!(second.await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_losing_racer_never_runs() {
        let scope = RequestScope::new();
        let executions = Arc::new(AtomicU64::new(0));

        let (winner, _) = scope.get_or_insert("k", counting_future(executions.clone(), 1));
        // The loser's future is installed nowhere and never polled
        let (loser, inserted) = scope.get_or_insert("k", counting_future(executions.clone(), 2));
        assert!(!inserted);

        drop(loser);
        assert_eq!(winner.await.unwrap(), 1);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }
}
