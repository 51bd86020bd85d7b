//! Execution event types and the per-key broadcast stream
//!
//! Every terminal command emits one immutable [`CommandEvent`] to the event
//! stream of its key. External dashboards and publishers subscribe through
//! [`Registry::subscribe`](crate::registry::Registry::subscribe); slow
//! subscribers lose the oldest events rather than blocking producers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Outcome classification of one command execution step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A value was delivered to the caller
    Emit,
    /// The action completed normally
    Success,
    /// The action failed
    Failure,
    /// The action exceeded its timeout
    Timeout,
    /// Rejected because the circuit is open
    ShortCircuited,
    /// Rejected because the worker pool and its queue are full
    ThreadPoolRejected,
    /// Rejected because no semaphore permits were available
    SemaphoreRejected,
    /// Caller error; propagated without fallback or breaker marking
    BadRequest,
    /// The fallback produced a value
    FallbackSuccess,
    /// The fallback itself failed
    FallbackFailure,
    /// No fallback is configured
    FallbackMissing,
    /// The fallback semaphore had no permits
    FallbackRejection,
    /// Result served from the request cache
    ResponseFromCache,
    /// Requests merged into a batch execution
    Collapsed,
    /// The action failed with an unexpected error type
    ExceptionThrown,
}

impl EventType {
    /// Number of event types; sizes the per-bucket counter arrays
    pub const COUNT: usize = 15;

    /// All event types, in declaration order
    pub const ALL: [EventType; Self::COUNT] = [
        Self::Emit,
        Self::Success,
        Self::Failure,
        Self::Timeout,
        Self::ShortCircuited,
        Self::ThreadPoolRejected,
        Self::SemaphoreRejected,
        Self::BadRequest,
        Self::FallbackSuccess,
        Self::FallbackFailure,
        Self::FallbackMissing,
        Self::FallbackRejection,
        Self::ResponseFromCache,
        Self::Collapsed,
        Self::ExceptionThrown,
    ];

    /// Array index of this event type
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Whether this outcome counts as an error in the breaker's health math
    ///
    /// Short-circuited requests are excluded: they never executed.
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::Failure
                | Self::Timeout
                | Self::ThreadPoolRejected
                | Self::SemaphoreRejected
                | Self::ExceptionThrown
        )
    }

    /// Canonical name, matching the wire form external publishers use
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emit => "EMIT",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::ShortCircuited => "SHORT_CIRCUITED",
            Self::ThreadPoolRejected => "THREAD_POOL_REJECTED",
            Self::SemaphoreRejected => "SEMAPHORE_REJECTED",
            Self::BadRequest => "BAD_REQUEST",
            Self::FallbackSuccess => "FALLBACK_SUCCESS",
            Self::FallbackFailure => "FALLBACK_FAILURE",
            Self::FallbackMissing => "FALLBACK_MISSING",
            Self::FallbackRejection => "FALLBACK_REJECTION",
            Self::ResponseFromCache => "RESPONSE_FROM_CACHE",
            Self::Collapsed => "COLLAPSED",
            Self::ExceptionThrown => "EXCEPTION_THROWN",
        }
    }

    /// Parse an event type by canonical name
    ///
    /// Returns `None` for names this version does not recognize; callers are
    /// expected to degrade to a zero count rather than fail.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.as_str() == name)
    }
}

/// Immutable record of one terminal command completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Command key the event belongs to
    pub key: String,
    /// Group the command reports under
    pub group: String,
    /// Event types recorded for this completion, in the order they occurred
    pub event_types: Vec<EventType>,
    /// Execution latency in milliseconds; `None` for cache hits
    pub latency_ms: Option<u64>,
    /// Completion time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl CommandEvent {
    /// Whether a given event type was recorded for this completion
    #[must_use]
    pub fn contains(&self, event: EventType) -> bool {
        self.event_types.contains(&event)
    }

    /// Execution latency as a [`Duration`], if one was recorded
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.latency_ms.map(Duration::from_millis)
    }
}

/// Per-key broadcast stream of [`CommandEvent`]s
///
/// Built on a bounded broadcast channel: publishing never blocks, and a
/// subscriber that falls more than the buffer size behind loses the oldest
/// events (surfaced as a lag notice by the receiver).
#[derive(Debug)]
pub struct EventStream {
    sender: broadcast::Sender<CommandEvent>,
}

impl EventStream {
    /// Create a stream retaining up to `capacity` undelivered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a [`futures::Stream`](futures::Stream)
    #[must_use]
    pub fn subscribe_stream(&self) -> BroadcastStream<CommandEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Publish an event; a send with no subscribers is not an error
    pub(crate) fn publish(&self, event: CommandEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip_names() {
        for event in EventType::ALL {
            assert_eq!(EventType::from_name(event.as_str()), Some(event));
        }
        assert_eq!(EventType::from_name("NOT_A_REAL_EVENT"), None);
    }

    #[test]
    fn test_error_classification() {
        assert!(EventType::Failure.is_error());
        assert!(EventType::Timeout.is_error());
        assert!(EventType::SemaphoreRejected.is_error());
        assert!(!EventType::Success.is_error());
        assert!(!EventType::ShortCircuited.is_error());
        assert!(!EventType::ResponseFromCache.is_error());
    }

    #[test]
    fn test_indices_are_dense() {
        for (i, event) in EventType::ALL.iter().enumerate() {
            assert_eq!(event.index(), i);
        }
    }

    #[tokio::test]
    async fn test_stream_delivers_to_subscriber() {
        let stream = EventStream::new(16);
        let mut rx = stream.subscribe();

        stream.publish(CommandEvent {
            key: "cmd".to_string(),
            group: "grp".to_string(),
            event_types: vec![EventType::Emit, EventType::Success],
            latency_ms: Some(12),
            timestamp_ms: 1_000,
        });

        let event = rx.recv().await.unwrap();
        assert!(event.contains(EventType::Success));
        assert_eq!(event.latency(), Some(Duration::from_millis(12)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let stream = EventStream::new(4);
        stream.publish(CommandEvent {
            key: "cmd".to_string(),
            group: "grp".to_string(),
            event_types: vec![EventType::Failure],
            latency_ms: Some(3),
            timestamp_ms: 2_000,
        });
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let stream = EventStream::new(2);
        let mut rx = stream.subscribe();

        for i in 0..5 {
            stream.publish(CommandEvent {
                key: format!("cmd-{i}"),
                group: "grp".to_string(),
                event_types: vec![EventType::Success],
                latency_ms: Some(i),
                timestamp_ms: i,
            });
        }

        // The first read reports the lag; subsequent reads see only the newest
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag notice, got {other:?}"),
        }
        let newest = rx.recv().await.unwrap();
        assert_eq!(newest.key, "cmd-3");
    }
}
