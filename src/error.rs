//! Error types for the guarded execution engine

use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by guarded command execution
///
/// The enum is `Clone` (string payloads only) so a single failure can be
/// shared with every caller joined on a cached in-flight result.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The wrapped action failed
    #[error("Command '{key}' failed: {message}")]
    Execution {
        /// Command key
        key: String,
        /// Failure description
        message: String,
    },

    /// The wrapped action exceeded its timeout; any late result is discarded
    #[error("Command '{key}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Command key
        key: String,
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Rejected without executing because the circuit is open
    #[error("Command '{key}' short-circuited: circuit is open")]
    ShortCircuited {
        /// Command key
        key: String,
    },

    /// Rejected by the worker pool: all workers busy and the queue is full
    #[error("Command '{key}' rejected: worker pool and queue are full")]
    PoolRejected {
        /// Command key
        key: String,
    },

    /// Rejected by the execution semaphore: no permits available
    #[error("Command '{key}' rejected: no execution permits available")]
    SemaphoreRejected {
        /// Command key
        key: String,
    },

    /// Caller error; never counted against the circuit and never falls back
    #[error("Bad request for command '{key}': {message}")]
    BadRequest {
        /// Command key
        key: String,
        /// Description of the caller error
        message: String,
    },

    /// No fallback is configured for the command
    #[error("Command '{key}' has no fallback")]
    FallbackMissing {
        /// Command key
        key: String,
    },

    /// The original failure, with the fallback's own failure attached as context
    #[error("{original} (fallback also failed: {fallback})")]
    FallbackFailed {
        /// The failure that triggered the fallback
        original: Box<Error>,
        /// What the fallback itself failed with
        #[source]
        fallback: Box<Error>,
    },

    /// A collapsed batch returned the wrong number of results
    #[error("Collapser '{key}' returned {actual} results for {expected} requests")]
    BatchMismatch {
        /// Collapser key
        key: String,
        /// Number of collapsed requests in the batch
        expected: usize,
        /// Number of results the batch function produced
        actual: usize,
    },

    /// The command was abandoned before completing
    #[error("Command '{key}' cancelled")]
    Cancelled {
        /// Command key
        key: String,
    },

    /// Unexpected internal error (e.g. a panicking action)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an execution failure for a command
    pub fn execution(key: impl AsRef<str>, message: impl Into<String>) -> Self {
        Self::Execution {
            key: key.as_ref().to_string(),
            message: message.into(),
        }
    }

    /// Build a bad-request error for a command
    pub fn bad_request(key: impl AsRef<str>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            key: key.as_ref().to_string(),
            message: message.into(),
        }
    }

    /// Attach a fallback failure to the original error without replacing it
    #[must_use]
    pub fn with_fallback_failure(original: Error, fallback: Error) -> Self {
        Self::FallbackFailed {
            original: Box::new(original),
            fallback: Box::new(fallback),
        }
    }

    /// The original failure, unwrapping any attached fallback context
    #[must_use]
    pub fn original(&self) -> &Error {
        match self {
            Self::FallbackFailed { original, .. } => original.original(),
            other => other,
        }
    }

    /// Whether this error is a caller error (bad request)
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(self.original(), Self::BadRequest { .. })
    }

    /// Whether this error is a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.original(), Self::Timeout { .. })
    }

    /// Whether this error is a breaker or isolation rejection
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.original(),
            Self::ShortCircuited { .. } | Self::PoolRejected { .. } | Self::SemaphoreRejected { .. }
        )
    }
}
