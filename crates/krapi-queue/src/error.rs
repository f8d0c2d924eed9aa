//! Error types for the operation queue.

use thiserror::Error;

/// Errors raised by the queue itself, as opposed to by the operations it runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was used before `initialize`.
    #[error("operation queue is not initialized")]
    NotInitialized,

    /// `initialize` was called on a queue that already has a backend.
    #[error("operation queue is already initialized")]
    AlreadyInitialized,

    /// `initialize` was called outside a tokio runtime.
    #[error("operation queue requires a tokio runtime")]
    RuntimeUnavailable,

    /// The pending backlog is full. Callers should retry later.
    #[error("operation queue is full ({max_size} pending operations)")]
    CapacityExceeded {
        /// Configured backlog limit.
        max_size: usize,
    },

    /// The queue is draining or stopped and accepts no new work.
    #[error("operation queue is shutting down")]
    ShuttingDown,

    /// A pending operation was discarded by `clear` or `drain`.
    #[error("operation queue cleared before the operation started")]
    Cleared,

    /// The operation panicked or was dropped without producing a result.
    #[error("operation was abandoned before completing")]
    Abandoned,
}

impl QueueError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
