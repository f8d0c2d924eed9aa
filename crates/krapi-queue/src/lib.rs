//! Bounded, prioritized, rate-limited operation queue.
//!
//! Operations are closures over a shared backend. They wait in a priority
//! heap (FIFO within a priority), are admitted by a single scheduler loop
//! subject to a token bucket and a concurrency cap, and run on the blocking
//! thread pool. Each enqueue returns a [`Completion`] that resolves with the
//! operation's own result.

pub mod bucket;
pub mod error;
pub mod metrics;
pub mod queue;

pub use bucket::TokenBucket;
pub use error::QueueError;
pub use metrics::{ItemClock, QueueMetrics, QueueState, QueueStats, SampleWindow, SAMPLE_WINDOW};
pub use queue::{Completion, Job, OperationQueue, QueueSettings};
