//! Queue counters and moving averages.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of samples kept per moving average.
pub const SAMPLE_WINDOW: usize = 1000;

/// A bounded window of duration samples with a running sum.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<Duration>,
    sum: Duration,
    capacity: usize,
}

impl SampleWindow {
    /// Creates an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(SAMPLE_WINDOW)),
            sum: Duration::ZERO,
            capacity: capacity.max(1),
        }
    }

    /// Records a sample, evicting the oldest one when full.
    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(oldest);
            }
        }
        self.samples.push_back(sample);
        self.sum = self.sum.saturating_add(sample);
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if no sample was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Simple moving average in milliseconds, `0.0` when empty.
    pub fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum.as_secs_f64() * 1000.0 / self.samples.len() as f64
    }
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new(SAMPLE_WINDOW)
    }
}

/// Timing of one queued operation.
///
/// Records when the item was enqueued. `start` yields the wait time and
/// `finish` yields the processing time; each is measured exactly once.
#[derive(Debug)]
pub struct ItemClock {
    enqueued_at: Instant,
}

/// An [`ItemClock`] for an operation that has started running.
#[derive(Debug)]
pub struct RunningClock {
    started_at: Instant,
}

impl ItemClock {
    /// Starts the clock at enqueue time.
    pub fn enqueued() -> Self {
        Self {
            enqueued_at: Instant::now(),
        }
    }

    /// Marks the operation as started and returns the time it waited.
    pub fn start(self) -> (RunningClock, Duration) {
        let started_at = Instant::now();
        let waited = started_at.saturating_duration_since(self.enqueued_at);
        (RunningClock { started_at }, waited)
    }
}

impl RunningClock {
    /// Marks the operation as finished and returns how long it ran.
    pub fn finish(self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Cumulative queue counters.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Operations that ran to completion, successful or not.
    pub processed: u64,
    /// Operations whose result was an error. A subset of `processed`.
    pub errored: u64,
    /// Enqueue attempts refused for capacity.
    pub rejected: u64,
    /// Pending operations discarded by `clear` or `drain`.
    pub cleared: u64,
    /// Enqueue to start.
    pub wait: SampleWindow,
    /// Start to completion.
    pub process: SampleWindow,
}

impl QueueMetrics {
    /// Records a completed operation.
    pub fn record_completion(&mut self, process_time: Duration, failed: bool) {
        self.processed += 1;
        if failed {
            self.errored += 1;
        }
        self.process.record(process_time);
    }
}

/// Lifecycle state of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Created but not yet bound to a backend.
    Uninitialized,
    /// Accepting and running operations.
    Running,
    /// Finishing active operations; no new work accepted.
    Draining,
    /// Fully drained.
    Stopped,
}

impl QueueState {
    /// Returns the string label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// A point-in-time snapshot of queue health.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Lifecycle state.
    pub state: QueueState,
    /// Operations waiting for admission.
    pub pending: usize,
    /// Operations currently running.
    pub active: usize,
    /// Operations that ran to completion.
    pub processed: u64,
    /// Operations that completed with an error.
    pub errored: u64,
    /// Enqueue attempts refused for capacity.
    pub rejected: u64,
    /// Pending operations discarded.
    pub cleared: u64,
    /// Moving average of wait time in milliseconds.
    pub avg_wait_ms: f64,
    /// Moving average of processing time in milliseconds.
    pub avg_process_ms: f64,
    /// Rate-limit tokens available, `None` when unlimited.
    pub available_tokens: Option<f64>,
}
