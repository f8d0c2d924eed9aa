//! The bounded priority queue and its scheduler loop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::time::sleep;

use crate::bucket::TokenBucket;
use crate::error::QueueError;
use crate::metrics::{ItemClock, QueueMetrics, QueueState, QueueStats, RunningClock};

/// Tunables for an [`OperationQueue`].
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Maximum number of operations running at once.
    pub max_concurrency: usize,
    /// Admissions per second. `0` disables rate limiting.
    pub rate_limit_per_sec: u32,
    /// Maximum number of pending operations.
    pub max_size: usize,
    /// When `false`, priorities are ignored and the queue is pure FIFO.
    pub priority_enabled: bool,
    /// How often the scheduler wakes without a notification.
    pub tick: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            rate_limit_per_sec: 100,
            max_size: 1000,
            priority_enabled: true,
            tick: Duration::from_millis(10),
        }
    }
}

/// A unit of work bound to a backend of type `B`.
///
/// `run` returns `true` when the operation failed. `reject` resolves the
/// waiting caller without running the operation.
pub trait Job<B>: Send {
    /// Runs the operation against the backend.
    fn run(self: Box<Self>, backend: &B) -> bool;
    /// Resolves the caller with `reason` instead of running.
    fn reject(self: Box<Self>, reason: QueueError);
}

struct Task<F, T, E> {
    op: F,
    reply: oneshot::Sender<Result<T, E>>,
}

impl<B, F, T, E> Job<B> for Task<F, T, E>
where
    F: FnOnce(&B) -> Result<T, E> + Send,
    T: Send,
    E: From<QueueError> + Send,
{
    fn run(self: Box<Self>, backend: &B) -> bool {
        let Task { op, reply } = *self;
        let result = op(backend);
        let failed = result.is_err();
        // The caller may have stopped waiting; the result is dropped then.
        let _ = reply.send(result);
        failed
    }

    fn reject(self: Box<Self>, reason: QueueError) {
        let _ = self.reply.send(Err(E::from(reason)));
    }
}

/// Resolves with the result of an enqueued operation.
///
/// If the operation is dropped without a result (for example because it
/// panicked), the completion resolves with [`QueueError::Abandoned`].
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> Future for Completion<T, E>
where
    E: From<QueueError>,
{
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(E::from(QueueError::Abandoned))))
    }
}

struct Pending<B> {
    priority: i32,
    seq: u64,
    clock: ItemClock,
    job: Box<dyn Job<B>>,
}

impl<B> PartialEq for Pending<B> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<B> Eq for Pending<B> {}

impl<B> PartialOrd for Pending<B> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<B> Ord for Pending<B> {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared<B> {
    state: QueueState,
    backend: Option<Arc<B>>,
    runtime: Option<Handle>,
    pending: BinaryHeap<Pending<B>>,
    active: usize,
    next_seq: u64,
    bucket: Option<TokenBucket>,
    metrics: QueueMetrics,
}

struct Inner<B> {
    settings: QueueSettings,
    shared: Mutex<Shared<B>>,
    /// Wakes the scheduler loop.
    wake: Notify,
    /// Signalled whenever the active count drops to zero.
    idle: Notify,
}

impl<B: Send + Sync + 'static> Inner<B> {
    fn lock(&self) -> MutexGuard<'_, Shared<B>> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("operation queue lock poisoned, recovering with current state");
                poisoned.into_inner()
            }
        }
    }

    /// Admits pending operations while concurrency and tokens allow.
    fn admit(self: &Arc<Self>) -> QueueState {
        let mut shared = self.lock();
        if shared.state != QueueState::Running {
            return shared.state;
        }
        let (Some(backend), Some(runtime)) = (shared.backend.clone(), shared.runtime.clone())
        else {
            return shared.state;
        };

        let now = Instant::now();
        while shared.active < self.settings.max_concurrency && !shared.pending.is_empty() {
            if let Some(bucket) = shared.bucket.as_mut() {
                if !bucket.try_take(now) {
                    break;
                }
            }
            let Some(item) = shared.pending.pop() else {
                break;
            };
            let (running, waited) = item.clock.start();
            shared.metrics.wait.record(waited);
            shared.active += 1;

            tracing::trace!(priority = item.priority, seq = item.seq, "admitting operation");
            let inner = Arc::clone(self);
            let backend = Arc::clone(&backend);
            let job = item.job;
            runtime.spawn(async move {
                let res = tokio::task::spawn_blocking(move || job.run(&backend)).await;
                let failed = match res {
                    Ok(failed) => failed,
                    Err(e) => {
                        tracing::error!("queued operation did not complete: {}", e);
                        true
                    }
                };
                inner.complete(running, failed);
            });
        }
        shared.state
    }

    fn complete(self: &Arc<Self>, running: RunningClock, failed: bool) {
        let process_time = running.finish();
        {
            let mut shared = self.lock();
            shared.active = shared.active.saturating_sub(1);
            shared.metrics.record_completion(process_time, failed);
            if shared.active == 0 {
                self.idle.notify_waiters();
            }
        }
        self.admit();
    }

    /// Rejects every pending operation with `Cleared`.
    fn clear(&self) -> usize {
        let drained: Vec<Pending<B>> = {
            let mut shared = self.lock();
            let drained: Vec<_> = shared.pending.drain().collect();
            shared.metrics.cleared += drained.len() as u64;
            drained
        };
        let count = drained.len();
        for item in drained {
            item.job.reject(QueueError::Cleared);
        }
        count
    }
}

async fn run_scheduler<B: Send + Sync + 'static>(inner: Arc<Inner<B>>) {
    let tick = inner.settings.tick;
    loop {
        if inner.admit() == QueueState::Stopped {
            break;
        }
        // Only the scheduler still holds the queue and nothing is running.
        if Arc::strong_count(&inner) == 1 {
            break;
        }
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = sleep(tick) => {}
        }
    }
    tracing::debug!("operation queue scheduler stopped");
}

/// A bounded, prioritized, rate-limited queue of operations against a
/// shared backend.
///
/// Cloning the queue yields another handle to the same queue.
pub struct OperationQueue<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for OperationQueue<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Send + Sync + 'static> OperationQueue<B> {
    /// Creates an uninitialized queue.
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state: QueueState::Uninitialized,
                    backend: None,
                    runtime: None,
                    pending: BinaryHeap::new(),
                    active: 0,
                    next_seq: 0,
                    bucket: None,
                    metrics: QueueMetrics::default(),
                }),
                settings,
                wake: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// The queue's settings.
    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Binds the backend and starts the scheduler on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::AlreadyInitialized` on a second call and
    /// `QueueError::RuntimeUnavailable` outside a tokio runtime.
    pub fn initialize(&self, backend: Arc<B>) -> Result<(), QueueError> {
        let runtime = Handle::try_current().map_err(|_| QueueError::RuntimeUnavailable)?;
        {
            let mut shared = self.inner.lock();
            if shared.state != QueueState::Uninitialized {
                return Err(QueueError::AlreadyInitialized);
            }
            shared.backend = Some(backend);
            shared.runtime = Some(runtime.clone());
            shared.bucket = match self.inner.settings.rate_limit_per_sec {
                0 => None,
                rate => Some(TokenBucket::new(rate, Instant::now())),
            };
            shared.state = QueueState::Running;
        }

        let settings = &self.inner.settings;
        tracing::info!(
            max_concurrency = settings.max_concurrency,
            rate_limit_per_sec = settings.rate_limit_per_sec,
            max_size = settings.max_size,
            priority_enabled = settings.priority_enabled,
            "operation queue initialized"
        );
        runtime.spawn(run_scheduler(Arc::clone(&self.inner)));
        Ok(())
    }

    /// Enqueues `op` at `priority` (higher runs first).
    ///
    /// The returned [`Completion`] resolves with the operation's result.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NotInitialized` before `initialize`,
    /// `QueueError::ShuttingDown` once draining has begun and
    /// `QueueError::CapacityExceeded` when the backlog is full.
    pub fn enqueue<F, T, E>(&self, op: F, priority: i32) -> Result<Completion<T, E>, QueueError>
    where
        F: FnOnce(&B) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        {
            let mut shared = self.inner.lock();
            match shared.state {
                QueueState::Running => {}
                QueueState::Uninitialized => return Err(QueueError::NotInitialized),
                QueueState::Draining | QueueState::Stopped => {
                    return Err(QueueError::ShuttingDown)
                }
            }

            let max_size = self.inner.settings.max_size;
            if shared.pending.len() >= max_size {
                shared.metrics.rejected += 1;
                tracing::warn!(max_size, "operation queue full, rejecting operation");
                return Err(QueueError::CapacityExceeded { max_size });
            }

            let priority = if self.inner.settings.priority_enabled {
                priority
            } else {
                0
            };
            let seq = shared.next_seq;
            shared.next_seq += 1;
            shared.pending.push(Pending {
                priority,
                seq,
                clock: ItemClock::enqueued(),
                job: Box::new(Task { op, reply }),
            });
        }
        self.inner.wake.notify_one();
        Ok(Completion { rx })
    }

    /// Rejects every pending operation with `QueueError::Cleared` and
    /// returns how many were discarded. Active operations are unaffected.
    pub fn clear(&self) -> usize {
        let count = self.inner.clear();
        if count > 0 {
            tracing::info!(count, "cleared pending operations");
        }
        count
    }

    /// Stops accepting work, waits for active operations to finish, then
    /// rejects everything still pending.
    ///
    /// Calling `drain` again, or concurrently, waits for the same outcome.
    pub async fn drain(&self) {
        {
            let mut shared = self.inner.lock();
            match shared.state {
                QueueState::Uninitialized => {
                    shared.state = QueueState::Stopped;
                    return;
                }
                QueueState::Running => {
                    shared.state = QueueState::Draining;
                    tracing::info!(
                        pending = shared.pending.len(),
                        active = shared.active,
                        "draining operation queue"
                    );
                }
                QueueState::Draining | QueueState::Stopped => {}
            }
        }

        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.inner.lock().active == 0 {
                break;
            }
            idle.await;
        }

        let cleared = self.inner.clear();
        {
            let mut shared = self.inner.lock();
            if shared.state != QueueState::Stopped {
                shared.state = QueueState::Stopped;
                tracing::info!(cleared, "operation queue stopped");
            }
        }
        self.inner.wake.notify_one();
    }

    /// A snapshot of queue health.
    pub fn stats(&self) -> QueueStats {
        let mut shared = self.inner.lock();
        let available_tokens = shared.bucket.as_mut().map(|bucket| {
            bucket.refill(Instant::now());
            bucket.available()
        });
        QueueStats {
            state: shared.state,
            pending: shared.pending.len(),
            active: shared.active,
            processed: shared.metrics.processed,
            errored: shared.metrics.errored,
            rejected: shared.metrics.rejected,
            cleared: shared.metrics.cleared,
            avg_wait_ms: shared.metrics.wait.average_ms(),
            avg_process_ms: shared.metrics.process.average_ms(),
            available_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(priority: i32, seq: u64) -> Pending<()> {
        let (reply, _rx) = oneshot::channel::<Result<(), QueueError>>();
        Pending {
            priority,
            seq,
            clock: ItemClock::enqueued(),
            job: Box::new(Task {
                op: |_: &()| Ok(()),
                reply,
            }),
        }
    }

    #[test]
    fn heap_orders_by_priority_then_arrival() {
        let mut heap = BinaryHeap::new();
        for (priority, seq) in [(1, 0), (5, 1), (1, 2), (5, 3), (0, 4)] {
            heap.push(pending(priority, seq));
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|p| (p.priority, p.seq))
            .collect();
        assert_eq!(order, vec![(5, 1), (5, 3), (1, 0), (1, 2), (0, 4)]);
    }

    #[test]
    fn initialize_requires_a_runtime() {
        let queue: OperationQueue<()> = OperationQueue::new(QueueSettings::default());
        assert_eq!(
            queue.initialize(Arc::new(())),
            Err(QueueError::RuntimeUnavailable)
        );
        assert_eq!(queue.state(), QueueState::Uninitialized);
    }
}
