//! Periodic reporting of queue and pool health.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::DataCore;
use krapi_queue::QueueState;

/// Logs a stats snapshot every `interval_seconds` until the queue stops.
///
/// Returns immediately when `interval_seconds` is zero.
pub async fn report_stats(core: Arc<DataCore>, interval_seconds: u64) {
    if interval_seconds == 0 {
        return;
    }
    let interval = Duration::from_secs(interval_seconds);

    tracing::info!(interval_seconds, "starting stats reporting task");

    loop {
        sleep(interval).await;

        let stats = core.stats();
        tracing::info!(
            state = stats.queue.state.as_str(),
            pending = stats.queue.pending,
            active = stats.queue.active,
            processed = stats.queue.processed,
            errored = stats.queue.errored,
            rejected = stats.queue.rejected,
            avg_wait_ms = stats.queue.avg_wait_ms,
            avg_process_ms = stats.queue.avg_process_ms,
            open_tenants = stats.pool.open_tenants,
            tenants_evicted = stats.pool.tenants_evicted,
            inferred_routes = stats.inferred_routes,
            "data core stats"
        );

        if stats.queue.state == QueueState::Stopped {
            tracing::debug!("queue stopped, ending stats reporting task");
            break;
        }
    }
}
