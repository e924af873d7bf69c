//! Background tasks: the queue dispatcher loop and the WAL compactor.

use std::sync::Arc;
use std::time::Duration;

use crate::queue::Dispatcher;
use crate::store::Store;

/// Poll the notification queue forever. Each tick runs one processing pass;
/// a pass that finds nothing due is silent.
pub async fn run_dispatcher(
    store: Arc<Store>,
    dispatcher: Dispatcher,
    poll_interval: Duration,
    batch_limit: usize,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let processed = store.process_pending(&dispatcher, batch_limit).await;
        if processed > 0 {
            tracing::info!("dispatched {processed} notifications");
        }
    }
}

/// Compact the WAL whenever enough appends have accumulated since the last
/// compaction.
pub async fn run_compactor(store: Arc<Store>, check_interval: Duration, threshold: u64) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends >= threshold {
            match store.compact_wal().await {
                Ok(()) => tracing::info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
