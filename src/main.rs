use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use slotd::queue::{Dispatcher, LogAdapter};
use slotd::store::Store;
use slotd::worker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotd::observability::init(metrics_port);

    let data_dir = std::env::var("SLOTD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let poll_interval_secs: u64 = std::env::var("SLOTD_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(15);
    let batch_limit: usize = std::env::var("SLOTD_BATCH_LIMIT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);
    let dispatch_timeout_ms: u64 = std::env::var("SLOTD_DISPATCH_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);
    let compact_threshold: u64 = std::env::var("SLOTD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("slotd.wal");

    let store = Arc::new(Store::open(wal_path)?);
    let dispatcher = Dispatcher::new(
        Arc::new(LogAdapter::new("email")),
        Some(Arc::new(LogAdapter::new("messaging"))),
        Duration::from_millis(dispatch_timeout_ms),
    );

    info!("slotd started");
    info!("  data_dir: {data_dir}");
    info!("  poll_interval: {poll_interval_secs}s, batch_limit: {batch_limit}");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    let dispatcher_task = tokio::spawn(worker::run_dispatcher(
        store.clone(),
        dispatcher,
        Duration::from_secs(poll_interval_secs),
        batch_limit,
    ));
    let compactor_task = tokio::spawn(worker::run_compactor(
        store.clone(),
        Duration::from_secs(60),
        compact_threshold,
    ));

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    dispatcher_task.abort();
    compactor_task.abort();

    // Final compaction leaves a minimal WAL for the next start.
    if let Err(e) = store.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("slotd stopped");
    Ok(())
}
