//! Metric names and the Prometheus exporter.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};

pub const BOOKINGS_TOTAL: &str = "slotd_bookings_total";
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotd_booking_conflicts_total";
pub const UPDATES_TOTAL: &str = "slotd_appointment_updates_total";
pub const QUEUE_PROCESSED_TOTAL: &str = "slotd_queue_processed_total";
pub const QUEUE_FAILED_TOTAL: &str = "slotd_queue_failed_total";
pub const QUEUE_PENDING: &str = "slotd_queue_pending";
pub const DISPATCH_DURATION_SECONDS: &str = "slotd_dispatch_duration_seconds";
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install the Prometheus recorder and, when a port is given, serve the
/// scrape endpoint on it. Call once at startup; metric macros are no-ops
/// before this (and in tests, which never call it).
pub fn init(port: Option<u16>) {
    let builder = PrometheusBuilder::new();
    let result = match port {
        Some(port) => builder
            .with_http_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .install()
            .map(|_| ()),
        None => builder.install_recorder().map(|_| ()),
    };
    if let Err(e) = result {
        tracing::warn!("metrics exporter not installed: {e}");
    }
}
