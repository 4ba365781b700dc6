use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking transactions. Labels: op (book, update, delete), status.
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Histogram: booking transaction latency in seconds. Labels: op.
pub const BOOKING_DURATION_SECONDS: &str = "slotbook_booking_duration_seconds";

/// Histogram: time spent waiting for a (staff, day) booking lock, in seconds.
pub const BOOKING_LOCK_WAIT_SECONDS: &str = "slotbook_booking_lock_wait_seconds";

/// Counter: availability queries. Labels: scope (staff, across).
pub const AVAILABILITY_QUERIES_TOTAL: &str = "slotbook_availability_queries_total";

/// Histogram: availability computation latency in seconds. Labels: scope.
pub const AVAILABILITY_DURATION_SECONDS: &str = "slotbook_availability_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: appointments currently held in memory.
pub const APPOINTMENTS_ACTIVE: &str = "slotbook_appointments_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Label for a booking outcome.
pub fn status_label<T>(result: &Result<T, crate::engine::EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    }
}
