use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: method, route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "reservd_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method, route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "reservd_http_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservations accepted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "reservd_reservations_created_total";

/// Counter: reservation writes refused. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "reservd_reservations_rejected_total";

/// Counter: reservations moved to inactive because their end passed.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "reservd_reservations_expired_total";

/// Counter: derived room status changes. Labels: to.
pub const ROOM_TRANSITIONS_TOTAL: &str = "reservd_room_transitions_total";

/// Histogram: duration of one full sweep in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "reservd_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open push-stream subscribers. Labels: topic.
pub const SUBSCRIBERS_ACTIVE: &str = "reservd_subscribers_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
///
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}
