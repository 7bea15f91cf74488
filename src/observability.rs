use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: availability checks answered. Labels: source.
pub const AVAILABILITY_CHECKS_TOTAL: &str = "slotcheck_availability_checks_total";

/// Histogram: end-to-end availability check latency in seconds.
pub const CHECK_DURATION_SECONDS: &str = "slotcheck_check_duration_seconds";

// ── Degradation ─────────────────────────────────────────────────

/// Counter: retry waits scheduled. Labels: operation.
pub const RETRY_ATTEMPTS_TOTAL: &str = "slotcheck_retry_attempts_total";

/// Counter: calendar leg failed and the database answer was used. Labels: policy.
pub const CALENDAR_FALLBACKS_TOTAL: &str = "slotcheck_calendar_fallbacks_total";

/// Counter: outbox attempts settled. Labels: op, outcome.
pub const OUTBOX_ENTRIES_TOTAL: &str = "slotcheck_outbox_entries_total";

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
