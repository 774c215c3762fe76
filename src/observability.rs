use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservation operations. Labels: op, outcome.
pub const TRANSITIONS_TOTAL: &str = "estatebook_transitions_total";

/// Histogram: committed transition latency in seconds. Labels: op.
pub const TRANSITION_DURATION_SECONDS: &str = "estatebook_transition_duration_seconds";

/// Counter: bookings, proposals and locks refused for overlap.
pub const BOOKING_CONFLICTS_TOTAL: &str = "estatebook_booking_conflicts_total";

/// Counter: reservations moved to COMPLETED. Labels: trigger (scheduler, sweep, manual).
pub const COMPLETIONS_TOTAL: &str = "estatebook_completions_total";

// ── Scheduler ───────────────────────────────────────────────────

/// Counter: completion jobs armed or re-armed.
pub const JOBS_ARMED_TOTAL: &str = "estatebook_jobs_armed_total";

/// Counter: completion jobs disarmed.
pub const JOBS_CANCELED_TOTAL: &str = "estatebook_jobs_canceled_total";

/// Counter: schedule/reschedule calls the job queue refused.
pub const SCHEDULE_FAILURES_TOTAL: &str = "estatebook_schedule_failures_total";

/// Gauge: confirmed reservations waiting for a job to be armed.
pub const RECONCILIATION_BACKLOG: &str = "estatebook_reconciliation_backlog";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: registered estates.
pub const ESTATES_ACTIVE: &str = "estatebook_estates_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "estatebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "estatebook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn record_transition(op: &'static str, outcome: &'static str) {
    metrics::counter!(TRANSITIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
}
