//! Metric names and the process-wide tracing and metrics installers.
//!
//! [`BookingArbiter::from_env`](crate::BookingArbiter::from_env) calls both
//! installers. Embedders with their own subscriber or recorder skip them and
//! use [`BookingArbiter::open`](crate::BookingArbiter::open).

use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: arbiter requests. Labels: operation, outcome.
pub const REQUESTS_TOTAL: &str = "roster_requests_total";

/// Histogram: arbiter request latency in seconds, retries included. Labels: operation.
pub const REQUEST_DURATION_SECONDS: &str = "roster_request_duration_seconds";

/// Counter: retries after a retriable rejection. Labels: operation.
pub const RETRIES_TOTAL: &str = "roster_retries_total";

// ── USE metrics (store utilization) ─────────────────────────────

/// Counter: lock waits that exceeded the lock timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "roster_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roster_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roster_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "roster_wal_compactions_total";

/// Install the fmt tracing subscriber. No-op if one is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Label for the `outcome` dimension of [`REQUESTS_TOTAL`].
pub fn outcome_label<T>(result: &Result<T, crate::engine::EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.reason(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use ulid::Ulid;

    #[test]
    fn outcome_labels() {
        let ok: Result<(), EngineError> = Ok(());
        assert_eq!(outcome_label(&ok), "ok");
        let busy: Result<(), EngineError> = Err(EngineError::ConcurrentModification(Ulid::new()));
        assert_eq!(outcome_label(&busy), busy.as_ref().unwrap_err().reason());
    }
}
