use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roombook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roombook_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking requests created.
pub const REQUESTS_CREATED_TOTAL: &str = "roombook_requests_created_total";

/// Counter: status transitions. Labels: from, to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "roombook_status_transitions_total";

/// Counter: operations that failed because the store was unavailable. Labels: operation.
pub const STORE_UNAVAILABLE_TOTAL: &str = "roombook_store_unavailable_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roombook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roombook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Side channel for store outages: log and count, never alter the caller's result.
pub fn report_unavailable(operation: &'static str, err: &EngineError) {
    tracing::error!(operation, "store unavailable: {err}");
    metrics::counter!(STORE_UNAVAILABLE_TOTAL, "operation" => operation).increment(1);
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterResource { .. } => "register_resource",
        Command::RegisterAccount { .. } => "register_account",
        Command::RegisterGroup { .. } => "register_group",
        Command::CreateRequest { .. } => "create_request",
        Command::UpdateStatus { .. } => "update_status",
        Command::SelectBlockedSlots { .. } => "select_blocked_slots",
        Command::SelectRequests { .. } => "select_requests",
        Command::SelectResources => "select_resources",
    }
}
