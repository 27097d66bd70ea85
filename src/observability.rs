use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomkeep_query_duration_seconds";

/// Counter: requests refused because the slot was taken.
pub const CONFLICTS_TOTAL: &str = "roomkeep_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomkeep_connections_rejected_total";

/// Gauge: number of open offices (loaded engines).
pub const OFFICES_ACTIVE: &str = "roomkeep_offices_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomkeep_wal_flush_batch_size";

/// Counter: notifications dropped because the outbox was full.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "roomkeep_notifications_dropped_total";

/// Counter: notifications the sink refused.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "roomkeep_notifications_failed_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectRooms => "select_rooms",
        Command::InsertRoom(_) => "insert_room",
        Command::SelectReservations { .. } => "select_reservations",
        Command::InsertReservation(_) => "insert_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectNotifications => "select_notifications",
        Command::MarkNotificationRead { .. } => "mark_notification_read",
    }
}
