use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "rentd_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "rentd_query_duration_seconds";

/// Counter: booking writes refused by the engine. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "rentd_booking_rejections_total";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "rentd_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rentd_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rentd_connections_rejected_total";

/// Gauge: listings held in memory.
pub const LISTINGS_ACTIVE: &str = "rentd_listings_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rentd_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "rentd_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "rentd_wal_compactions_total";

/// Start the Prometheus exporter on `port`. No-op when the port is unset.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertListing { .. } => "insert_listing",
        Command::UpdateListing { .. } => "update_listing",
        Command::DeleteListing { .. } => "delete_listing",
        Command::SelectListings { .. } => "select_listings",
        Command::InsertBooking(_) => "insert_booking",
        Command::BatchInsertBookings { .. } => "batch_insert_bookings",
        Command::UpdateBooking { .. } => "update_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectQuote { .. } => "select_quote",
        Command::InsertReview { .. } => "insert_review",
        Command::DeleteReview { .. } => "delete_review",
        Command::SelectReviews { .. } => "select_reviews",
    }
}
