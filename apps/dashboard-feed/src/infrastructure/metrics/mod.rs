//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Records**: Rows received per table, undecodable rows
//! - **Dispatch**: Callback invocations by handler class
//! - **Channels**: Opened/closed channels, release failures, active gauge
//!
//! Recording without an installed recorder is a no-op, so library code
//! records unconditionally.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::records::Table;
use crate::domain::routing::HandlerClass;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// With `listen` set, an HTTP exporter serves `/metrics` on that address
/// (requires a Tokio runtime). Subsequent calls are no-ops.
///
/// # Errors
///
/// Returns `BuildError` if the recorder or listener cannot be installed.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<(), BuildError> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new();
    match listen {
        Some(addr) => builder.with_http_listener(addr).install()?,
        None => {
            builder.install_recorder()?;
        }
    }

    register_metrics();
    let _ = INSTALLED.set(());
    Ok(())
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "dashboard_feed_records_received_total",
        "Rows received from the change feed"
    );
    describe_counter!(
        "dashboard_feed_records_undecodable_total",
        "Rows skipped because they could not be decoded"
    );
    describe_counter!(
        "dashboard_feed_dispatches_total",
        "Callback invocations by handler class"
    );
    describe_counter!(
        "dashboard_feed_channels_opened_total",
        "Channels successfully activated"
    );
    describe_counter!(
        "dashboard_feed_channels_closed_total",
        "Channels released by callers"
    );
    describe_counter!(
        "dashboard_feed_channel_release_failures_total",
        "Channel releases the backend rejected"
    );
    describe_counter!(
        "dashboard_feed_notifications_dropped_total",
        "Notifications dropped because a channel buffer was full"
    );
    describe_gauge!(
        "dashboard_feed_active_channels",
        "Channels currently active"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a row received on a channel.
pub fn record_received(table: Table) {
    counter!(
        "dashboard_feed_records_received_total",
        "table" => table.as_str()
    )
    .increment(1);
}

/// Record a row that failed to decode.
pub fn record_undecodable(table: Table) {
    counter!(
        "dashboard_feed_records_undecodable_total",
        "table" => table.as_str()
    )
    .increment(1);
}

/// Record one callback invocation.
pub fn record_dispatch(class: HandlerClass) {
    counter!(
        "dashboard_feed_dispatches_total",
        "handler" => class.as_str()
    )
    .increment(1);
}

/// Record a channel activation.
pub fn record_channel_opened(table: Table) {
    counter!(
        "dashboard_feed_channels_opened_total",
        "table" => table.as_str()
    )
    .increment(1);
    gauge!("dashboard_feed_active_channels", "table" => table.as_str()).increment(1.0);
}

/// Record a channel release.
pub fn record_channel_closed(table: Table) {
    counter!(
        "dashboard_feed_channels_closed_total",
        "table" => table.as_str()
    )
    .increment(1);
    gauge!("dashboard_feed_active_channels", "table" => table.as_str()).decrement(1.0);
}

/// Record a failed channel release.
pub fn record_release_failure(table: Table) {
    counter!(
        "dashboard_feed_channel_release_failures_total",
        "table" => table.as_str()
    )
    .increment(1);
}

/// Record a notification dropped by a transport adapter.
pub fn record_notification_dropped(table: &str) {
    counter!(
        "dashboard_feed_notifications_dropped_total",
        "table" => table.to_string()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
