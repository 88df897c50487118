//! Lightweight metrics helpers for Portico.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. No exporter is embedded; the
//! application installs whichever recorder it likes.
//!
//! Provided metrics (labels vary by family):
//! * `portico_requests_total` (counter)
//! * `portico_request_duration_seconds` (histogram)
//! * `portico_destination_requests_total` (counter)
//! * `portico_destination_request_duration_seconds` (histogram)
//! * `portico_destination_health_status` (gauge per destination)
//! * `portico_breaker_transitions_total` (counter)
//! * `portico_dispatch_failures_total` (counter)
//! * `portico_route_unmatched_total` (counter)
//! * `portico_config_reloads_total` (counter)
//! * `portico_active_requests` (gauge)
//!
//! The `*_timer` structs leverage `Drop` to record durations even when early
//! returns or errors occur.
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const PORTICO_REQUESTS_TOTAL: &str = "portico_requests_total";
pub const PORTICO_REQUEST_DURATION_SECONDS: &str = "portico_request_duration_seconds";
pub const PORTICO_DESTINATION_REQUESTS_TOTAL: &str = "portico_destination_requests_total";
pub const PORTICO_DESTINATION_REQUEST_DURATION_SECONDS: &str =
    "portico_destination_request_duration_seconds";
pub const PORTICO_DESTINATION_HEALTH_STATUS: &str = "portico_destination_health_status";
pub const PORTICO_BREAKER_TRANSITIONS_TOTAL: &str = "portico_breaker_transitions_total"; // labels: cluster, destination, to
pub const PORTICO_DISPATCH_FAILURES_TOTAL: &str = "portico_dispatch_failures_total"; // labels: cluster, kind
pub const PORTICO_ROUTE_UNMATCHED_TOTAL: &str = "portico_route_unmatched_total";
pub const PORTICO_CONFIG_RELOADS_TOTAL: &str = "portico_config_reloads_total"; // labels: outcome
pub const PORTICO_ACTIVE_REQUESTS: &str = "portico_active_requests";

/// Last reported health per `cluster/destination`
pub static DESTINATION_HEALTH_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_gauge!(
        PORTICO_DESTINATION_HEALTH_STATUS,
        "Health status of individual destinations (1 for healthy, 0 for unhealthy)"
    );
    describe_counter!(
        PORTICO_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        PORTICO_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        PORTICO_DESTINATION_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of attempts forwarded to destinations."
    );
    describe_histogram!(
        PORTICO_DESTINATION_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of attempts forwarded to destinations."
    );
    describe_counter!(
        PORTICO_BREAKER_TRANSITIONS_TOTAL,
        Unit::Count,
        "Circuit breaker state transitions."
    );
    describe_counter!(
        PORTICO_DISPATCH_FAILURES_TOTAL,
        Unit::Count,
        "Failed downstream attempts by failure kind."
    );
    describe_counter!(
        PORTICO_ROUTE_UNMATCHED_TOTAL,
        Unit::Count,
        "Requests that matched no route."
    );
    describe_counter!(
        PORTICO_CONFIG_RELOADS_TOTAL,
        Unit::Count,
        "Configuration publish attempts by outcome."
    );
    describe_gauge!(
        PORTICO_ACTIVE_REQUESTS,
        "Number of currently active requests being processed."
    );

    Mutex::new(HashMap::new())
});

/// Set (and record) the health status gauge for a destination.
pub fn set_destination_health_status(cluster_id: &str, destination_id: &str, is_healthy: bool) {
    let health_value = if is_healthy { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = DESTINATION_HEALTH_GAUGES.lock() {
        gauges.insert(format!("{cluster_id}/{destination_id}"), health_value);
    } else {
        tracing::error!("Failed to acquire lock for destination health gauges");
        return;
    }

    gauge!(
        PORTICO_DESTINATION_HEALTH_STATUS,
        "cluster" => cluster_id.to_string(),
        "destination" => destination_id.to_string()
    )
    .set(health_value);
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(route: &str, method: &str, status: u16) {
    counter!(
        PORTICO_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(route: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        PORTICO_REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment total count of destination attempts.
pub fn increment_destination_request_total(cluster_id: &str, destination_id: &str, outcome: &str) {
    counter!(
        PORTICO_DESTINATION_REQUESTS_TOTAL,
        "cluster" => cluster_id.to_string(),
        "destination" => destination_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed destination attempt duration.
pub fn record_destination_request_duration(
    cluster_id: &str,
    destination_id: &str,
    duration: std::time::Duration,
) {
    histogram!(
        PORTICO_DESTINATION_REQUEST_DURATION_SECONDS,
        "cluster" => cluster_id.to_string(),
        "destination" => destination_id.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_breaker_transition(cluster_id: &str, destination_id: &str, to: &str) {
    counter!(
        PORTICO_BREAKER_TRANSITIONS_TOTAL,
        "cluster" => cluster_id.to_string(),
        "destination" => destination_id.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn increment_dispatch_failure(cluster_id: &str, kind: &str) {
    counter!(
        PORTICO_DISPATCH_FAILURES_TOTAL,
        "cluster" => cluster_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn increment_route_unmatched() {
    counter!(PORTICO_ROUTE_UNMATCHED_TOTAL).increment(1);
}

pub fn increment_config_reload(outcome: &str) {
    counter!(PORTICO_CONFIG_RELOADS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Set current active in‑flight request count.
pub fn set_active_requests(count: u64) {
    gauge!(PORTICO_ACTIVE_REQUESTS).set(count as f64);
}

/// RAII helper measuring one destination attempt.
pub struct DestinationRequestTimer {
    start: Instant,
    cluster_id: String,
    destination_id: String,
}

impl DestinationRequestTimer {
    pub fn new(cluster_id: &str, destination_id: &str) -> Self {
        Self {
            start: Instant::now(),
            cluster_id: cluster_id.to_string(),
            destination_id: destination_id.to_string(),
        }
    }
}

impl Drop for DestinationRequestTimer {
    fn drop(&mut self) {
        record_destination_request_duration(
            &self.cluster_id,
            &self.destination_id,
            self.start.elapsed(),
        );
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Portico metrics system");

    // Force lazy initialization of metrics descriptions
    Lazy::force(&DESTINATION_HEALTH_GAUGES);

    tracing::info!("Portico metrics system initialized successfully");
    Ok(())
}

/// Collect a snapshot of gauge values used for ad‑hoc exports.
pub fn get_current_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();

    if let Ok(gauges) = DESTINATION_HEALTH_GAUGES.lock() {
        for (destination, health) in gauges.iter() {
            metrics.insert(format!("destination_health_{destination}"), *health);
        }
    }

    metrics
}
