//! Named observability events emitted by the routing pipeline.
//!
//! The core only produces [`GatewayEvent`]s; how they are logged, counted or
//! exported is up to the [`EventSink`] the gateway was built with.
use std::time::Duration;

use http::{Method, StatusCode};

use crate::core::circuit_breaker::BreakerState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum GatewayEvent {
    RouteMatched {
        request_id: String,
        route_id: String,
        method: Method,
        path: String,
    },
    RouteUnmatched {
        request_id: String,
        method: Method,
        path: String,
    },
    DestinationSelected {
        request_id: String,
        cluster_id: String,
        destination_id: String,
        attempt: u32,
    },
    BreakerTransition {
        cluster_id: String,
        destination_id: String,
        from: BreakerState,
        to: BreakerState,
    },
    DispatchFailed {
        request_id: String,
        cluster_id: String,
        destination_id: String,
        /// Taxonomy code, e.g. `connection_failure`
        kind: &'static str,
        detail: String,
        attempt: u32,
    },
    /// A downstream answered normally with a 5xx status; passed through as is.
    DownstreamErrorStatus {
        request_id: String,
        cluster_id: String,
        destination_id: String,
        status: StatusCode,
    },
    ConfigurationPublished {
        generation: u64,
        routes: usize,
        clusters: usize,
    },
    ConfigurationRejected {
        reason: String,
    },
    RequestCompleted {
        request_id: String,
        route_id: Option<String>,
        method: Method,
        status: StatusCode,
        elapsed: Duration,
    },
}

impl GatewayEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::RouteMatched { .. } => "route_matched",
            GatewayEvent::RouteUnmatched { .. } => "route_unmatched",
            GatewayEvent::DestinationSelected { .. } => "destination_selected",
            GatewayEvent::BreakerTransition { .. } => "breaker_transition",
            GatewayEvent::DispatchFailed { .. } => "dispatch_failed",
            GatewayEvent::DownstreamErrorStatus { .. } => "downstream_error_status",
            GatewayEvent::ConfigurationPublished { .. } => "configuration_published",
            GatewayEvent::ConfigurationRejected { .. } => "configuration_rejected",
            GatewayEvent::RequestCompleted { .. } => "request_completed",
        }
    }

    /// Severity sinks should report the event at.
    pub fn level(&self) -> EventLevel {
        match self {
            GatewayEvent::RouteMatched { .. } | GatewayEvent::DestinationSelected { .. } => {
                EventLevel::Debug
            }
            GatewayEvent::RouteUnmatched { .. }
            | GatewayEvent::ConfigurationPublished { .. }
            | GatewayEvent::RequestCompleted { .. } => EventLevel::Info,
            GatewayEvent::BreakerTransition { to, .. } => match to {
                BreakerState::Closed => EventLevel::Info,
                BreakerState::Open | BreakerState::HalfOpen => EventLevel::Warn,
            },
            GatewayEvent::DispatchFailed { .. } | GatewayEvent::DownstreamErrorStatus { .. } => {
                EventLevel::Warn
            }
            GatewayEvent::ConfigurationRejected { .. } => EventLevel::Error,
        }
    }
}

/// Consumer of gateway events. Called inline on the request path, so
/// implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &GatewayEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &GatewayEvent) {}
}
