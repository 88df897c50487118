//! [`EventSink`] implementations: structured logging, metric counters and a
//! fan-out composite.
use std::sync::Arc;

use crate::{
    metrics::{increment_breaker_transition, increment_dispatch_failure},
    ports::event_sink::{EventLevel, EventSink, GatewayEvent},
};

/// Logs every event through `tracing` at the event's own level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &GatewayEvent) {
        let name = event.name();
        match event.level() {
            EventLevel::Debug => tracing::debug!(event = name, "{:?}", event),
            EventLevel::Info => tracing::info!(event = name, "{:?}", event),
            EventLevel::Warn => tracing::warn!(event = name, "{:?}", event),
            EventLevel::Error => tracing::error!(event = name, "{:?}", event),
        }
    }
}

/// Counts breaker transitions and dispatch failures. Request and attempt
/// metrics are recorded inline by the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsEventSink;

impl EventSink for MetricsEventSink {
    fn emit(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::BreakerTransition {
                cluster_id,
                destination_id,
                to,
                ..
            } => increment_breaker_transition(cluster_id, destination_id, &to.to_string()),
            GatewayEvent::DispatchFailed {
                cluster_id, kind, ..
            } => increment_dispatch_failure(cluster_id, kind),
            _ => {}
        }
    }
}

/// Forwards each event to every inner sink in order.
#[derive(Default, Clone)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for CompositeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventSink for CompositeEventSink {
    fn emit(&self, event: &GatewayEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
