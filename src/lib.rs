//! Portico - an API gateway with template routing, load balancing, circuit
//! breaking and response aggregation.
//!
//! Portico accepts upstream HTTP requests, matches them against path
//! templates, picks a destination from the matched route's cluster and
//! forwards the rewritten request, returning the destination's response or a
//! synthesized error. Cross-cutting policies (header and query rewriting,
//! authentication, rate limiting, caching, retries with a circuit breaker)
//! are declared per route. Composite routes fan out to several routes at once
//! and merge their JSON bodies.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portico::{ConfigStore, GatewayService, HttpClientAdapter, HttpHandler, adapters::router};
//! use portico::ports::event_sink::NoopEventSink;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = portico::config::load_config("config.toml").await?;
//! let store = Arc::new(ConfigStore::from_config(&config, Arc::new(NoopEventSink)).await?);
//! let gateway = GatewayService::new(store, Arc::new(HttpClientAdapter::new()?));
//! let app = router(Arc::new(HttpHandler::new(gateway)));
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while the routing pipeline lives in `core`. The core never performs I/O
//! directly: downstream calls go through [`ports::http_client::DownstreamClient`],
//! observability through [`ports::event_sink::EventSink`].
//!
//! Configuration is published as immutable, versioned snapshots. A request
//! pins the snapshot current at its start; reloads swap the reference
//! atomically and carry destination health and breaker state across.
//!
//! # Error Handling
//! Request-path failures are [`core::GatewayError`] values mapped to exact
//! status codes. Application plumbing returns `eyre::Result<T>` with
//! `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`; the active snapshot sits behind
//! `arc_swap::ArcSwap`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HealthChecker, HttpClientAdapter, HttpHandler},
    core::{ConfigStore, GatewayError, GatewayRequest, GatewayResponse, GatewayService},
    utils::GracefulShutdown,
};
