pub mod auth;
pub mod config_providers;
pub mod event_sinks;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod memory_cache;

/// Re-export commonly used types from adapters
pub use auth::{AllowAllAuthenticator, StaticTokenAuthenticator};
pub use config_providers::{FileConfigProvider, HttpConfigProvider};
pub use event_sinks::{CompositeEventSink, MetricsEventSink, TracingEventSink};
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_handler::{HttpHandler, router};
pub use memory_cache::MemoryResponseCache;
