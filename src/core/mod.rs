pub mod aggregator;
pub mod backend;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod load_balancer;
pub mod pipeline;
pub mod rate_limiter;
pub mod resilience;
pub mod route_matcher;
pub mod snapshot;
pub mod store;
pub mod template;

pub use error::GatewayError;
pub use gateway::{GatewayRequest, GatewayResponse, GatewayService};
pub use load_balancer::LoadBalancerFactory;
pub use rate_limiter::RouteRateLimiter;
pub use store::ConfigStore;
