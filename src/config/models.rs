//! Configuration data structures for Portico.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! intentionally serde‑friendly and include defaults so that minimal configs remain concise.
//! They describe the document only; references between routes, aggregates, clusters and
//! resilience policies are resolved (and rejected when dangling) by
//! [`crate::core::snapshot::SnapshotBuilder`].
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_priority() -> i32 {
    1
}

fn default_weight() -> u32 {
    1
}

fn default_sticky_expiry() -> String {
    "30m".to_string()
}

/// Process-wide settings shared by every route.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    /// Public base URL of the gateway, exposed to templates as `{BaseUrl}`.
    pub base_url: Option<String>,
    /// Header carrying the request id. When set, an inbound value is reused or a
    /// new id is generated, forwarded downstream and echoed on the response.
    pub request_id_key: Option<String>,
    /// Extra request headers never copied to the downstream request (hop-by-hop
    /// headers are always excluded).
    pub excluded_headers: Vec<String>,
    /// Resilience policy used by routes that do not name one.
    pub default_resilience_policy: Option<String>,
}

/// Timeout, circuit-breaker and retry parameters referenced by routes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ResiliencePolicyConfig {
    /// Failures within `failure_window` that open the breaker.
    pub failure_threshold: u32,
    pub failure_window: String,
    /// Cooldown before an open breaker admits a trial call.
    pub break_duration: String,
    pub half_open_max_trials: u32,
    /// Per-attempt downstream timeout.
    pub timeout: String,
    /// Additional attempts after a connection failure.
    pub retry_count: u32,
    pub retry_methods: Vec<String>,
    /// Base delay for exponential backoff between attempts.
    pub retry_backoff: String,
    /// Received status codes that count as breaker failures.
    pub failure_status_codes: Vec<u16>,
}

impl Default for ResiliencePolicyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: "30s".to_string(),
            break_duration: "5s".to_string(),
            half_open_max_trials: 1,
            timeout: "90s".to_string(),
            retry_count: 0,
            retry_methods: vec!["GET".to_string(), "HEAD".to_string()],
            retry_backoff: "0ms".to_string(),
            failure_status_codes: Vec::new(),
        }
    }
}

/// `(name, template)` pair applied to request or response headers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HeaderTransform {
    pub name: String,
    pub value: String,
}

/// `(name, template)` pair appended to the downstream query string.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QueryTransform {
    pub name: String,
    pub value: String,
}

/// Response caching for a route.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Time to live, parsed by humantime (e.g. "30s").
    pub ttl: String,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_status_code() -> u16 {
    429
}

fn default_message() -> String {
    "Too Many Requests".to_string()
}

/// Rate limiting discriminator for how keys are derived.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBy {
    Ip,
    Header,
    Route,
}

/// Behaviour when a key could not be extracted (missing IP/header etc.).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    Allow,
    Deny,
}

fn default_on_missing_key() -> MissingKeyPolicy {
    MissingKeyPolicy::Allow
}

/// Per‑route rate limit configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub by: RateLimitBy,
    #[serde(default)]
    pub header_name: Option<String>, // Should be Some if by == Header
    pub requests: u64,
    pub period: String, // Parsed by humantime, e.g., "1s", "5m", "1h"
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_on_missing_key")]
    pub on_missing_key: MissingKeyPolicy,
    /// Keys (IP or header value) that bypass the limiter.
    #[serde(default)]
    pub client_whitelist: Vec<String>,
}

/// Route-level authentication requirement.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RouteAuthenticationConfig {
    /// Scopes of which the caller must hold at least one (empty = any identity).
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
}

/// A single simple route definition.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    #[serde(default)]
    pub id: Option<String>,
    /// Key used by aggregates to reference this route.
    #[serde(default)]
    pub key: Option<String>,
    pub upstream_path_template: String,
    /// Empty means any method.
    #[serde(default)]
    pub upstream_methods: Vec<String>,
    #[serde(default)]
    pub upstream_host: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Absent means the upstream path is forwarded unchanged.
    #[serde(default)]
    pub downstream_path_template: Option<String>,
    #[serde(default)]
    pub downstream_method: Option<String>,
    pub cluster_id: String,
    #[serde(default)]
    pub request_headers: Vec<HeaderTransform>,
    #[serde(default)]
    pub response_headers: Vec<HeaderTransform>,
    #[serde(default)]
    pub add_queries: Vec<QueryTransform>,
    #[serde(default)]
    pub resilience_policy: Option<String>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub authentication: Option<RouteAuthenticationConfig>,
}

impl RouteConfig {
    /// Route forwarding `upstream_path_template` to `cluster_id` for any method.
    pub fn new(upstream_path_template: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            id: None,
            key: None,
            upstream_path_template: upstream_path_template.into(),
            upstream_methods: Vec::new(),
            upstream_host: None,
            priority: default_priority(),
            case_sensitive: false,
            downstream_path_template: None,
            downstream_method: None,
            cluster_id: cluster_id.into(),
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            add_queries: Vec::new(),
            resilience_policy: None,
            cache: None,
            rate_limit: None,
            authentication: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstream_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.upstream_host = Some(host.into());
        self
    }

    pub fn downstream(mut self, template: impl Into<String>) -> Self {
        self.downstream_path_template = Some(template.into());
        self
    }

    pub fn request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push(HeaderTransform {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn response_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers.push(HeaderTransform {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_queries.push(QueryTransform {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn resilience(mut self, policy: impl Into<String>) -> Self {
        self.resilience_policy = Some(policy.into());
        self
    }

    pub fn cache(mut self, ttl: impl Into<String>) -> Self {
        self.cache = Some(CacheConfig {
            ttl: ttl.into(),
            region: None,
        });
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn authenticated<I, S>(mut self, allowed_scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authentication = Some(RouteAuthenticationConfig {
            allowed_scopes: allowed_scopes.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// Composite route fanning out to several keyed routes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AggregateConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub upstream_path_template: String,
    #[serde(default)]
    pub upstream_host: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub route_keys: Vec<String>,
    /// Respond 200 with `null` for failed keys instead of failing the aggregate.
    #[serde(default)]
    pub tolerate_partial_results: bool,
}

impl AggregateConfig {
    pub fn new<I, S>(upstream_path_template: impl Into<String>, route_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: None,
            upstream_path_template: upstream_path_template.into(),
            upstream_host: None,
            priority: default_priority(),
            route_keys: route_keys.into_iter().map(Into::into).collect(),
            tolerate_partial_results: false,
        }
    }

    pub fn tolerate_partial_results(mut self, tolerate: bool) -> Self {
        self.tolerate_partial_results = tolerate;
        self
    }
}

/// Load-balancing policy selector for a cluster.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum LoadBalancerConfig {
    #[default]
    RoundRobin,
    LeastConnection,
    Sticky {
        /// Cookie whose value pins a caller to a destination.
        key: String,
        #[serde(default = "default_sticky_expiry")]
        expiry: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DestinationConfig {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ClusterConfig {
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub destinations: HashMap<String, DestinationConfig>,
}

impl ClusterConfig {
    pub fn new(load_balancer: LoadBalancerConfig) -> Self {
        Self {
            load_balancer,
            health_check: None,
            destinations: HashMap::new(),
        }
    }

    pub fn destination(mut self, id: impl Into<String>, address: impl Into<String>) -> Self {
        self.destinations.insert(
            id.into(),
            DestinationConfig {
                address: address.into(),
                weight: default_weight(),
            },
        );
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }
}

/// Identity granted to a bearer token by the static authenticator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub subject: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthenticationConfig {
    pub tokens: HashMap<String, TokenGrant>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub resilience_policies: HashMap<String, ResiliencePolicyConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub aggregates: Vec<AggregateConfig>,
    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,
    #[serde(default)]
    pub authentication: AuthenticationConfig,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            global: GlobalConfig::default(),
            resilience_policies: HashMap::new(),
            routes: Vec::new(),
            aggregates: Vec::new(),
            clusters: HashMap::new(),
            authentication: AuthenticationConfig::default(),
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<String>,
    global: GlobalConfig,
    resilience_policies: HashMap<String, ResiliencePolicyConfig>,
    routes: Vec<RouteConfig>,
    aggregates: Vec<AggregateConfig>,
    clusters: HashMap<String, ClusterConfig>,
    authentication: AuthenticationConfig,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Replace the global section
    pub fn global(mut self, global: GlobalConfig) -> Self {
        self.global = global;
        self
    }

    /// Register a named resilience policy
    pub fn resilience_policy(
        mut self,
        name: impl Into<String>,
        policy: ResiliencePolicyConfig,
    ) -> Self {
        self.resilience_policies.insert(name.into(), policy);
        self
    }

    /// Append a route (declaration order breaks matching ties)
    pub fn route(mut self, route: RouteConfig) -> Self {
        self.routes.push(route);
        self
    }

    /// Append a composite route
    pub fn aggregate(mut self, aggregate: AggregateConfig) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    /// Add a cluster under the given id
    pub fn cluster(mut self, id: impl Into<String>, cluster: ClusterConfig) -> Self {
        self.clusters.insert(id.into(), cluster);
        self
    }

    /// Grant an identity to a bearer token
    pub fn token(mut self, token: impl Into<String>, grant: TokenGrant) -> Self {
        self.authentication.tokens.insert(token.into(), grant);
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        if self.routes.is_empty() && self.aggregates.is_empty() {
            return Err("At least one route must be configured".to_string());
        }

        Ok(ServerConfig {
            listen_addr: self
                .listen_addr
                .unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            global: self.global,
            resilience_policies: self.resilience_policies,
            routes: self.routes,
            aggregates: self.aggregates,
            clusters: self.clusters,
            authentication: self.authentication,
        })
    }
}

/// Active health probing for a cluster's destinations.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 2,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}
