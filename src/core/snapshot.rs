//! Immutable, versioned view of the routing configuration.
//!
//! A [`ConfigSnapshot`] is only ever produced by [`SnapshotBuilder`], which
//! refuses to build when any reference (route → cluster, route → resilience
//! policy, aggregate → route key) does not resolve. Once published it is never
//! mutated; a reload builds a new one.
use std::{collections::HashMap, sync::Arc, time::Duration};

use http::{HeaderName, Method};

use crate::{
    config::{
        GlobalConfig, HealthCheckConfig, RateLimitConfig, ResiliencePolicyConfig, RouteConfig,
        ServerConfig,
    },
    core::{
        backend::{Destination, DestinationRuntime, DestinationUrl},
        error::GatewayError,
        load_balancer::{LoadBalancer, LoadBalancerFactory},
        rate_limiter::RouteRateLimiter,
        resilience::ResiliencePolicy,
        route_matcher::{PathTemplate, RouteMatch, RouteTable},
    },
};

/// Identity under which destination runtime state survives reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub cluster_id: String,
    pub destination_id: String,
    pub address: DestinationUrl,
}

/// Response caching for a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub region: Option<String>,
}

/// Route-level authentication requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationOptions {
    /// Caller must hold at least one of these (empty = any identity).
    pub allowed_scopes: Vec<String>,
}

#[derive(Debug)]
pub struct Route {
    pub id: String,
    pub key: Option<String>,
    pub upstream: PathTemplate,
    /// Empty means any method.
    pub methods: Vec<Method>,
    pub upstream_host: Option<String>,
    pub priority: i32,
    pub case_sensitive: bool,
    /// Absent means the upstream path is forwarded unchanged.
    pub downstream_path: Option<PathTemplate>,
    pub downstream_method: Option<Method>,
    pub cluster_id: String,
    pub request_headers: Vec<(HeaderName, String)>,
    pub response_headers: Vec<(HeaderName, String)>,
    pub add_queries: Vec<(String, String)>,
    pub resilience: Arc<ResiliencePolicy>,
    pub cache: Option<CachePolicy>,
    /// Settings `rate_limiter` was built from.
    pub rate_limit: Option<RateLimitConfig>,
    pub rate_limiter: Option<RouteRateLimiter>,
    pub authentication: Option<AuthenticationOptions>,
}

#[derive(Debug)]
pub struct Aggregate {
    pub id: String,
    pub upstream: PathTemplate,
    pub upstream_host: Option<String>,
    pub priority: i32,
    /// Sub-routes paired with their keys, in configured order.
    pub routes: Vec<(String, Arc<Route>)>,
    pub tolerate_partial_results: bool,
}

#[derive(Debug)]
pub struct Cluster {
    pub id: String,
    pub balancer: Arc<LoadBalancer>,
    pub health_check: Option<HealthCheckConfig>,
}

impl Cluster {
    pub fn destinations(&self) -> &[Destination] {
        self.balancer.destinations()
    }
}

/// Process-wide settings resolved from the `global` section.
#[derive(Debug, Clone, Default)]
pub struct GlobalSettings {
    pub base_url: Option<String>,
    pub request_id_header: Option<HeaderName>,
    pub excluded_headers: Vec<HeaderName>,
}

#[derive(Debug)]
pub struct ConfigSnapshot {
    generation: u64,
    routes: Vec<Arc<Route>>,
    aggregates: Vec<Arc<Aggregate>>,
    clusters: HashMap<String, Arc<Cluster>>,
    table: RouteTable,
    global: GlobalSettings,
}

impl ConfigSnapshot {
    /// Snapshot with nothing routable, used before the first publish.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            routes: Vec::new(),
            aggregates: Vec::new(),
            clusters: HashMap::new(),
            table: RouteTable::default(),
            global: GlobalSettings::default(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn aggregates(&self) -> &[Arc<Aggregate>] {
        &self.aggregates
    }

    pub fn clusters(&self) -> &HashMap<String, Arc<Cluster>> {
        &self.clusters
    }

    pub fn cluster(&self, id: &str) -> Option<&Arc<Cluster>> {
        self.clusters.get(id)
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.global
    }

    /// Resolve the best route or aggregate for a request.
    pub fn match_request(
        &self,
        method: &Method,
        host: Option<&str>,
        path: &str,
    ) -> Option<RouteMatch> {
        self.table.find(method, host, path)
    }

    /// Every destination identity referenced by this snapshot.
    pub fn destination_keys(&self) -> impl Iterator<Item = DestinationKey> + '_ {
        self.clusters.values().flat_map(|cluster| {
            cluster.destinations().iter().map(|destination| DestinationKey {
                cluster_id: cluster.id.clone(),
                destination_id: destination.id().to_string(),
                address: destination.address().clone(),
            })
        })
    }
}

fn invalid(reason: impl Into<String>) -> GatewayError {
    GatewayError::ConfigurationInvalid {
        reason: reason.into(),
    }
}

fn parse_method(method: &str) -> Result<Method, GatewayError> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| invalid(format!("'{method}' is not a valid HTTP method")))
}

fn parse_header_name(name: &str) -> Result<HeaderName, GatewayError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| invalid(format!("'{name}' is not a valid header name")))
}

/// Destination addresses of a config, sorted by destination id within each cluster.
pub fn destination_keys(config: &ServerConfig) -> Result<Vec<DestinationKey>, GatewayError> {
    let mut keys = Vec::new();
    for (cluster_id, cluster) in &config.clusters {
        let mut ids: Vec<&String> = cluster.destinations.keys().collect();
        ids.sort();
        for destination_id in ids {
            let destination = &cluster.destinations[destination_id];
            let address = DestinationUrl::new(&destination.address).map_err(|e| {
                invalid(format!(
                    "cluster '{cluster_id}' destination '{destination_id}': {e}"
                ))
            })?;
            keys.push(DestinationKey {
                cluster_id: cluster_id.clone(),
                destination_id: destination_id.clone(),
                address,
            });
        }
    }
    Ok(keys)
}

/// Builds a snapshot from a configuration document.
pub struct SnapshotBuilder<'a> {
    config: &'a ServerConfig,
    generation: u64,
    runtimes: HashMap<DestinationKey, Arc<DestinationRuntime>>,
    previous: Option<&'a ConfigSnapshot>,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(config: &'a ServerConfig, generation: u64) -> Self {
        Self {
            config,
            generation,
            runtimes: HashMap::new(),
            previous: None,
        }
    }

    /// Runtime state to reuse for destination identities that already exist.
    pub fn runtimes(mut self, runtimes: HashMap<DestinationKey, Arc<DestinationRuntime>>) -> Self {
        self.runtimes = runtimes;
        self
    }

    /// Snapshot being replaced; its balancers and rate limiters are reused
    /// where the cluster or route limit is unchanged.
    pub fn previous(mut self, previous: &'a ConfigSnapshot) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn build(self) -> Result<ConfigSnapshot, GatewayError> {
        let global = Self::build_global(&self.config.global)?;
        let policies = self.build_policies()?;
        let clusters = self.build_clusters()?;

        let mut routes = Vec::with_capacity(self.config.routes.len());
        for (index, route) in self.config.routes.iter().enumerate() {
            routes.push(Arc::new(self.build_route(
                index, route, &policies, &clusters,
            )?));
        }

        let mut aggregates = Vec::with_capacity(self.config.aggregates.len());
        for (index, aggregate) in self.config.aggregates.iter().enumerate() {
            let id = aggregate
                .id
                .clone()
                .unwrap_or_else(|| format!("aggregate-{index}"));
            let upstream = PathTemplate::parse(&aggregate.upstream_path_template)
                .map_err(|e| invalid(format!("aggregate '{id}': {e}")))?;
            if aggregate.route_keys.is_empty() {
                return Err(invalid(format!("aggregate '{id}' lists no route keys")));
            }

            let mut sub_routes = Vec::with_capacity(aggregate.route_keys.len());
            for key in &aggregate.route_keys {
                let route = routes
                    .iter()
                    .find(|route| route.key.as_deref() == Some(key.as_str()))
                    .ok_or_else(|| {
                        invalid(format!("aggregate '{id}' references unknown route key '{key}'"))
                    })?;
                sub_routes.push((key.clone(), Arc::clone(route)));
            }

            aggregates.push(Arc::new(Aggregate {
                id,
                upstream,
                upstream_host: aggregate.upstream_host.clone(),
                priority: aggregate.priority,
                routes: sub_routes,
                tolerate_partial_results: aggregate.tolerate_partial_results,
            }));
        }

        let mut table = RouteTable::builder();
        for route in &routes {
            table.route(Arc::clone(route));
        }
        for aggregate in &aggregates {
            table.aggregate(Arc::clone(aggregate));
        }

        Ok(ConfigSnapshot {
            generation: self.generation,
            routes,
            aggregates,
            clusters,
            table: table.build(),
            global,
        })
    }

    fn build_global(global: &GlobalConfig) -> Result<GlobalSettings, GatewayError> {
        Ok(GlobalSettings {
            base_url: global
                .base_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
            request_id_header: global
                .request_id_key
                .as_deref()
                .map(parse_header_name)
                .transpose()?,
            excluded_headers: global
                .excluded_headers
                .iter()
                .map(|name| parse_header_name(name))
                .collect::<Result<_, _>>()?,
        })
    }

    fn build_policies(&self) -> Result<HashMap<Option<String>, Arc<ResiliencePolicy>>, GatewayError> {
        let mut policies = HashMap::new();
        for (name, policy) in &self.config.resilience_policies {
            let built = ResiliencePolicy::from_config(name, policy).map_err(invalid)?;
            policies.insert(Some(name.clone()), Arc::new(built));
        }

        // `None` key: policy used by routes that do not name one
        let default = match &self.config.global.default_resilience_policy {
            Some(name) => policies.get(&Some(name.clone())).cloned().ok_or_else(|| {
                invalid(format!("default resilience policy '{name}' is not defined"))
            })?,
            None => Arc::new(
                ResiliencePolicy::from_config("default", &ResiliencePolicyConfig::default())
                    .map_err(invalid)?,
            ),
        };
        policies.insert(None, default);
        Ok(policies)
    }

    fn build_clusters(&self) -> Result<HashMap<String, Arc<Cluster>>, GatewayError> {
        let keys = destination_keys(self.config)?;
        let mut clusters = HashMap::with_capacity(self.config.clusters.len());

        for (cluster_id, cluster) in &self.config.clusters {
            let destinations: Vec<Destination> = keys
                .iter()
                .filter(|key| &key.cluster_id == cluster_id)
                .map(|key| {
                    let runtime = self.runtimes.get(key).cloned().unwrap_or_else(|| {
                        Arc::new(DestinationRuntime::new(
                            key.cluster_id.clone(),
                            key.destination_id.clone(),
                            key.address.clone(),
                        ))
                    });
                    let weight = cluster.destinations[&key.destination_id].weight;
                    Destination::new(weight, runtime)
                })
                .collect();

            let fingerprint = LoadBalancerFactory::fingerprint(&cluster.load_balancer, &destinations);
            let reusable = self
                .previous
                .and_then(|previous| previous.cluster(cluster_id))
                .filter(|previous| previous.balancer.fingerprint() == fingerprint)
                .map(|previous| Arc::clone(&previous.balancer));

            let balancer = match reusable {
                Some(balancer) => balancer,
                None => Arc::new(
                    LoadBalancerFactory::create(&cluster.load_balancer, destinations)
                        .map_err(|e| invalid(format!("cluster '{cluster_id}': {e}")))?,
                ),
            };

            clusters.insert(
                cluster_id.clone(),
                Arc::new(Cluster {
                    id: cluster_id.clone(),
                    balancer,
                    health_check: cluster.health_check.clone(),
                }),
            );
        }

        Ok(clusters)
    }

    /// Limiter of the previous snapshot's route `id`, if its settings match.
    /// Reusing it keeps client quotas across reloads.
    fn previous_limiter(&self, id: &str, limit: &RateLimitConfig) -> Option<RouteRateLimiter> {
        self.previous?
            .routes()
            .iter()
            .find(|route| route.id == id && route.rate_limit.as_ref() == Some(limit))
            .and_then(|route| route.rate_limiter.clone())
    }

    fn build_route(
        &self,
        index: usize,
        route: &RouteConfig,
        policies: &HashMap<Option<String>, Arc<ResiliencePolicy>>,
        clusters: &HashMap<String, Arc<Cluster>>,
    ) -> Result<Route, GatewayError> {
        let id = route.id.clone().unwrap_or_else(|| format!("route-{index}"));
        let context = |e: String| invalid(format!("route '{id}': {e}"));

        if !clusters.contains_key(&route.cluster_id) {
            return Err(context(format!(
                "cluster '{}' is not defined",
                route.cluster_id
            )));
        }

        let resilience = policies
            .get(&route.resilience_policy)
            .cloned()
            .ok_or_else(|| {
                context(format!(
                    "resilience policy '{}' is not defined",
                    route.resilience_policy.as_deref().unwrap_or_default()
                ))
            })?;

        let upstream =
            PathTemplate::parse(&route.upstream_path_template).map_err(|e| context(e.to_string()))?;
        let downstream_path = route
            .downstream_path_template
            .as_deref()
            .map(PathTemplate::parse)
            .transpose()
            .map_err(|e| context(e.to_string()))?;

        let cache = route
            .cache
            .as_ref()
            .map(|cache| {
                humantime::parse_duration(&cache.ttl)
                    .map(|ttl| CachePolicy {
                        ttl,
                        region: cache.region.clone(),
                    })
                    .map_err(|e| context(format!("invalid cache ttl '{}': {e}", cache.ttl)))
            })
            .transpose()?;

        let rate_limiter = match &route.rate_limit {
            Some(limit) => Some(match self.previous_limiter(&id, limit) {
                Some(limiter) => limiter,
                None => RouteRateLimiter::new(limit).map_err(context)?,
            }),
            None => None,
        };

        let header_pairs = |transforms: &[crate::config::HeaderTransform]| {
            transforms
                .iter()
                .map(|t| Ok((parse_header_name(&t.name)?, t.value.clone())))
                .collect::<Result<Vec<_>, GatewayError>>()
        };

        Ok(Route {
            key: route.key.clone(),
            upstream,
            methods: route
                .upstream_methods
                .iter()
                .map(|m| parse_method(m))
                .collect::<Result<_, _>>()?,
            upstream_host: route.upstream_host.clone(),
            priority: route.priority,
            case_sensitive: route.case_sensitive,
            downstream_path,
            downstream_method: route
                .downstream_method
                .as_deref()
                .map(parse_method)
                .transpose()?,
            cluster_id: route.cluster_id.clone(),
            request_headers: header_pairs(&route.request_headers)?,
            response_headers: header_pairs(&route.response_headers)?,
            add_queries: route
                .add_queries
                .iter()
                .map(|q| (q.name.clone(), q.value.clone()))
                .collect(),
            resilience,
            cache,
            rate_limit: route.rate_limit.clone(),
            rate_limiter,
            authentication: route.authentication.as_ref().map(|auth| AuthenticationOptions {
                allowed_scopes: auth.allowed_scopes.clone(),
            }),
            id,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{AggregateConfig, ClusterConfig, MissingKeyPolicy, RateLimitBy};

    /// Bare route for matcher tests.
    pub(crate) fn test_route(id: &str, template: &str) -> Route {
        Route {
            id: id.to_string(),
            key: None,
            upstream: PathTemplate::parse(template).unwrap(),
            methods: Vec::new(),
            upstream_host: None,
            priority: 1,
            case_sensitive: false,
            downstream_path: None,
            downstream_method: None,
            cluster_id: "c".to_string(),
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            add_queries: Vec::new(),
            resilience: Arc::new(
                ResiliencePolicy::from_config("default", &ResiliencePolicyConfig::default())
                    .unwrap(),
            ),
            cache: None,
            rate_limit: None,
            rate_limiter: None,
            authentication: None,
        }
    }

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .route(RouteConfig::new("/users/{id}", "users").key("users"))
            .route(RouteConfig::new("/orders", "orders").key("orders").id("orders"))
            .aggregate(AggregateConfig::new("/dashboard", ["users", "orders"]))
            .cluster(
                "users",
                ClusterConfig::default()
                    .destination("b", "http://127.0.0.1:9002")
                    .destination("a", "http://127.0.0.1:9001"),
            )
            .cluster(
                "orders",
                ClusterConfig::default().destination("one", "http://127.0.0.1:9100"),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_resolves_graph() {
        let snapshot = SnapshotBuilder::new(&config(), 1).build().unwrap();

        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.routes().len(), 2);
        assert_eq!(snapshot.routes()[0].id, "route-0");
        assert_eq!(snapshot.routes()[1].id, "orders");

        let users = snapshot.cluster("users").unwrap();
        let ids: Vec<&str> = users.destinations().iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let aggregate = &snapshot.aggregates()[0];
        let keys: Vec<&str> = aggregate.routes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["users", "orders"]);
    }

    #[test]
    fn test_dangling_cluster_is_rejected() {
        let mut config = config();
        config.routes.push(RouteConfig::new("/x", "nowhere"));

        let err = SnapshotBuilder::new(&config, 2).build().unwrap_err();
        assert!(matches!(err, GatewayError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn test_dangling_policy_and_route_key_are_rejected() {
        let mut config = config();
        config.routes[0].resilience_policy = Some("missing".to_string());
        assert!(SnapshotBuilder::new(&config, 2).build().is_err());

        let mut config = self::config();
        config.aggregates[0].route_keys.push("ghost".to_string());
        assert!(SnapshotBuilder::new(&config, 2).build().is_err());
    }

    #[test]
    fn test_unchanged_cluster_reuses_balancer() {
        let config = config();
        let first = SnapshotBuilder::new(&config, 1).build().unwrap();
        let second = SnapshotBuilder::new(&config, 2)
            .previous(&first)
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(
            &first.cluster("users").unwrap().balancer,
            &second.cluster("users").unwrap().balancer
        ));

        let mut changed = config.clone();
        changed
            .clusters
            .get_mut("users")
            .unwrap()
            .destinations
            .remove("b");
        let third = SnapshotBuilder::new(&changed, 3)
            .previous(&second)
            .build()
            .unwrap();
        assert!(!Arc::ptr_eq(
            &second.cluster("users").unwrap().balancer,
            &third.cluster("users").unwrap().balancer
        ));
        assert!(Arc::ptr_eq(
            &second.cluster("orders").unwrap().balancer,
            &third.cluster("orders").unwrap().balancer
        ));
    }

    #[test]
    fn test_unchanged_rate_limit_keeps_quota_across_reload() {
        let limit = RateLimitConfig {
            by: RateLimitBy::Route,
            header_name: None,
            requests: 1,
            period: "1m".to_string(),
            status_code: 429,
            message: "Too Many Requests".to_string(),
            on_missing_key: MissingKeyPolicy::Allow,
            client_whitelist: Vec::new(),
        };
        let mut config = config();
        config.routes[1].rate_limit = Some(limit.clone());
        let headers = http::HeaderMap::new();

        let first = SnapshotBuilder::new(&config, 1).build().unwrap();
        let limiter = first.routes()[1].rate_limiter.as_ref().unwrap();
        assert!(limiter.check(&headers, None).is_ok());

        let second = SnapshotBuilder::new(&config, 2)
            .previous(&first)
            .build()
            .unwrap();
        let reused = second.routes()[1].rate_limiter.as_ref().unwrap();
        assert!(reused.check(&headers, None).is_err());

        let mut raised = config.clone();
        raised.routes[1].rate_limit = Some(RateLimitConfig {
            requests: 2,
            ..limit
        });
        let third = SnapshotBuilder::new(&raised, 3)
            .previous(&second)
            .build()
            .unwrap();
        let rebuilt = third.routes()[1].rate_limiter.as_ref().unwrap();
        assert!(rebuilt.check(&headers, None).is_ok());
    }

    #[test]
    fn test_matching_through_snapshot() {
        let snapshot = SnapshotBuilder::new(&config(), 1).build().unwrap();

        let matched = snapshot
            .match_request(&Method::GET, None, "/users/9")
            .unwrap();
        assert_eq!(matched.target.id(), "route-0");
        assert_eq!(matched.bindings.get("id"), Some("9"));

        let matched = snapshot
            .match_request(&Method::GET, None, "/dashboard")
            .unwrap();
        assert_eq!(matched.target.id(), "aggregate-0");
        assert!(
            snapshot
                .match_request(&Method::POST, None, "/dashboard")
                .is_none()
        );
    }
}
