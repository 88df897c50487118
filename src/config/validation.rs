#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use http::{HeaderName, Method};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    config::models::{
        AggregateConfig, ClusterConfig, HealthCheckConfig, LoadBalancerConfig, RateLimitBy,
        RateLimitConfig, ResiliencePolicyConfig, RouteConfig, ServerConfig,
    },
    core::route_matcher::PathTemplate,
};

static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*(:\d{1,5})?$")
        .expect("invalid hostname regex")
});

/// Largest accepted destination weight.
pub const MAX_DESTINATION_WEIGHT: u32 = 10_000;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Dangling reference in {field}: {message}")]
    DanglingReference { field: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
///
/// Collects every problem in the document before reporting so a single
/// `portico validate` run surfaces all of them.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.routes.is_empty() && config.aggregates.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }

        for (index, route) in config.routes.iter().enumerate() {
            if let Err(mut route_errors) = Self::validate_single_route(index, route, config) {
                errors.append(&mut route_errors);
            }
        }

        for (index, aggregate) in config.aggregates.iter().enumerate() {
            if let Err(mut aggregate_errors) =
                Self::validate_aggregate(index, aggregate, &config.routes)
            {
                errors.append(&mut aggregate_errors);
            }
        }

        for (id, cluster) in &config.clusters {
            if let Err(mut cluster_errors) = Self::validate_cluster(id, cluster) {
                errors.append(&mut cluster_errors);
            }
        }

        for (name, policy) in &config.resilience_policies {
            if let Err(mut policy_errors) = Self::validate_resilience_policy(name, policy) {
                errors.append(&mut policy_errors);
            }
        }

        if let Some(default_policy) = &config.global.default_resilience_policy {
            if !config.resilience_policies.contains_key(default_policy) {
                errors.push(ValidationError::DanglingReference {
                    field: "global.default_resilience_policy".to_string(),
                    message: format!("resilience policy '{default_policy}' is not defined"),
                });
            }
        }

        if let Some(key) = &config.global.request_id_key {
            if let Err(e) = Self::validate_header_name(key, "global.request_id_key") {
                errors.push(e);
            }
        }

        if let Some(base_url) = &config.global.base_url {
            if let Err(e) = Self::validate_url(base_url, "global.base_url") {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate a single route configuration
    fn validate_single_route(
        index: usize,
        route: &RouteConfig,
        config: &ServerConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let label = route
            .id
            .clone()
            .unwrap_or_else(|| format!("#{index} {}", route.upstream_path_template));

        let upstream = match PathTemplate::parse(&route.upstream_path_template) {
            Ok(template) => Some(template),
            Err(e) => {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{label}' upstream_path_template"),
                    message: e.to_string(),
                });
                None
            }
        };

        if let Some(downstream) = &route.downstream_path_template {
            match PathTemplate::parse(downstream) {
                Ok(template) => {
                    if let Some(upstream) = &upstream {
                        let bound: HashSet<&str> = upstream.placeholder_names().collect();
                        for name in template.placeholder_names() {
                            if !bound.contains(name) {
                                errors.push(ValidationError::InvalidField {
                                    field: format!("route '{label}' downstream_path_template"),
                                    message: format!(
                                        "placeholder '{{{name}}}' is not bound by the upstream template"
                                    ),
                                });
                            }
                        }
                    }
                }
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: format!("route '{label}' downstream_path_template"),
                    message: e.to_string(),
                }),
            }
        }

        for method in route
            .upstream_methods
            .iter()
            .chain(route.downstream_method.iter())
        {
            if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{label}' method"),
                    message: format!("'{method}' is not a valid HTTP method"),
                });
            }
        }

        if let Some(host) = &route.upstream_host {
            if let Err(e) = Self::validate_host(host, &label) {
                errors.push(e);
            }
        }

        if route.cluster_id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{label}' cluster_id"),
            });
        } else if !config.clusters.contains_key(&route.cluster_id) {
            errors.push(ValidationError::DanglingReference {
                field: format!("route '{label}' cluster_id"),
                message: format!("cluster '{}' is not defined", route.cluster_id),
            });
        }

        if let Some(policy) = &route.resilience_policy {
            if !config.resilience_policies.contains_key(policy) {
                errors.push(ValidationError::DanglingReference {
                    field: format!("route '{label}' resilience_policy"),
                    message: format!("resilience policy '{policy}' is not defined"),
                });
            }
        }

        for transform in route.request_headers.iter().chain(&route.response_headers) {
            if let Err(e) =
                Self::validate_header_name(&transform.name, &format!("route '{label}' headers"))
            {
                errors.push(e);
            }
        }

        for query in &route.add_queries {
            if query.name.trim().is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{label}' add_queries"),
                    message: "Query parameter name cannot be empty".to_string(),
                });
            }
        }

        if let Some(cache) = &route.cache {
            if let Err(e) = Self::validate_duration(&cache.ttl, &format!("route '{label}' cache.ttl"))
            {
                errors.push(e);
            }
        }

        if let Some(rate_limit) = &route.rate_limit {
            if let Err(e) = Self::validate_rate_limit(&label, rate_limit) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_aggregate(
        index: usize,
        aggregate: &AggregateConfig,
        routes: &[RouteConfig],
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let label = aggregate
            .id
            .clone()
            .unwrap_or_else(|| format!("#{index} {}", aggregate.upstream_path_template));

        if let Err(e) = PathTemplate::parse(&aggregate.upstream_path_template) {
            errors.push(ValidationError::InvalidField {
                field: format!("aggregate '{label}' upstream_path_template"),
                message: e.to_string(),
            });
        }

        if aggregate.route_keys.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("aggregate '{label}' route_keys"),
            });
        }

        let mut seen = HashSet::new();
        for key in &aggregate.route_keys {
            if !seen.insert(key.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("aggregate '{label}' route_keys"),
                    message: format!("route key '{key}' is listed twice"),
                });
            }
            let matches = routes
                .iter()
                .filter(|route| route.key.as_deref() == Some(key.as_str()))
                .count();
            if matches == 0 {
                errors.push(ValidationError::DanglingReference {
                    field: format!("aggregate '{label}' route_keys"),
                    message: format!("no route has key '{key}'"),
                });
            } else if matches > 1 {
                errors.push(ValidationError::InvalidField {
                    field: format!("aggregate '{label}' route_keys"),
                    message: format!("route key '{key}' is ambiguous ({matches} routes)"),
                });
            }
        }

        if let Some(host) = &aggregate.upstream_host {
            if let Err(e) = Self::validate_host(host, &label) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_cluster(id: &str, cluster: &ClusterConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (destination_id, destination) in &cluster.destinations {
            if let Err(e) = Self::validate_url(
                &destination.address,
                &format!("cluster '{id}' destination '{destination_id}' address"),
            ) {
                errors.push(e);
            }
            if destination.weight == 0 || destination.weight > MAX_DESTINATION_WEIGHT {
                errors.push(ValidationError::InvalidField {
                    field: format!("cluster '{id}' destination '{destination_id}' weight"),
                    message: format!("Weight must be between 1 and {MAX_DESTINATION_WEIGHT}"),
                });
            }
        }

        if let LoadBalancerConfig::Sticky { key, expiry } = &cluster.load_balancer {
            if key.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("cluster '{id}' load_balancer.key"),
                });
            }
            if let Err(e) =
                Self::validate_duration(expiry, &format!("cluster '{id}' load_balancer.expiry"))
            {
                errors.push(e);
            }
        }

        if let Some(health_check) = &cluster.health_check {
            if let Err(mut health_errors) = Self::validate_health_check_config(id, health_check) {
                errors.append(&mut health_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_resilience_policy(
        name: &str,
        policy: &ResiliencePolicyConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let field = |suffix: &str| format!("resilience policy '{name}' {suffix}");

        if policy.failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("failure_threshold"),
                message: "Must be greater than 0".to_string(),
            });
        }
        if policy.half_open_max_trials == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("half_open_max_trials"),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (value, suffix) in [
            (&policy.failure_window, "failure_window"),
            (&policy.break_duration, "break_duration"),
            (&policy.timeout, "timeout"),
            (&policy.retry_backoff, "retry_backoff"),
        ] {
            if let Err(e) = Self::validate_duration(value, &field(suffix)) {
                errors.push(e);
            }
        }

        for method in &policy.retry_methods {
            if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: field("retry_methods"),
                    message: format!("'{method}' is not a valid HTTP method"),
                });
            }
        }

        for code in &policy.failure_status_codes {
            if !(100..=599).contains(code) {
                errors.push(ValidationError::InvalidField {
                    field: field("failure_status_codes"),
                    message: format!("{code} is not an HTTP status code"),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_duration(value: &str, context: &str) -> ValidationResult<()> {
        humantime::parse_duration(value)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid duration '{value}': {e}"),
            })
    }

    fn validate_header_name(name: &str, context: &str) -> ValidationResult<()> {
        HeaderName::from_bytes(name.as_bytes())
            .map(|_| ())
            .map_err(|_| ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("'{name}' is not a valid header name"),
            })
    }

    /// Validate rate limit configuration
    fn validate_rate_limit(label: &str, config: &RateLimitConfig) -> ValidationResult<()> {
        if config.requests == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("route '{label}' rate_limit.requests"),
                message: "Rate limit requests must be greater than 0".to_string(),
            });
        }

        if config.by == RateLimitBy::Header && config.header_name.is_none() {
            return Err(ValidationError::MissingField {
                field: format!("route '{label}' rate_limit.header_name"),
            });
        }

        if http::StatusCode::from_u16(config.status_code).is_err() {
            return Err(ValidationError::InvalidField {
                field: format!("route '{label}' rate_limit.status_code"),
                message: format!("{} is not an HTTP status code", config.status_code),
            });
        }

        Self::validate_duration(&config.period, &format!("route '{label}' rate_limit.period"))
    }

    fn validate_health_check_config(
        cluster_id: &str,
        config: &HealthCheckConfig,
    ) -> Result<(), Vec<ValidationError>> {
        if !config.enabled {
            return Ok(());
        }

        let mut errors = Vec::new();
        let field = |suffix: &str| format!("cluster '{cluster_id}' health_check.{suffix}");

        if config.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("interval_secs"),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("timeout_secs"),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.unhealthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("unhealthy_threshold"),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.healthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("healthy_threshold"),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.path.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: field("path"),
                message: "Cannot be empty when health checks are enabled".to_string(),
            });
        } else if !config.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: field("path"),
                message: "Must start with '/' when health checks are enabled".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate host field format
    fn validate_host(host: &str, label: &str) -> ValidationResult<()> {
        if host.is_empty() {
            return Err(ValidationError::InvalidField {
                field: format!("route '{label}' upstream_host"),
                message: "Host cannot be empty".to_string(),
            });
        }

        if host.contains("://") {
            return Err(ValidationError::InvalidField {
                field: format!("route '{label}' upstream_host"),
                message: "Host should not contain protocol (e.g., use 'example.com' not 'http://example.com')".to_string(),
            });
        }

        if !HOSTNAME_REGEX.is_match(host) {
            return Err(ValidationError::InvalidField {
                field: format!("route '{label}' upstream_host"),
                message: format!("Invalid hostname format: '{host}'"),
            });
        }

        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
