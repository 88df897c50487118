use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
};

use thiserror::Error;

use crate::{
    config::HealthStatus,
    core::circuit_breaker::{BreakerSettings, CircuitBreaker},
    metrics::set_destination_health_status,
};

// Constants for health status to replace magic numbers
const HEALTH_STATUS_UNHEALTHY: u8 = 0;
const HEALTH_STATUS_HEALTHY: u8 = 1;

/// Errors related to destination definitions
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DestinationError {
    /// Error when URL is invalid
    #[error("Invalid destination URL: {0}")]
    InvalidUrl(String),
}

/// Result type for destination operations
pub type DestinationResult<T> = Result<T, DestinationError>;

/// A type-safe representation of a destination base address
/// (scheme, host and port; no path, query or fragment).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationUrl {
    /// Normalized `scheme://authority`, without trailing slash
    url: String,
    /// Whether the URL is secure (HTTPS)
    is_secure: bool,
}

impl DestinationUrl {
    /// Creates a new DestinationUrl if the provided string is a valid base address
    pub fn new(url: &str) -> DestinationResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| DestinationError::InvalidUrl(format!("{url}: {e}")))?;

        let is_secure = match parsed.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(DestinationError::InvalidUrl(format!(
                    "Destination URL must use http:// or https://, got scheme '{other}'"
                )));
            }
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| DestinationError::InvalidUrl(format!("{url}: missing host")))?;

        if parsed.path() != "/" && !parsed.path().is_empty() {
            return Err(DestinationError::InvalidUrl(format!(
                "{url}: a destination address cannot carry a path"
            )));
        }

        let url = match parsed.port() {
            Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
            None => format!("{}://{host}", parsed.scheme()),
        };

        Ok(DestinationUrl { url, is_secure })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Check if the URL is using HTTPS
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Absolute URL for `path_and_query` on this destination.
    pub fn join(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{path_and_query}", self.url)
        } else {
            format!("{}/{path_and_query}", self.url)
        }
    }
}

impl FromStr for DestinationUrl {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DestinationUrl::new(s)
    }
}

impl fmt::Display for DestinationUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Mutable runtime state of one destination identity
/// (cluster id, destination id, address).
///
/// Owned by the configuration store's registry and shared by every snapshot
/// generation in which the identity is unchanged, so liveness and breaker
/// history survive reloads.
#[derive(Debug)]
pub struct DestinationRuntime {
    cluster_id: String,
    destination_id: String,
    address: DestinationUrl,
    /// Current health status (uses atomic for thread safety)
    status: AtomicU8, // Uses HEALTH_STATUS_* constants
    /// Counter for consecutive successful health checks
    consecutive_successes: AtomicU32,
    /// Counter for consecutive failed health checks
    consecutive_failures: AtomicU32,
    breaker: CircuitBreaker,
}

impl DestinationRuntime {
    /// Creates a new runtime, initialized as healthy with a closed breaker
    pub fn new(
        cluster_id: impl Into<String>,
        destination_id: impl Into<String>,
        address: DestinationUrl,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            destination_id: destination_id.into(),
            address,
            status: AtomicU8::new(HEALTH_STATUS_HEALTHY), // Start as healthy
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            breaker: CircuitBreaker::new(),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    pub fn address(&self) -> &DestinationUrl {
        &self.address
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Get the current health status
    pub fn status(&self) -> HealthStatus {
        if self.status.load(Ordering::Acquire) == HEALTH_STATUS_HEALTHY {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Healthy and not currently short-circuited by its breaker.
    pub fn is_live(&self, settings: &BreakerSettings) -> bool {
        self.status() == HealthStatus::Healthy && !self.breaker.is_rejecting(settings)
    }

    /// Record a successful probe
    pub fn mark_healthy(&self) {
        self.status.store(HEALTH_STATUS_HEALTHY, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.fetch_add(1, Ordering::AcqRel);
        set_destination_health_status(&self.cluster_id, &self.destination_id, true);
    }

    /// Record a failed probe
    pub fn mark_unhealthy(&self) {
        self.status.store(HEALTH_STATUS_UNHEALTHY, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        set_destination_health_status(&self.cluster_id, &self.destination_id, false);
    }

    /// Count a probe result without flipping the status (threshold not yet reached).
    pub fn record_probe(&self, success: bool) {
        if success {
            self.consecutive_failures.store(0, Ordering::Release);
            self.consecutive_successes.fetch_add(1, Ordering::AcqRel);
        } else {
            self.consecutive_successes.store(0, Ordering::Release);
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Get the number of consecutive successful health checks
    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    /// Get the number of consecutive failed health checks
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// A destination as listed by one cluster of one snapshot.
#[derive(Debug, Clone)]
pub struct Destination {
    pub weight: u32,
    pub runtime: Arc<DestinationRuntime>,
}

impl Destination {
    pub fn new(weight: u32, runtime: Arc<DestinationRuntime>) -> Self {
        Self { weight, runtime }
    }

    pub fn id(&self) -> &str {
        self.runtime.destination_id()
    }

    pub fn address(&self) -> &DestinationUrl {
        self.runtime.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_url_valid() {
        let url = DestinationUrl::new("http://example.com").expect("Valid HTTP URL should parse");
        assert_eq!(url.as_str(), "http://example.com");
        assert!(!url.is_secure());

        let secure =
            DestinationUrl::new("https://secure.example.com:8443/").expect("Valid HTTPS URL");
        assert_eq!(secure.as_str(), "https://secure.example.com:8443");
        assert!(secure.is_secure());
    }

    #[test]
    fn test_destination_url_invalid() {
        assert!(DestinationUrl::new("example.com").is_err());
        assert!(DestinationUrl::new("ftp://example.com").is_err());
        assert!(DestinationUrl::new("http://example.com/api").is_err());
    }

    #[test]
    fn test_destination_url_join() {
        let url: DestinationUrl = "http://127.0.0.1:9000".parse().unwrap();
        assert_eq!(url.join("/users/1?x=2"), "http://127.0.0.1:9000/users/1?x=2");
        assert_eq!(url.join("users"), "http://127.0.0.1:9000/users");
    }

    #[test]
    fn test_runtime_initial_state() {
        let runtime =
            DestinationRuntime::new("c", "d", DestinationUrl::new("http://example.com").unwrap());

        assert_eq!(runtime.status(), HealthStatus::Healthy);
        assert_eq!(runtime.consecutive_successes(), 0);
        assert_eq!(runtime.consecutive_failures(), 0);
        assert!(runtime.is_live(&BreakerSettings::default()));
    }

    #[test]
    fn test_runtime_health_transitions() {
        let runtime =
            DestinationRuntime::new("c", "d", DestinationUrl::new("http://example.com").unwrap());

        runtime.mark_unhealthy();
        assert_eq!(runtime.status(), HealthStatus::Unhealthy);
        assert_eq!(runtime.consecutive_failures(), 1);
        assert!(!runtime.is_live(&BreakerSettings::default()));

        runtime.mark_healthy();
        assert_eq!(runtime.status(), HealthStatus::Healthy);
        assert_eq!(runtime.consecutive_successes(), 1);
        assert_eq!(runtime.consecutive_failures(), 0);
    }
}
