//! Per-cluster destination selection.
//!
//! A [`LoadBalancer`] owns its cluster's ordered destinations together with
//! the policy state (rotation counter, active-request counts, sticky sessions).
//! The configuration store hands the same instance to the next snapshot while
//! the cluster's fingerprint is unchanged and builds a fresh one otherwise,
//! which is what resets the rotation when the destination set changes.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use http::{HeaderMap, header::COOKIE};

use crate::{
    config::{HealthStatus, LoadBalancerConfig},
    core::{backend::Destination, circuit_breaker::BreakerSettings, error::GatewayError},
};

#[derive(Debug, Clone, Copy)]
struct StickySession {
    index: usize,
    expires_at: Instant,
}

enum BalancerPolicy {
    RoundRobin,
    LeastConnection,
    Sticky {
        cookie: String,
        expiry: Duration,
        sessions: scc::HashMap<String, StickySession>,
    },
}

impl std::fmt::Debug for BalancerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalancerPolicy::RoundRobin => f.write_str("RoundRobin"),
            BalancerPolicy::LeastConnection => f.write_str("LeastConnection"),
            BalancerPolicy::Sticky { cookie, expiry, sessions } => f
                .debug_struct("Sticky")
                .field("cookie", cookie)
                .field("expiry", expiry)
                .field("sessions", &sessions.len())
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct LoadBalancer {
    policy: BalancerPolicy,
    destinations: Vec<Destination>,
    counter: AtomicUsize,
    active: Vec<AtomicUsize>,
    fingerprint: String,
}

/// Result of a successful selection.
///
/// For least-connection clusters it carries a lease that keeps the chosen
/// destination's active count raised until the selection is dropped.
#[derive(Debug)]
pub struct Selection {
    destination: Destination,
    _lease: Option<ConnectionLease>,
}

impl Selection {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

#[derive(Debug)]
struct ConnectionLease {
    balancer: Arc<LoadBalancer>,
    index: usize,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.balancer.active[self.index].fetch_sub(1, Ordering::AcqRel);
    }
}

impl LoadBalancer {
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn policy_name(&self) -> &'static str {
        match self.policy {
            BalancerPolicy::RoundRobin => "round_robin",
            BalancerPolicy::LeastConnection => "least_connection",
            BalancerPolicy::Sticky { .. } => "sticky",
        }
    }

    /// Current in-flight count for the destination at `index` (least-connection only).
    pub fn active_requests(&self, index: usize) -> usize {
        self.active
            .get(index)
            .map(|count| count.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Drop expired sticky sessions, returning how many remain.
    pub async fn purge_expired_sessions(&self) -> usize {
        let BalancerPolicy::Sticky { sessions, .. } = &self.policy else {
            return 0;
        };
        let now = Instant::now();
        sessions
            .retain_async(|_, session| session.expires_at > now)
            .await;
        sessions.len()
    }

    /// Pick a live destination for one request.
    pub async fn select(
        self: &Arc<Self>,
        cluster_id: &str,
        headers: &HeaderMap,
        settings: &BreakerSettings,
    ) -> Result<Selection, GatewayError> {
        let no_destination = || self.no_live_destination(cluster_id);

        let index = match &self.policy {
            BalancerPolicy::RoundRobin => self.round_robin(settings).ok_or_else(no_destination)?,
            BalancerPolicy::LeastConnection => {
                let index = self.least_connection(settings).ok_or_else(no_destination)?;
                self.active[index].fetch_add(1, Ordering::AcqRel);
                return Ok(Selection {
                    destination: self.destinations[index].clone(),
                    _lease: Some(ConnectionLease {
                        balancer: Arc::clone(self),
                        index,
                    }),
                });
            }
            BalancerPolicy::Sticky {
                cookie,
                expiry,
                sessions,
            } => {
                let key = cookie_value(headers, cookie);
                self.sticky(key, *expiry, sessions, settings)
                    .await
                    .ok_or_else(no_destination)?
            }
        };

        Ok(Selection {
            destination: self.destinations[index].clone(),
            _lease: None,
        })
    }

    /// Healthy destinations that are skipped can only be skipped because their
    /// breaker is rejecting, which is reported as an open circuit.
    fn no_live_destination(&self, cluster_id: &str) -> GatewayError {
        match self
            .destinations
            .iter()
            .find(|d| d.runtime.status() == HealthStatus::Healthy)
        {
            Some(destination) => GatewayError::CircuitOpen {
                cluster_id: cluster_id.to_string(),
                destination_id: destination.id().to_string(),
            },
            None => GatewayError::NoHealthyDestination {
                cluster_id: cluster_id.to_string(),
            },
        }
    }

    /// Live destination indices paired with their cumulative weight.
    fn live_weights(&self, settings: &BreakerSettings) -> Vec<(usize, u64)> {
        let mut total = 0u64;
        self.destinations
            .iter()
            .enumerate()
            .filter(|(_, destination)| destination.runtime.is_live(settings))
            .map(|(index, destination)| {
                total += u64::from(destination.weight.max(1));
                (index, total)
            })
            .collect()
    }

    /// Weighted rotation: destination `i` owns `weight(i)` consecutive slots
    /// of each cycle over the live set.
    fn round_robin(&self, settings: &BreakerSettings) -> Option<usize> {
        let live = self.live_weights(settings);
        let (_, total) = *live.last()?;
        let count = self.counter.fetch_add(1, Ordering::Relaxed) as u64;
        let slot = count % total;
        let position = live.partition_point(|&(_, cumulative)| cumulative <= slot);
        live.get(position).map(|&(index, _)| index)
    }

    fn least_connection(&self, settings: &BreakerSettings) -> Option<usize> {
        let live: Vec<usize> = (0..self.destinations.len())
            .filter(|&index| self.destinations[index].runtime.is_live(settings))
            .collect();
        let fewest = live
            .iter()
            .map(|&index| self.active[index].load(Ordering::Acquire))
            .min()?;
        let tied: Vec<usize> = live
            .into_iter()
            .filter(|&index| self.active[index].load(Ordering::Acquire) == fewest)
            .collect();
        if tied.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(tied[count % tied.len()])
    }

    async fn sticky(
        &self,
        key: Option<String>,
        expiry: Duration,
        sessions: &scc::HashMap<String, StickySession>,
        settings: &BreakerSettings,
    ) -> Option<usize> {
        let now = Instant::now();

        if let Some(key) = &key {
            let existing = sessions.get_async(key).await.map(|entry| *entry.get());
            if let Some(session) = existing {
                let pinned = self.destinations.get(session.index);
                if session.expires_at > now && pinned.is_some_and(|d| d.runtime.is_live(settings))
                {
                    let _ = sessions
                        .upsert_async(
                            key.clone(),
                            StickySession {
                                index: session.index,
                                expires_at: now + expiry,
                            },
                        )
                        .await;
                    return Some(session.index);
                }
            }
        }

        let index = self.round_robin(settings)?;
        if let Some(key) = key {
            let _ = sessions
                .upsert_async(
                    key,
                    StickySession {
                        index,
                        expires_at: now + expiry,
                    },
                )
                .await;
        }
        Some(index)
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Factory for creating load balancers from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// Identity of a cluster's balancing setup: policy plus ordered
    /// destination ids, addresses and weights.
    pub fn fingerprint(config: &LoadBalancerConfig, destinations: &[Destination]) -> String {
        let mut fingerprint = format!("{config:?}");
        for destination in destinations {
            fingerprint.push_str(&format!(
                "|{}={}*{}",
                destination.id(),
                destination.address(),
                destination.weight
            ));
        }
        fingerprint
    }

    /// Create a balancer; `destinations` must already be in rotation order.
    pub fn create(
        config: &LoadBalancerConfig,
        destinations: Vec<Destination>,
    ) -> Result<LoadBalancer, String> {
        let policy = match config {
            LoadBalancerConfig::RoundRobin => BalancerPolicy::RoundRobin,
            LoadBalancerConfig::LeastConnection => BalancerPolicy::LeastConnection,
            LoadBalancerConfig::Sticky { key, expiry } => BalancerPolicy::Sticky {
                cookie: key.clone(),
                expiry: humantime::parse_duration(expiry)
                    .map_err(|e| format!("Invalid sticky expiry '{expiry}': {e}"))?,
                sessions: scc::HashMap::new(),
            },
        };

        Ok(LoadBalancer {
            fingerprint: Self::fingerprint(config, &destinations),
            policy,
            active: destinations.iter().map(|_| AtomicUsize::new(0)).collect(),
            counter: AtomicUsize::new(0),
            destinations,
        })
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;
    use crate::core::backend::{DestinationRuntime, DestinationUrl};

    fn destinations(count: usize) -> Vec<Destination> {
        (0..count)
            .map(|i| {
                let address = DestinationUrl::new(&format!("http://10.0.0.{i}:80")).unwrap();
                Destination::new(
                    1,
                    Arc::new(DestinationRuntime::new("c", format!("d{i}"), address)),
                )
            })
            .collect()
    }

    async fn pick(balancer: &Arc<LoadBalancer>, headers: &HeaderMap) -> String {
        balancer
            .select("c", headers, &BreakerSettings::default())
            .await
            .unwrap()
            .destination()
            .id()
            .to_string()
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_once_per_cycle() {
        let balancer = Arc::new(
            LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, destinations(3)).unwrap(),
        );
        let headers = HeaderMap::new();

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(pick(&balancer, &headers).await);
        }
        assert_eq!(picks, vec!["d0", "d1", "d2", "d0", "d1", "d2"]);
    }

    #[tokio::test]
    async fn test_round_robin_skips_unhealthy() {
        let dests = destinations(3);
        dests[1].runtime.mark_unhealthy();
        let balancer =
            Arc::new(LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, dests).unwrap());
        let headers = HeaderMap::new();

        for _ in 0..4 {
            assert_ne!(pick(&balancer, &headers).await, "d1");
        }
    }

    #[tokio::test]
    async fn test_weighted_rotation() {
        let mut dests = destinations(2);
        dests[0].weight = 2;
        let balancer =
            Arc::new(LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, dests).unwrap());
        let headers = HeaderMap::new();

        let mut picks = Vec::new();
        for _ in 0..3 {
            picks.push(pick(&balancer, &headers).await);
        }
        assert_eq!(picks, vec!["d0", "d0", "d1"]);
    }

    #[tokio::test]
    async fn test_weighted_rotation_skips_unhealthy_weight() {
        let mut dests = destinations(3);
        dests[0].weight = 3;
        dests[2].weight = 2;
        dests[0].runtime.mark_unhealthy();
        let balancer =
            Arc::new(LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, dests).unwrap());
        let headers = HeaderMap::new();

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(pick(&balancer, &headers).await);
        }
        assert_eq!(picks, vec!["d1", "d2", "d2", "d1", "d2", "d2"]);
    }

    #[tokio::test]
    async fn test_large_weight_does_not_expand_rotation() {
        let mut dests = destinations(2);
        dests[0].weight = u32::MAX;
        let balancer =
            Arc::new(LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, dests).unwrap());
        let headers = HeaderMap::new();

        for _ in 0..3 {
            assert_eq!(pick(&balancer, &headers).await, "d0");
        }
    }

    #[tokio::test]
    async fn test_empty_or_all_unhealthy_is_no_healthy_destination() {
        let balancer = Arc::new(
            LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, Vec::new()).unwrap(),
        );
        let result = balancer
            .select("c", &HeaderMap::new(), &BreakerSettings::default())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::NoHealthyDestination { .. })
        ));

        let dests = destinations(2);
        for destination in &dests {
            destination.runtime.mark_unhealthy();
        }
        let balancer = Arc::new(
            LoadBalancerFactory::create(&LoadBalancerConfig::LeastConnection, dests).unwrap(),
        );
        let result = balancer
            .select("c", &HeaderMap::new(), &BreakerSettings::default())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::NoHealthyDestination { .. })
        ));
    }

    #[tokio::test]
    async fn test_least_connection_prefers_idle_and_releases_on_drop() {
        let balancer = Arc::new(
            LoadBalancerFactory::create(&LoadBalancerConfig::LeastConnection, destinations(2))
                .unwrap(),
        );
        let headers = HeaderMap::new();
        let settings = BreakerSettings::default();

        let first = balancer.select("c", &headers, &settings).await.unwrap();
        let second = balancer.select("c", &headers, &settings).await.unwrap();
        assert_ne!(first.destination().id(), second.destination().id());
        assert_eq!(balancer.active_requests(0), 1);
        assert_eq!(balancer.active_requests(1), 1);

        let busy = first.destination().id().to_string();
        drop(second);
        let third = balancer.select("c", &headers, &settings).await.unwrap();
        assert_ne!(third.destination().id(), busy);

        drop(first);
        drop(third);
        assert_eq!(balancer.active_requests(0), 0);
        assert_eq!(balancer.active_requests(1), 0);
    }

    #[tokio::test]
    async fn test_sticky_pins_cookie_and_falls_back_when_unhealthy() {
        let config = LoadBalancerConfig::Sticky {
            key: "session".to_string(),
            expiry: "1m".to_string(),
        };
        let dests = destinations(3);
        let balancer = Arc::new(LoadBalancerFactory::create(&config, dests.clone()).unwrap());

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; session=abc"));

        let pinned = pick(&balancer, &headers).await;
        for _ in 0..5 {
            assert_eq!(pick(&balancer, &headers).await, pinned);
        }

        let pinned_runtime = dests
            .iter()
            .find(|d| d.id() == pinned)
            .map(|d| Arc::clone(&d.runtime))
            .unwrap();
        pinned_runtime.mark_unhealthy();

        let moved = pick(&balancer, &headers).await;
        assert_ne!(moved, pinned);
        assert_eq!(pick(&balancer, &headers).await, moved);
    }

    #[tokio::test]
    async fn test_purge_drops_only_expired_sessions() {
        let config = LoadBalancerConfig::Sticky {
            key: "session".to_string(),
            expiry: "50ms".to_string(),
        };
        let balancer = Arc::new(LoadBalancerFactory::create(&config, destinations(2)).unwrap());

        let mut first = HeaderMap::new();
        first.insert(COOKIE, HeaderValue::from_static("session=one"));
        pick(&balancer, &first).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let mut second = HeaderMap::new();
        second.insert(COOKIE, HeaderValue::from_static("session=two"));
        pick(&balancer, &second).await;

        assert_eq!(balancer.purge_expired_sessions().await, 1);

        let round_robin = Arc::new(
            LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, destinations(1)).unwrap(),
        );
        assert_eq!(round_robin.purge_expired_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_open_breakers_report_circuit_open() {
        let dests = destinations(1);
        let settings = BreakerSettings {
            failure_threshold: 1,
            ..BreakerSettings::default()
        };
        let (permit, _) = dests[0].runtime.breaker().try_acquire(&settings).unwrap();
        permit.record_failure();

        let balancer =
            Arc::new(LoadBalancerFactory::create(&LoadBalancerConfig::RoundRobin, dests).unwrap());
        let result = balancer.select("c", &HeaderMap::new(), &settings).await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
    }

    #[test]
    fn test_fingerprint_tracks_destination_set() {
        let config = LoadBalancerConfig::RoundRobin;
        let a = LoadBalancerFactory::fingerprint(&config, &destinations(2));
        let b = LoadBalancerFactory::fingerprint(&config, &destinations(2));
        let c = LoadBalancerFactory::fingerprint(&config, &destinations(3));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(
            a,
            LoadBalancerFactory::fingerprint(&LoadBalancerConfig::LeastConnection, &destinations(2))
        );
    }
}
