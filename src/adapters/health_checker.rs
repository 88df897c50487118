use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use tokio::time::sleep;

use crate::{
    config::{HealthCheckConfig, HealthStatus},
    core::{
        backend::{Destination, DestinationRuntime},
        snapshot::Cluster,
        store::ConfigStore,
    },
    ports::http_client::DownstreamClient,
};

/// How often the loop wakes to see which clusters are due.
const TICK: Duration = Duration::from_secs(1);

/// Health checker adapter probing destinations of clusters that configure
/// `health_check`.
///
/// Liveness flips only after `unhealthy_threshold` consecutive failures or
/// `healthy_threshold` consecutive successes. Every probe round reads the
/// store's current snapshot, so reloads take effect on the next tick.
pub struct HealthChecker {
    store: Arc<ConfigStore>,
    client: Arc<dyn DownstreamClient>,
}

impl HealthChecker {
    pub fn new(store: Arc<ConfigStore>, client: Arc<dyn DownstreamClient>) -> Self {
        Self { store, client }
    }

    /// Run the health checker loop
    pub async fn run(&self) {
        tracing::info!("Starting health checker");
        let mut last_round: HashMap<String, Instant> = HashMap::new();

        loop {
            sleep(TICK).await;

            let snapshot = self.store.current();
            let due: Vec<(&Arc<Cluster>, &HealthCheckConfig)> = snapshot
                .clusters()
                .values()
                .filter_map(|cluster| {
                    let config = cluster.health_check.as_ref().filter(|c| c.enabled)?;
                    let interval = Duration::from_secs(config.interval_secs.max(1));
                    let is_due = last_round
                        .get(&cluster.id)
                        .is_none_or(|at| at.elapsed() >= interval);
                    is_due.then_some((cluster, config))
                })
                .collect();

            for (cluster, config) in due {
                last_round.insert(cluster.id.clone(), Instant::now());
                self.check_cluster(cluster, config).await;
            }

            last_round.retain(|id, _| snapshot.cluster(id).is_some());
        }
    }

    /// Probe every destination of `cluster` concurrently and apply results.
    pub async fn check_cluster(&self, cluster: &Cluster, config: &HealthCheckConfig) {
        tracing::debug!("Running health checks on cluster {}", cluster.id);

        let probes = cluster
            .destinations()
            .iter()
            .map(|destination| self.check_destination(destination, config));
        join_all(probes).await;
    }

    /// Perform a single probe for one destination and apply it.
    pub async fn check_destination(&self, destination: &Destination, config: &HealthCheckConfig) {
        let url = destination.address().join(&config.path);
        let probe_timeout = Duration::from_secs(config.timeout_secs.max(1));

        match self.client.probe(&url, probe_timeout).await {
            Ok(true) => Self::handle_health_check_success(&destination.runtime, config),
            Ok(false) => Self::handle_health_check_failure(
                &destination.runtime,
                config,
                "destination reported unhealthy",
            ),
            Err(err) => {
                tracing::warn!(
                    "Health probe failed for {}/{}: {}",
                    destination.runtime.cluster_id(),
                    destination.id(),
                    err
                );
                Self::handle_health_check_failure(
                    &destination.runtime,
                    config,
                    &format!("request error: {err}"),
                );
            }
        }
    }

    /// Handle successful health check
    fn handle_health_check_success(runtime: &DestinationRuntime, config: &HealthCheckConfig) {
        let successes = runtime.consecutive_successes() + 1;

        tracing::debug!(
            "Health check for {}/{} succeeded ({} consecutive successes)",
            runtime.cluster_id(),
            runtime.destination_id(),
            successes
        );

        if successes >= config.healthy_threshold && runtime.status() == HealthStatus::Unhealthy {
            tracing::info!(
                "Destination {}/{} is now HEALTHY (after {} consecutive successes)",
                runtime.cluster_id(),
                runtime.destination_id(),
                successes
            );
            runtime.mark_healthy();
        } else {
            runtime.record_probe(true);
        }
    }

    /// Handle failed health check
    fn handle_health_check_failure(
        runtime: &DestinationRuntime,
        config: &HealthCheckConfig,
        reason: &str,
    ) {
        let failures = runtime.consecutive_failures() + 1;

        tracing::info!(
            "Health check failed for {}/{}: {} (failures: {}/{})",
            runtime.cluster_id(),
            runtime.destination_id(),
            reason,
            failures,
            config.unhealthy_threshold
        );

        if failures >= config.unhealthy_threshold && runtime.status() == HealthStatus::Healthy {
            tracing::warn!(
                "Destination {}/{} is now UNHEALTHY (after {} consecutive failures): {}",
                runtime.cluster_id(),
                runtime.destination_id(),
                failures,
                reason
            );
            runtime.mark_unhealthy();
        } else {
            runtime.record_probe(false);
        }
    }

    /// Current health status of every destination in the active snapshot.
    pub fn destination_health_status(&self) -> Vec<(String, String, HealthStatus)> {
        let snapshot = self.store.current();
        let mut status: Vec<_> = snapshot
            .clusters()
            .values()
            .flat_map(|cluster| cluster.destinations().iter())
            .map(|destination| {
                (
                    destination.runtime.cluster_id().to_string(),
                    destination.id().to_string(),
                    destination.runtime.status(),
                )
            })
            .collect();
        status.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        status
    }

    /// Get count of healthy vs unhealthy destinations
    pub fn health_summary(&self) -> (usize, usize) {
        self.destination_health_status()
            .iter()
            .fold((0, 0), |(healthy, unhealthy), (_, _, status)| match status {
                HealthStatus::Healthy => (healthy + 1, unhealthy),
                HealthStatus::Unhealthy => (healthy, unhealthy + 1),
            })
    }
}
