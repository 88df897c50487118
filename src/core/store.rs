//! Process-wide holder of the active [`ConfigSnapshot`].
//!
//! Readers take a cheap `Arc` of the current snapshot and keep it for the rest
//! of their request; a publish swaps the reference atomically. Destination
//! runtime state (health, circuit breaker) is kept in a registry keyed by
//! destination identity so it survives reloads that keep the same
//! cluster/destination/address triple.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use crate::{
    config::{ServerConfig, ServerConfigValidator},
    core::{
        backend::DestinationRuntime,
        error::GatewayError,
        snapshot::{self, ConfigSnapshot, DestinationKey, SnapshotBuilder},
    },
    metrics::increment_config_reload,
    ports::event_sink::{EventSink, GatewayEvent},
};

pub struct ConfigStore {
    current: ArcSwap<ConfigSnapshot>,
    runtimes: scc::HashMap<DestinationKey, Arc<DestinationRuntime>>,
    generation: AtomicU64,
    /// Serializes publishers; readers never take it.
    publish_lock: Mutex<()>,
    events: Arc<dyn EventSink>,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("generation", &self.current.load().generation())
            .field("destinations", &self.runtimes.len())
            .finish()
    }
}

impl ConfigStore {
    /// Store holding an empty snapshot; every request is unmatched until the
    /// first successful [`publish`](Self::publish).
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            current: ArcSwap::from_pointee(ConfigSnapshot::empty()),
            runtimes: scc::HashMap::new(),
            generation: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
            events,
        }
    }

    /// Build, validate and publish `config` in one step.
    pub async fn from_config(
        config: &ServerConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, GatewayError> {
        let store = Self::new(events);
        store.publish(config).await?;
        Ok(store)
    }

    /// Snapshot in effect right now.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation()
    }

    /// Runtime state registered for a destination identity.
    pub async fn runtime(&self, key: &DestinationKey) -> Option<Arc<DestinationRuntime>> {
        self.runtimes
            .get_async(key)
            .await
            .map(|entry| Arc::clone(entry.get()))
    }

    /// Replace the active snapshot with one built from `config`.
    ///
    /// On any error the previous snapshot stays active and a
    /// `ConfigurationRejected` event is emitted.
    pub async fn publish(&self, config: &ServerConfig) -> Result<Arc<ConfigSnapshot>, GatewayError> {
        let _guard = self.publish_lock.lock().await;

        match self.build(config).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.current.store(Arc::clone(&snapshot));
                self.sync_registry(&snapshot).await;

                increment_config_reload("published");
                self.events.emit(&GatewayEvent::ConfigurationPublished {
                    generation: snapshot.generation(),
                    routes: snapshot.routes().len() + snapshot.aggregates().len(),
                    clusters: snapshot.clusters().len(),
                });
                tracing::info!(
                    "Published configuration generation {} ({} routes, {} aggregates, {} clusters)",
                    snapshot.generation(),
                    snapshot.routes().len(),
                    snapshot.aggregates().len(),
                    snapshot.clusters().len()
                );
                Ok(snapshot)
            }
            Err(error) => {
                increment_config_reload("rejected");
                self.events.emit(&GatewayEvent::ConfigurationRejected {
                    reason: error.to_string(),
                });
                tracing::error!("Configuration rejected, keeping previous snapshot: {}", error);
                Err(error)
            }
        }
    }

    async fn build(&self, config: &ServerConfig) -> Result<ConfigSnapshot, GatewayError> {
        ServerConfigValidator::validate(config).map_err(|e| GatewayError::ConfigurationInvalid {
            reason: e.to_string(),
        })?;

        let mut runtimes = HashMap::new();
        for key in snapshot::destination_keys(config)? {
            if let Some(runtime) = self.runtime(&key).await {
                runtimes.insert(key, runtime);
            }
        }

        let previous = self.current.load_full();
        let generation = self.generation.load(Ordering::Acquire) + 1;
        let snapshot = SnapshotBuilder::new(config, generation)
            .runtimes(runtimes)
            .previous(&previous)
            .build()?;
        self.generation.store(generation, Ordering::Release);
        Ok(snapshot)
    }

    /// Make the registry hold exactly the destinations of `snapshot`.
    async fn sync_registry(&self, snapshot: &ConfigSnapshot) {
        let live: HashMap<DestinationKey, Arc<DestinationRuntime>> = snapshot
            .clusters()
            .values()
            .flat_map(|cluster| cluster.destinations().iter())
            .map(|destination| {
                let runtime = Arc::clone(&destination.runtime);
                (
                    DestinationKey {
                        cluster_id: runtime.cluster_id().to_string(),
                        destination_id: runtime.destination_id().to_string(),
                        address: runtime.address().clone(),
                    },
                    runtime,
                )
            })
            .collect();

        self.runtimes
            .retain_async(|key, _| live.contains_key(key))
            .await;
        for (key, runtime) in live {
            let _ = self.runtimes.upsert_async(key, runtime).await;
        }
    }
}
