use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::ports::cache::{CachedResponse, ResponseCache};

struct Entry {
    response: CachedResponse,
    region: Option<String>,
    expires_at: Instant,
}

/// In-process [`ResponseCache`] backed by a concurrent map.
///
/// Expired entries are dropped lazily when read; `purge_expired` sweeps the
/// rest and can be called from a background task.
pub struct MemoryResponseCache {
    entries: scc::HashMap<String, Entry>,
}

impl std::fmt::Debug for MemoryResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResponseCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Default for MemoryResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResponseCache {
    pub fn new() -> Self {
        Self {
            entries: scc::HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry; returns how many are left.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.entries
            .retain_async(|_, entry| entry.expires_at > now)
            .await;
        self.entries.len()
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        let now = Instant::now();
        let hit = self.entries.get_async(key).await.map(|entry| {
            let entry = entry.get();
            (entry.expires_at > now).then(|| entry.response.clone())
        });

        match hit {
            Some(Some(response)) => Some(response),
            Some(None) => {
                self.entries.remove_async(key).await;
                tracing::trace!("Cache entry expired: {}", key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: String, region: Option<String>, response: CachedResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let entry = Entry {
            response,
            region,
            expires_at: Instant::now() + ttl,
        };
        self.entries.upsert_async(key, entry).await;
    }

    async fn clear_region(&self, region: &str) {
        self.entries
            .retain_async(|_, entry| entry.region.as_deref() != Some(region))
            .await;
        tracing::debug!("Cleared cache region {}", region);
    }
}
