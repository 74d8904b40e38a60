//! Cache-affinity manager: remembers which `(provider, endpoint, key)`
//! last served a given `(client-key, api_format, model)` so later requests
//! reuse it and benefit from prompt caching upstream.
//!
//! An in-process L1 (bounded LRU, short TTL) fronts an `AffinityStore` L2
//! trait. The default `InMemoryAffinityStore` is the per-process fallback;
//! a real multi-replica deployment would back the trait with a shared
//! store, but that store is not part of this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffinityKey {
    pub client_key_id: i64,
    pub api_format: String,
    pub model: String,
}

impl AffinityKey {
    pub fn store_key(&self) -> String {
        format!("affinity:{}:{}:{}", self.client_key_id, self.api_format, self.model)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AffinityTarget {
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
}

#[derive(Debug, Clone)]
struct AffinityRecord {
    target: AffinityTarget,
    hit_count: u64,
    expire_at: Instant,
}

#[async_trait]
pub trait AffinityStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<(AffinityTarget, u64, Instant)>;
    async fn put(&self, key: String, target: AffinityTarget, hit_count: u64, expire_at: Instant);
    async fn remove(&self, key: &str);
    /// Remove every entry pointing at the given provider (provider deactivated).
    async fn remove_by_provider(&self, provider_id: i64);
}

pub struct InMemoryAffinityStore {
    records: RwLock<HashMap<String, AffinityRecord>>,
}

impl InMemoryAffinityStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAffinityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AffinityStore for InMemoryAffinityStore {
    async fn get(&self, key: &str) -> Option<(AffinityTarget, u64, Instant)> {
        self.records
            .read()
            .await
            .get(key)
            .map(|r| (r.target, r.hit_count, r.expire_at))
    }

    async fn put(&self, key: String, target: AffinityTarget, hit_count: u64, expire_at: Instant) {
        self.records.write().await.insert(
            key,
            AffinityRecord {
                target,
                hit_count,
                expire_at,
            },
        );
    }

    async fn remove(&self, key: &str) {
        self.records.write().await.remove(key);
    }

    async fn remove_by_provider(&self, provider_id: i64) {
        self.records
            .write()
            .await
            .retain(|_, r| r.target.provider_id != provider_id);
    }
}

struct L1Entry {
    target: AffinityTarget,
    cached_at: Instant,
}

pub struct AffinityConfig {
    pub default_ttl: Duration,
    pub l1_ttl: Duration,
    pub l1_max_size: usize,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            l1_ttl: Duration::from_secs(15),
            l1_max_size: 4096,
        }
    }
}

pub struct AffinityManager {
    config: AffinityConfig,
    store: Arc<dyn AffinityStore>,
    l1: RwLock<(HashMap<String, L1Entry>, VecDeque<String>)>,
    clock: Arc<dyn Clock>,
}

impl AffinityManager {
    pub fn new(config: AffinityConfig, store: Arc<dyn AffinityStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            l1: RwLock::new((HashMap::new(), VecDeque::new())),
            clock,
        }
    }

    async fn l1_get(&self, key: &str) -> Option<AffinityTarget> {
        let now = self.clock.now();
        let mut l1 = self.l1.write().await;
        if let Some(entry) = l1.0.get(key) {
            if now.duration_since(entry.cached_at) <= self.config.l1_ttl {
                return Some(entry.target);
            }
            l1.0.remove(key);
        }
        None
    }

    async fn l1_put(&self, key: String, target: AffinityTarget) {
        let now = self.clock.now();
        let mut l1 = self.l1.write().await;
        if !l1.0.contains_key(&key) {
            l1.1.push_back(key.clone());
        }
        l1.0.insert(key.clone(), L1Entry { target, cached_at: now });
        while l1.0.len() > self.config.l1_max_size {
            if let Some(oldest) = l1.1.pop_front() {
                l1.0.remove(&oldest);
            } else {
                break;
            }
        }
    }

    async fn l1_invalidate(&self, key: &str) {
        let mut l1 = self.l1.write().await;
        l1.0.remove(key);
    }

    /// Planner lookup: returns the target to move to the front, if present
    /// and not expired in L2.
    pub async fn lookup(&self, key: &AffinityKey) -> Option<AffinityTarget> {
        let store_key = key.store_key();
        if let Some(target) = self.l1_get(&store_key).await {
            return Some(target);
        }
        let now = self.clock.now();
        let (target, _hits, expire_at) = self.store.get(&store_key).await?;
        if expire_at <= now {
            self.store.remove(&store_key).await;
            return None;
        }
        self.l1_put(store_key, target).await;
        Some(target)
    }

    /// Refresh (or create) the affinity record after a successful attempt,
    /// sliding the TTL forward.
    pub async fn record_success(&self, key: &AffinityKey, target: AffinityTarget) {
        let store_key = key.store_key();
        let now = self.clock.now();
        let hit_count = self
            .store
            .get(&store_key)
            .await
            .map(|(_, hits, _)| hits + 1)
            .unwrap_or(1);
        let expire_at = now + self.config.default_ttl;
        self.store
            .put(store_key.clone(), target, hit_count, expire_at)
            .await;
        self.l1_put(store_key, target).await;
    }

    /// Non-retriable failure on the affine target invalidates the record.
    pub async fn invalidate(&self, key: &AffinityKey) {
        let store_key = key.store_key();
        self.store.remove(&store_key).await;
        self.l1_invalidate(&store_key).await;
    }

    /// Provider deactivated: purge every affinity pointing at it. L1 is not
    /// indexed by provider, so it is left to expire naturally (≤ `l1_ttl`).
    pub async fn invalidate_provider(&self, provider_id: i64) {
        self.store.remove_by_provider(provider_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::clock::TestClock;

    fn manager() -> (AffinityManager, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new());
        (
            AffinityManager::new(
                AffinityConfig::default(),
                Arc::new(InMemoryAffinityStore::new()),
                clock.clone(),
            ),
            clock,
        )
    }

    fn key() -> AffinityKey {
        AffinityKey {
            client_key_id: 1,
            api_format: "claude".to_string(),
            model: "sonnet".to_string(),
        }
    }

    #[tokio::test]
    async fn records_and_finds_affinity() {
        let (manager, _clock) = manager();
        let target = AffinityTarget {
            provider_id: 1,
            endpoint_id: 2,
            key_id: 3,
        };
        manager.record_success(&key(), target).await;
        let found = manager.lookup(&key()).await.unwrap();
        assert_eq!(found.key_id, 3);
    }

    #[tokio::test]
    async fn ttl_expiry_evicts_from_l2() {
        let (manager, clock) = manager();
        let target = AffinityTarget {
            provider_id: 1,
            endpoint_id: 2,
            key_id: 3,
        };
        manager.record_success(&key(), target).await;
        clock.advance(Duration::from_secs(301));
        assert!(manager.lookup(&key()).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_record() {
        let (manager, _clock) = manager();
        let target = AffinityTarget {
            provider_id: 1,
            endpoint_id: 2,
            key_id: 3,
        };
        manager.record_success(&key(), target).await;
        manager.invalidate(&key()).await;
        assert!(manager.lookup(&key()).await.is_none());
    }

    #[tokio::test]
    async fn provider_deactivation_purges_matching_targets() {
        let (manager, _clock) = manager();
        let target = AffinityTarget {
            provider_id: 9,
            endpoint_id: 2,
            key_id: 3,
        };
        manager.record_success(&key(), target).await;
        manager.invalidate_provider(9).await;
        assert!(manager.store.get(&key().store_key()).await.is_none());
    }
}
