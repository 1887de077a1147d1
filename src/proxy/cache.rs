use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::CacheConfig;
use super::ProxyResponse;

/// Cache entry with metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    response: ProxyResponse,
    created_at: Instant,
    ttl: Duration,
    tick: u64,
}

impl CacheEntry {
    fn new(response: &ProxyResponse, ttl: Duration, tick: u64) -> Self {
        Self {
            response: response.clone(),
            created_at: Instant::now(),
            ttl,
            tick,
        }
    }

    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// Keys ordered by last use. Ticks are unique, so the first entry is always
/// the least recently used key.
#[derive(Debug, Default)]
struct AccessOrder {
    next_tick: u64,
    by_tick: BTreeMap<u64, String>,
}

impl AccessOrder {
    fn push(&mut self, key: &str) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.by_tick.insert(tick, key.to_string());
        tick
    }

    fn touch(&mut self, old_tick: u64, key: &str) -> u64 {
        self.by_tick.remove(&old_tick);
        self.push(key)
    }

    fn forget(&mut self, tick: u64) {
        self.by_tick.remove(&tick);
    }

    fn oldest(&mut self) -> Option<(u64, String)> {
        self.by_tick.pop_first()
    }
}

/// Response cache keyed by method and path, with TTL and LRU eviction
pub struct ResponseCache {
    config: CacheConfig,
    cache: Arc<DashMap<String, CacheEntry>>,
    access_order: Arc<Mutex<AccessOrder>>,
    statistics: Arc<RwLock<CacheStatistics>>,
}

#[derive(Debug, Default)]
struct CacheStatistics {
    total_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    cache_sets: u64,
    cache_evictions: u64,
    cache_size_bytes: u64,
    expired_entries: u64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        if config.enabled {
            info!(
                "Cache initialized with max entries: {}, TTL: {:?}",
                config.max_entries, config.ttl
            );
        }

        Self {
            config: config.clone(),
            cache: Arc::new(DashMap::new()),
            access_order: Arc::new(Mutex::new(AccessOrder::default())),
            statistics: Arc::new(RwLock::new(CacheStatistics::default())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Periodically drops expired entries.
    pub fn start_cleanup_task(self: &Arc<Self>, period: Duration) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                cache.sweep_expired().await;
            }
        });
    }

    pub async fn sweep_expired(&self) -> usize {
        let mut expired_count = 0usize;
        let mut removed_size = 0u64;

        self.cache.retain(|_key, entry| {
            if entry.is_expired() {
                expired_count += 1;
                removed_size += entry.response.body.len() as u64;
                self.access_order.lock().forget(entry.tick);
                false
            } else {
                true
            }
        });

        if expired_count > 0 {
            let mut stats = self.statistics.write().await;
            stats.expired_entries += expired_count as u64;
            stats.cache_size_bytes = stats.cache_size_bytes.saturating_sub(removed_size);
            debug!(
                "Cleaned up {} expired cache entries, freed {} bytes",
                expired_count, removed_size
            );
        }

        expired_count
    }

    /// Get cached response if available and not expired
    pub async fn get(&self, key: &str) -> Option<ProxyResponse> {
        if !self.config.enabled {
            return None;
        }

        let (hit, expired) = match self.cache.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.tick = self.access_order.lock().touch(entry.tick, key);
                (Some(entry.response.clone()), false)
            }
            Some(_) => (None, true),
            None => (None, false),
        };
        let freed = if expired {
            self.cache
                .remove_if(key, |_, entry| entry.is_expired())
                .map(|(_, entry)| {
                    self.access_order.lock().forget(entry.tick);
                    entry.response.body.len() as u64
                })
        } else {
            None
        };

        let mut stats = self.statistics.write().await;
        stats.total_requests += 1;
        if let Some(size) = freed {
            stats.expired_entries += 1;
            stats.cache_size_bytes = stats.cache_size_bytes.saturating_sub(size);
        }
        if hit.is_some() {
            stats.cache_hits += 1;
            debug!("Cache HIT for key: {}", key);
        } else {
            stats.cache_misses += 1;
            debug!("Cache MISS for key: {}", key);
        }

        hit
    }

    /// Store response in cache
    pub async fn set(&self, key: String, response: &ProxyResponse) {
        if !self.config.enabled || self.config.ttl.is_zero() || self.config.max_entries == 0 {
            return;
        }

        if !self.cache.contains_key(&key) && self.cache.len() >= self.config.max_entries {
            self.evict_lru_entry().await;
        }

        let tick = self.access_order.lock().push(&key);
        let entry = CacheEntry::new(response, self.config.ttl, tick);
        let entry_size = entry.response.body.len() as u64;
        let replaced = self.cache.insert(key.clone(), entry);
        if let Some(old) = &replaced {
            self.access_order.lock().forget(old.tick);
        }

        let mut stats = self.statistics.write().await;
        stats.cache_sets += 1;
        stats.cache_size_bytes += entry_size;
        if let Some(old) = replaced {
            stats.cache_size_bytes = stats
                .cache_size_bytes
                .saturating_sub(old.response.body.len() as u64);
        }

        debug!("Cache SET for key: {}, size: {} bytes", key, entry_size);
    }

    async fn evict_lru_entry(&self) {
        // Ticks left behind by concurrent removals no longer match an entry.
        let evicted = loop {
            let (tick, key) = match self.access_order.lock().oldest() {
                Some(oldest) => oldest,
                None => return,
            };
            if let Some((key, entry)) = self.cache.remove_if(&key, |_, entry| entry.tick == tick) {
                break (key, entry);
            }
        };

        let (key, entry) = evicted;
        let mut stats = self.statistics.write().await;
        stats.cache_evictions += 1;
        stats.cache_size_bytes = stats
            .cache_size_bytes
            .saturating_sub(entry.response.body.len() as u64);
        debug!("Evicted LRU cache entry {}", key);
    }

    /// Clear all cache entries
    pub async fn clear(&self) {
        self.cache.clear();
        self.access_order.lock().by_tick.clear();
        let mut stats = self.statistics.write().await;
        stats.cache_size_bytes = 0;
        info!("Cache cleared");
    }

    /// Get cache statistics
    pub async fn get_statistics(&self) -> serde_json::Value {
        let stats = self.statistics.read().await;

        serde_json::json!({
            "enabled": self.config.enabled,
            "statistics": {
                "total_requests": stats.total_requests,
                "cache_hits": stats.cache_hits,
                "cache_misses": stats.cache_misses,
                "hit_rate": if stats.total_requests > 0 {
                    stats.cache_hits as f64 / stats.total_requests as f64
                } else {
                    0.0
                },
                "cache_sets": stats.cache_sets,
                "cache_evictions": stats.cache_evictions,
                "expired_entries": stats.expired_entries,
                "cache_size_bytes": stats.cache_size_bytes,
                "current_entries": self.cache.len(),
                "max_entries": self.config.max_entries,
            },
            "configuration": {
                "ttl_seconds": self.config.ttl.as_secs(),
            }
        })
    }
}
