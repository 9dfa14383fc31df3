/// Adaptive resolution cache for templated node inputs
///
/// Entries are partitioned by run id and keyed by (normalized key, original key, raw
/// template). Nothing about an entry's lifetime is fixed at insertion: every access asks
/// the owning run's context store how many consumers the key still has and recomputes
/// the TTL from that count, the template's EMA resolution cost and memory pressure.
/// A key nobody will read again therefore stops hitting immediately.

use crate::cache::memory::{MemoryMonitor, SystemMemoryMonitor};
use crate::config::CacheConfig;
use crate::context::RunContextStore;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Identity of one cached resolution within a run
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Context key whose consumers drive the entry's lifetime
    pub normalized: String,
    /// Key as written by the author (e.g. `transform.message`)
    pub original: String,
    /// Raw templated value
    pub template: String,
}

impl CacheKey {
    pub fn new(key: &str, original: &str, template: &str) -> Self {
        Self {
            normalized: normalize_key(key),
            original: original.to_string(),
            template: template.to_string(),
        }
    }
}

/// Canonical form of a context key: `$.a.b`, `/a/b` and ` a.b ` all become `a.b`
pub fn normalize_key(key: &str) -> String {
    let trimmed = key.trim();
    let trimmed = trimmed.strip_prefix("$.").unwrap_or(trimmed);
    trimmed.trim_start_matches('/').replace('/', ".")
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    last_used: Instant,
    store: Weak<RunContextStore>,
}

#[derive(Debug, Default)]
struct RunPartition {
    entries: HashMap<CacheKey, CacheEntry>,
    /// normalized or original key → cache keys indexed under it
    index: HashMap<String, HashSet<CacheKey>>,
    /// EMA cost in ms; survives entry eviction
    costs: HashMap<CacheKey, f64>,
    lru: VecDeque<CacheKey>,
}

impl RunPartition {
    fn touch(&mut self, key: &CacheKey) {
        self.lru.retain(|k| k != key);
        self.lru.push_back(key.clone());
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        for form in [&key.normalized, &key.original] {
            self.index.entry(form.clone()).or_default().insert(key.clone());
        }
        self.touch(&key);
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.lru.retain(|k| k != key);
        for form in [&key.normalized, &key.original] {
            if let Some(keys) = self.index.get_mut(form) {
                keys.remove(key);
                if keys.is_empty() {
                    self.index.remove(form);
                }
            }
        }
        removed
    }

    fn pop_lru(&mut self) -> Option<CacheKey> {
        let key = self.lru.front()?.clone();
        self.remove(&key);
        Some(key)
    }

    fn invalidate(&mut self, form: &str) -> usize {
        let keys: Vec<CacheKey> = self
            .index
            .get(form)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.iter().filter(|key| self.remove(key)).count()
    }

    fn record_cost(&mut self, key: &CacheKey, sample_ms: f64, alpha: f64) -> f64 {
        let ema = match self.costs.get(key) {
            Some(previous) => alpha * sample_ms + (1.0 - alpha) * previous,
            None => sample_ms,
        };
        self.costs.insert(key.clone(), ema);
        ema
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub runs: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Process-wide resolution cache, partitioned by run id
#[derive(Debug)]
pub struct ResolutionCache {
    partitions: DashMap<String, RunPartition>,
    config: CacheConfig,
    memory: Arc<dyn MemoryMonitor>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResolutionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_monitor(config, Arc::new(SystemMemoryMonitor::default()))
    }

    pub fn with_monitor(config: CacheConfig, memory: Arc<dyn MemoryMonitor>) -> Self {
        Self {
            partitions: DashMap::new(),
            config,
            memory,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Admission rule: hot templates always, warm ones when they are (or may be) expensive
    pub fn should_cache(&self, consumers: i64, ema_ms: Option<f64>) -> bool {
        if consumers > self.config.hot_consumer_threshold {
            return true;
        }
        consumers >= self.config.min_consumers
            && ema_ms.map_or(true, |cost| cost >= self.config.expensive_cost_ms)
    }

    /// TTL for an entry given its live consumer count and EMA cost
    pub fn compute_ttl(&self, consumers: i64, ema_ms: Option<f64>) -> Duration {
        if consumers <= 0 {
            return Duration::ZERO;
        }
        if self.memory.usage_ratio() >= self.config.memory_pressure_threshold {
            return self.config.ttl_floor;
        }
        let Some(cost) = ema_ms else {
            return self.config.ttl_floor;
        };
        let millis = (cost * self.config.ttl_multiplier).max(0.0);
        Duration::from_secs_f64(millis / 1000.0).clamp(self.config.ttl_floor, self.config.ttl_ceiling)
    }

    /// Cached value for `key` if its recomputed TTL has not run out
    ///
    /// Expired entries (including every entry whose key lost its last consumer) are
    /// dropped on the way.
    pub fn get_cached(&self, run_id: &str, key: &CacheKey) -> Option<Value> {
        let mut partition = self.partitions.get_mut(run_id)?;
        let ema = partition.costs.get(key).copied();
        let hit = {
            let entry = partition.entries.get_mut(key)?;
            let consumers = entry
                .store
                .upgrade()
                .map(|store| store.consumer_count(&key.normalized))
                .unwrap_or(0);
            let ttl = self.compute_ttl(consumers, ema);
            if ttl.is_zero() || entry.inserted_at.elapsed() >= ttl {
                None
            } else {
                entry.last_used = Instant::now();
                Some(entry.value.clone())
            }
        };

        match hit {
            Some(value) => {
                partition.touch(key);
                Some(value)
            }
            None => {
                tracing::debug!("⌛ Cache entry for {} in run {} expired", key.original, run_id);
                partition.remove(key);
                None
            }
        }
    }

    /// Resolve through the cache
    ///
    /// Misses run `resolver`, feed its latency into the EMA and admit the result when
    /// the admission rule allows. Failed resolutions are returned as-is and never cached.
    pub async fn resolve<Fut, E>(
        &self,
        run_id: &str,
        key: CacheKey,
        store: &Arc<RunContextStore>,
        resolver: Fut,
    ) -> Result<Value, E>
    where
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(value) = self.get_cached(run_id, &key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("🎯 Cache hit for {} in run {}", key.original, run_id);
            return Ok(value);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let value = resolver.await?;
        let cost_ms = started.elapsed().as_secs_f64() * 1000.0;

        let consumers = store.consumer_count(&key.normalized);
        let tracked = store.is_tracked(&key.normalized);
        let mut partition = self.partitions.entry(run_id.to_string()).or_default();
        let prior = partition.costs.get(&key).copied();
        let ema = partition.record_cost(&key, cost_ms, self.config.ema_alpha);

        if tracked && consumers <= 0 {
            let dropped = partition.invalidate(&key.normalized);
            if dropped > 0 {
                tracing::debug!("♻️ Invalidated {} cache entries for exhausted key {}", dropped, key.normalized);
            }
        } else if self.should_cache(consumers, prior) {
            tracing::debug!(
                "💾 Caching {} for run {} ({} consumers, {:.2}ms avg)",
                key.original,
                run_id,
                consumers,
                ema
            );
            let now = Instant::now();
            partition.insert(
                key,
                CacheEntry {
                    value: value.clone(),
                    inserted_at: now,
                    last_used: now,
                    store: Arc::downgrade(store),
                },
            );
            let cap = self.config.max_entries_per_run;
            while cap > 0 && partition.entries.len() > cap {
                if partition.pop_lru().is_none() {
                    break;
                }
            }
        }

        Ok(value)
    }

    /// Drop every entry of a run indexed under `key` (normalized or original form)
    pub fn invalidate_key(&self, run_id: &str, key: &str) -> usize {
        let Some(mut partition) = self.partitions.get_mut(run_id) else {
            return 0;
        };
        let normalized = normalize_key(key);
        let mut dropped = partition.invalidate(&normalized);
        if normalized != key {
            dropped += partition.invalidate(key);
        }
        dropped
    }

    /// Purge everything cached for a finished or aborted run
    pub fn invalidate_workflow(&self, run_id: &str) -> usize {
        match self.partitions.remove(run_id) {
            Some((_, partition)) => {
                tracing::debug!("🧹 Purged {} cache entries for run {}", partition.entries.len(), run_id);
                partition.entries.len()
            }
            None => 0,
        }
    }

    /// EMA resolution cost recorded for `key`, in milliseconds
    pub fn cost_ema(&self, run_id: &str, key: &CacheKey) -> Option<f64> {
        self.partitions
            .get(run_id)
            .and_then(|partition| partition.costs.get(key).copied())
    }

    pub fn entry_count(&self, run_id: &str) -> usize {
        self.partitions
            .get(run_id)
            .map(|partition| partition.entries.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            runs: self.partitions.len(),
            entries: self.partitions.iter().map(|p| p.entries.len()).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::FixedMemoryMonitor;
    use crate::config::ContextConfig;
    use crate::context::RefValueFactory;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache(pressure: f64) -> ResolutionCache {
        ResolutionCache::with_monitor(CacheConfig::default(), Arc::new(FixedMemoryMonitor(pressure)))
    }

    fn store_with_consumers(key: &str, consumers: &[&str]) -> Arc<RunContextStore> {
        let store = Arc::new(RunContextStore::new("run", RefValueFactory::new(ContextConfig::default())));
        for consumer in consumers {
            store.register_consumer(key, consumer);
        }
        store
    }

    async fn resolve_counting(
        cache: &ResolutionCache,
        store: &Arc<RunContextStore>,
        key: &CacheKey,
        calls: &AtomicUsize,
    ) -> Value {
        cache
            .resolve("run", key.clone(), store, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(json!("resolved"))
            })
            .await
            .unwrap()
    }

    #[test]
    fn ttl_follows_cost_within_bounds() {
        let cache = cache(0.0);
        assert_eq!(cache.compute_ttl(0, Some(100.0)), Duration::ZERO);
        assert_eq!(cache.compute_ttl(3, Some(1000.0)), Duration::from_secs(20));
        assert_eq!(cache.compute_ttl(3, Some(0.01)), Duration::from_secs(1));
        assert_eq!(cache.compute_ttl(3, Some(1_000_000.0)), Duration::from_secs(900));
    }

    #[test]
    fn memory_pressure_collapses_ttl_to_floor() {
        let cache = cache(0.95);
        assert_eq!(cache.compute_ttl(3, Some(1000.0)), Duration::from_secs(1));
        assert_eq!(cache.compute_ttl(0, Some(1000.0)), Duration::ZERO);
    }

    #[test]
    fn admission_rule() {
        let cache = cache(0.0);
        assert!(cache.should_cache(6, Some(0.1)));
        assert!(cache.should_cache(2, None));
        assert!(cache.should_cache(2, Some(12.0)));
        assert!(!cache.should_cache(2, Some(1.0)));
        assert!(!cache.should_cache(1, None));
    }

    #[test]
    fn keys_are_normalized() {
        assert_eq!(normalize_key(" $.fetch.output "), "fetch.output");
        assert_eq!(normalize_key("/fetch/output"), "fetch.output");
    }

    #[tokio::test]
    async fn single_consumer_templates_bypass_the_cache() {
        let cache = cache(0.0);
        let store = store_with_consumers("fetch.output", &["a"]);
        let key = CacheKey::new("fetch.output", "a.name", "{{ fetch.output.name }}");
        let calls = AtomicUsize::new(0);

        resolve_counting(&cache, &store, &key, &calls).await;
        resolve_counting(&cache, &store, &key, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.entry_count("run"), 0);
        assert!(cache.cost_ema("run", &key).is_some());
    }

    #[tokio::test]
    async fn shared_templates_hit_until_demand_is_gone() {
        let cache = cache(0.0);
        let store = store_with_consumers("fetch.output", &["a", "b"]);
        let key = CacheKey::new("fetch.output", "a.name", "{{ fetch.output.name }}");
        let calls = AtomicUsize::new(0);

        resolve_counting(&cache, &store, &key, &calls).await;
        resolve_counting(&cache, &store, &key, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);

        store.consume("a", "fetch.output");
        store.consume("b", "fetch.output");
        assert_eq!(cache.get_cached("run", &key), None);
        assert_eq!(cache.entry_count("run"), 0);
    }

    #[tokio::test]
    async fn failed_resolutions_are_not_cached() {
        let cache = cache(0.0);
        let store = store_with_consumers("fetch.output", &["a", "b", "c"]);
        let key = CacheKey::new("fetch.output", "a.name", "{{ fetch.output.name }}");

        let result = cache
            .resolve("run", key.clone(), &store, async { Err::<Value, _>("boom") })
            .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(cache.get_cached("run", &key), None);
        assert_eq!(cache.cost_ema("run", &key), None);
    }

    #[tokio::test]
    async fn invalidation_by_key_and_run() {
        let cache = cache(0.0);
        let store = store_with_consumers("fetch.output", &["a", "b"]);
        let calls = AtomicUsize::new(0);
        let by_name = CacheKey::new("fetch.output", "a.name", "{{ fetch.output.name }}");
        let by_id = CacheKey::new("fetch.output", "b.id", "{{ fetch.output.id }}");
        resolve_counting(&cache, &store, &by_name, &calls).await;
        resolve_counting(&cache, &store, &by_id, &calls).await;
        assert_eq!(cache.entry_count("run"), 2);

        assert_eq!(cache.invalidate_key("run", "a.name"), 1);
        assert_eq!(cache.entry_count("run"), 1);
        assert_eq!(cache.invalidate_workflow("run"), 1);
        assert_eq!(cache.stats().runs, 0);
    }

    #[tokio::test]
    async fn partition_respects_lru_cap() {
        let config = CacheConfig {
            max_entries_per_run: 1,
            ..CacheConfig::default()
        };
        let cache = ResolutionCache::with_monitor(config, Arc::new(FixedMemoryMonitor(0.0)));
        let store = store_with_consumers("fetch.output", &["a", "b"]);
        let calls = AtomicUsize::new(0);
        let first = CacheKey::new("fetch.output", "a.x", "{{ fetch.output.x }}");
        let second = CacheKey::new("fetch.output", "a.y", "{{ fetch.output.y }}");
        resolve_counting(&cache, &store, &first, &calls).await;
        resolve_counting(&cache, &store, &second, &calls).await;

        assert_eq!(cache.entry_count("run"), 1);
        assert_eq!(cache.get_cached("run", &first), None);
        assert!(cache.get_cached("run", &second).is_some());
    }
}
