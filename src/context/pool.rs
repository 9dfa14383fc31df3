/// Run-keyed pool of context stores with idle eviction
///
/// Each workflow run owns exactly one `RunContextStore`. The pool hands stores out by run
/// id and reclaims idle ones: past the idle TTL, or least-recently-used when over the
/// run cap. A store that an in-flight run still holds is never evicted.

use crate::config::PoolConfig;
use crate::context::factory::RefValueFactory;
use crate::context::store::RunContextStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct PoolSlot {
    store: Arc<RunContextStore>,
    last_access: Instant,
}

/// Registry of live run stores, keyed by run id
///
/// Every store it creates shares one `RefValueFactory`, so all runs spool into the same
/// directory with the same thresholds.
#[derive(Debug)]
pub struct ContextPool {
    runs: DashMap<String, PoolSlot>,
    factory: RefValueFactory,
    config: PoolConfig,
}

impl ContextPool {
    /// Create an empty pool; eviction follows `config`
    pub fn new(factory: RefValueFactory, config: PoolConfig) -> Self {
        Self {
            runs: DashMap::new(),
            factory,
            config,
        }
    }

    /// Look up the store for a run, creating it on first use
    pub fn get_or_create(&self, run_id: &str) -> Arc<RunContextStore> {
        let store = {
            let mut slot = self.runs.entry(run_id.to_string()).or_insert_with(|| {
                tracing::debug!("🆕 Creating context store for run {}", run_id);
                PoolSlot {
                    store: Arc::new(RunContextStore::new(run_id, self.factory.clone())),
                    last_access: Instant::now(),
                }
            });
            slot.last_access = Instant::now();
            Arc::clone(&slot.store)
        };
        self.evict_over_capacity();
        store
    }

    /// Existing store for a run, if any
    pub fn get(&self, run_id: &str) -> Option<Arc<RunContextStore>> {
        self.runs.get_mut(run_id).map(|mut slot| {
            slot.last_access = Instant::now();
            Arc::clone(&slot.store)
        })
    }

    /// Drop a run's store and release everything it holds
    pub fn remove(&self, run_id: &str) -> bool {
        match self.runs.remove(run_id) {
            Some((_, slot)) => {
                slot.store.clear();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.runs.iter().map(|slot| slot.key().clone()).collect()
    }

    fn is_idle(slot: &PoolSlot) -> bool {
        Arc::strong_count(&slot.store) == 1
    }

    /// Reclaim stores idle past the TTL; returns the evicted run ids
    pub fn evict_idle(&self) -> Vec<String> {
        let ttl = self.config.idle_ttl;
        let expired: Vec<String> = self
            .runs
            .iter()
            .filter(|slot| Self::is_idle(slot) && slot.last_access.elapsed() >= ttl)
            .map(|slot| slot.key().clone())
            .collect();

        let evicted: Vec<String> = expired
            .into_iter()
            .filter(|run_id| {
                self.runs
                    .remove_if(run_id, |_, slot| Self::is_idle(slot))
                    .map(|(_, slot)| slot.store.clear())
                    .is_some()
            })
            .collect();

        if !evicted.is_empty() {
            tracing::info!("🧹 Evicted {} idle run context stores", evicted.len());
        }
        evicted
    }

    fn evict_over_capacity(&self) {
        let max = self.config.max_runs;
        if max == 0 {
            return;
        }
        while self.runs.len() > max {
            let oldest = self
                .runs
                .iter()
                .filter(|slot| Self::is_idle(slot))
                .min_by_key(|slot| slot.last_access)
                .map(|slot| slot.key().clone());

            let Some(run_id) = oldest else {
                tracing::warn!("⚠️ Context pool over capacity ({} runs) but every store is in use", self.runs.len());
                break;
            };
            if let Some((_, slot)) = self.runs.remove_if(&run_id, |_, slot| Self::is_idle(slot)) {
                tracing::debug!("🧹 Evicting least recently used run {}", run_id);
                slot.store.clear();
            }
        }
    }

    /// Periodically evict idle runs on the tokio runtime
    pub fn spawn_sweeper(pool: Arc<Self>) -> JoinHandle<()> {
        let interval = pool.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.evict_idle();
            }
        })
    }
}
