/// Run context store: per-run map from key to RefValue with consumer reference counts
///
/// The engine registers, at workflow-build time, which nodes read each context key.
/// Every read through `get_and_clean` / `consume` retires one consumer; when the last one
/// is gone the entry is removed and its RefValue released on the spot. Inside a loop the
/// retirements are parked in a per-loop ledger and only applied by `end_loop`, so later
/// iterations can still read the same keys.
///
/// Node writes are staged in a pending buffer and only become visible on
/// `flush_pending_writes`, which also drops values nobody is registered to read.

use crate::context::factory::RefValueFactory;
use crate::context::payload::{Payload, WriteOptions};
use crate::context::ref_value::{ByteStream, RefValue};
use crate::error::ContextResult;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::AsyncRead;

const MAX_ALIAS_DEPTH: usize = 16;

/// Remaining readers of one context key
#[derive(Debug, Default)]
struct ConsumerState {
    remaining: i64,
    registered: HashSet<String>,
    consumed: HashSet<String>,
}

/// A write staged by a node, not yet visible to readers
#[derive(Debug)]
enum PendingWrite {
    /// Materialized at flush time
    Value { payload: Payload, options: WriteOptions },
    /// Already built from a stream (streams cannot be buffered twice)
    Built { value: RefValue, options: WriteOptions },
}

impl PendingWrite {
    fn options(&self) -> &WriteOptions {
        match self {
            PendingWrite::Value { options, .. } | PendingWrite::Built { options, .. } => options,
        }
    }

    fn discard(self) {
        if let PendingWrite::Built { value, .. } = self {
            value.release();
        }
    }
}

#[derive(Debug, Default)]
struct LoopState {
    /// Active loop ids, innermost last
    stack: Vec<String>,
    /// loop id → key → consumers whose decrement waits for the loop end
    deferred: HashMap<String, HashMap<String, HashSet<String>>>,
}

/// What a consumer read did to a key's count
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumption {
    /// Key has no consumer record; lives until removed or cleared
    Untracked,
    /// This consumer was already retired for the key
    AlreadyConsumed,
    /// Parked until the named loop ends
    Deferred { loop_id: String },
    /// Count decremented, readers remain
    Decremented { remaining: i64 },
    /// Count reached zero; the entry (if any) was removed and released
    Collected,
}

/// Result of committing a node's staged writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub committed: Vec<String>,
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub pending: usize,
    pub active_loops: usize,
    pub estimated_bytes: u64,
}

/// Context store owned by exactly one workflow run
#[derive(Debug)]
pub struct RunContextStore {
    run_id: String,
    factory: RefValueFactory,
    entries: DashMap<String, Arc<RefValue>>,
    consumers: DashMap<String, ConsumerState>,
    aliases: DashMap<String, String>,
    pending: Mutex<HashMap<String, PendingWrite>>,
    loops: Mutex<LoopState>,
}

impl RunContextStore {
    /// Create an empty store for `run_id`
    ///
    /// Values are built through `factory`, which decides their backend. Consumers are
    /// registered separately, normally by the engine from the compiled workflow.
    pub fn new(run_id: impl Into<String>, factory: RefValueFactory) -> Self {
        Self {
            run_id: run_id.into(),
            factory,
            entries: DashMap::new(),
            consumers: DashMap::new(),
            aliases: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            loops: Mutex::new(LoopState::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    // ------------------------------------------------------------------
    // Consumer bookkeeping
    // ------------------------------------------------------------------

    /// Register a node that will read `key`; registering the same node twice is a no-op
    pub fn register_consumer(&self, key: &str, consumer_id: &str) {
        let mut state = self.consumers.entry(key.to_string()).or_default();
        if state.registered.insert(consumer_id.to_string()) {
            state.remaining += 1;
        }
    }

    /// Set an anonymous consumer count for `key`, replacing any registrations
    pub fn set_consumer_count(&self, key: &str, count: i64) {
        self.consumers.insert(
            key.to_string(),
            ConsumerState {
                remaining: count,
                ..ConsumerState::default()
            },
        );
    }

    /// Live consumer count; keys without a record report zero
    pub fn consumer_count(&self, key: &str) -> i64 {
        let key = self.resolve_key(key);
        self.consumers.get(&key).map(|s| s.remaining).unwrap_or(0)
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.consumers.contains_key(&self.resolve_key(key))
    }

    // ------------------------------------------------------------------
    // Aliases
    // ------------------------------------------------------------------

    /// Make `alias` resolve to `target` for every read
    pub fn alias(&self, alias: &str, target: &str) {
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    /// Follow alias links; cycles stop at the first repeated key
    pub fn resolve_key(&self, key: &str) -> String {
        let mut current = key.to_string();
        let mut seen = HashSet::new();
        for _ in 0..MAX_ALIAS_DEPTH {
            let Some(next) = self.aliases.get(&current).map(|t| t.value().clone()) else {
                break;
            };
            if !seen.insert(current.clone()) {
                tracing::warn!("⚠️ Alias cycle detected at '{}' in run {}", current, self.run_id);
                break;
            }
            current = next;
        }
        current
    }

    // ------------------------------------------------------------------
    // Reads and direct writes
    // ------------------------------------------------------------------

    /// Materializing write straight into the live map
    pub async fn put(&self, key: &str, payload: impl Into<Payload>) {
        self.put_with(key, payload, WriteOptions::default()).await
    }

    pub async fn put_with(&self, key: &str, payload: impl Into<Payload>, options: WriteOptions) {
        let value = self
            .factory
            .create(payload.into(), options.storage, options.media_type)
            .await;
        self.commit(key.to_string(), value);
    }

    fn commit(&self, key: String, value: RefValue) {
        tracing::debug!("📝 [{}] {} ← {:?} ({} bytes)", self.run_id, key, value.backend_kind(), value.size());
        if let Some(replaced) = self.entries.insert(key, Arc::new(value)) {
            replaced.release();
        }
    }

    /// Materializing read; aliases are resolved first
    pub async fn get(&self, key: &str) -> ContextResult<Option<Payload>> {
        match self.get_ref(key) {
            Some(value) => value.read().await.map(Some),
            None => Ok(None),
        }
    }

    /// Non-materializing handle to the stored value
    pub fn get_ref(&self, key: &str) -> Option<Arc<RefValue>> {
        let key = self.resolve_key(key);
        self.entries.get(&key).map(|v| Arc::clone(v.value()))
    }

    /// Raw byte stream of a stored value
    pub async fn open_stream(&self, key: &str) -> ContextResult<Option<ByteStream>> {
        match self.get_ref(key) {
            Some(value) => value.open_stream().await.map(Some),
            None => Ok(None),
        }
    }

    /// Projected read (pointer / JSONPath / dotted path)
    pub async fn select(&self, key: &str, selector: &str) -> ContextResult<Option<Value>> {
        match self.get_ref(key) {
            Some(value) => value.select(selector).await,
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&self.resolve_key(key))
    }

    /// Remove and release immediately, regardless of consumers
    pub fn remove(&self, key: &str) -> bool {
        let key = self.resolve_key(key);
        match self.entries.remove(&key) {
            Some((_, value)) => {
                value.release();
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Consumption
    // ------------------------------------------------------------------

    /// Read `key` for `consumer_id`, then retire that consumer
    pub async fn get_and_clean(&self, consumer_id: &str, key: &str) -> ContextResult<Option<Payload>> {
        let value = self.get(key).await?;
        self.consume(consumer_id, key);
        Ok(value)
    }

    /// Retire one consumer of `key` without reading it
    pub fn consume(&self, consumer_id: &str, key: &str) -> Consumption {
        let key = self.resolve_key(key);

        {
            let Some(state) = self.consumers.get(&key) else {
                return Consumption::Untracked;
            };
            if state.consumed.contains(consumer_id) {
                return Consumption::AlreadyConsumed;
            }
        }

        {
            let mut loops = self.loops.lock();
            if let Some(loop_id) = loops.stack.last().cloned() {
                loops
                    .deferred
                    .entry(loop_id.clone())
                    .or_default()
                    .entry(key.clone())
                    .or_default()
                    .insert(consumer_id.to_string());
                tracing::debug!("⏳ [{}] Deferred '{}' consumption of {} until loop '{}' ends",
                    self.run_id, consumer_id, key, loop_id);
                return Consumption::Deferred { loop_id };
            }
        }

        self.retire(consumer_id, &key)
    }

    fn retire(&self, consumer_id: &str, key: &str) -> Consumption {
        let remaining = {
            let Some(mut state) = self.consumers.get_mut(key) else {
                return Consumption::Untracked;
            };
            if !state.consumed.insert(consumer_id.to_string()) {
                return Consumption::AlreadyConsumed;
            }
            state.remaining -= 1;
            state.remaining
        };

        if remaining <= 0 {
            self.collect(key);
            Consumption::Collected
        } else {
            Consumption::Decremented { remaining }
        }
    }

    fn collect(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, value)) => {
                value.release();
                tracing::debug!("♻️ [{}] Collected {} (no consumers left)", self.run_id, key);
                true
            }
            None => false,
        }
    }

    /// Remove every tracked entry whose consumer count is at or below zero
    pub fn garbage_collect(&self) -> Vec<String> {
        let exhausted: Vec<String> = self
            .consumers
            .iter()
            .filter(|state| state.remaining <= 0)
            .map(|state| state.key().clone())
            .collect();
        exhausted.into_iter().filter(|key| self.collect(key)).collect()
    }

    // ------------------------------------------------------------------
    // Loop scopes
    // ------------------------------------------------------------------

    /// Open a loop scope; returns false if it was already open
    pub fn start_loop(&self, loop_id: &str) -> bool {
        let mut loops = self.loops.lock();
        if loops.stack.iter().any(|id| id == loop_id) {
            return false;
        }
        loops.stack.push(loop_id.to_string());
        tracing::debug!("🔁 [{}] Loop '{}' started", self.run_id, loop_id);
        true
    }

    pub fn is_loop_active(&self, loop_id: &str) -> bool {
        self.loops.lock().stack.iter().any(|id| id == loop_id)
    }

    pub fn active_loops(&self) -> Vec<String> {
        self.loops.lock().stack.clone()
    }

    /// Close a loop scope and apply its deferred decrements
    ///
    /// Returns the keys whose count reached zero. Ending a loop that was never opened
    /// only logs a warning.
    pub fn end_loop(&self, loop_id: &str) -> Vec<String> {
        let ledger = {
            let mut loops = self.loops.lock();
            let Some(position) = loops.stack.iter().position(|id| id == loop_id) else {
                tracing::warn!("⚠️ [{}] end_loop('{}') without a matching start_loop", self.run_id, loop_id);
                return Vec::new();
            };
            loops.stack.remove(position);
            loops.deferred.remove(loop_id).unwrap_or_default()
        };

        let mut exhausted = Vec::new();
        for (key, consumers) in ledger {
            for consumer in consumers {
                if self.retire(&consumer, &key) == Consumption::Collected {
                    exhausted.push(key.clone());
                }
            }
        }
        tracing::debug!("🔚 [{}] Loop '{}' ended, {} keys exhausted", self.run_id, loop_id, exhausted.len());
        exhausted
    }

    /// End every open loop, innermost first
    pub fn end_all_loops(&self) -> Vec<String> {
        let open = self.active_loops();
        open.iter().rev().flat_map(|id| self.end_loop(id)).collect()
    }

    // ------------------------------------------------------------------
    // Pending writes
    // ------------------------------------------------------------------

    /// Stage a write; invisible to readers until flushed
    pub fn write(&self, key: &str, payload: impl Into<Payload>, options: WriteOptions) {
        let staged = PendingWrite::Value {
            payload: payload.into(),
            options,
        };
        if let Some(previous) = self.pending.lock().insert(key.to_string(), staged) {
            previous.discard();
        }
    }

    /// Stage a stream write; the RefValue is built now, from the stream
    pub async fn write_stream<R>(&self, key: &str, reader: &mut R, options: WriteOptions) -> ContextResult<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let value = self
            .factory
            .create_from_stream(reader, options.storage, options.media_type.clone())
            .await?;
        let staged = PendingWrite::Built { value, options };
        if let Some(previous) = self.pending.lock().insert(key.to_string(), staged) {
            previous.discard();
        }
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Commit staged writes under `<node_key>.<relative key>`
    ///
    /// Writes nobody is registered to read are dropped instead of materialized, unless
    /// they opted out of auto cleanup.
    pub async fn flush_pending_writes(&self, node_key: &str) -> FlushReport {
        let staged: Vec<(String, PendingWrite)> = self.pending.lock().drain().collect();
        let mut report = FlushReport::default();

        for (relative, write) in staged {
            let scoped = format!("{}.{}", node_key, relative);
            if write.options().auto_cleanup && self.consumer_count(&scoped) <= 0 {
                tracing::debug!("🚮 [{}] Dropping {} (no registered consumers)", self.run_id, scoped);
                write.discard();
                report.dropped.push(scoped);
                continue;
            }

            let value = match write {
                PendingWrite::Value { payload, options } => {
                    self.factory
                        .create(payload, options.storage, options.media_type)
                        .await
                }
                PendingWrite::Built { value, .. } => value,
            };
            self.commit(scoped.clone(), value);
            report.committed.push(scoped);
        }

        report
    }

    /// Discard staged writes (node failure); stream-built values are released
    pub fn clear_pending_writes(&self) -> usize {
        let staged: Vec<PendingWrite> = self.pending.lock().drain().map(|(_, w)| w).collect();
        let count = staged.len();
        staged.into_iter().for_each(PendingWrite::discard);
        if count > 0 {
            tracing::debug!("🧹 [{}] Discarded {} pending writes", self.run_id, count);
        }
        count
    }

    // ------------------------------------------------------------------
    // Teardown and stats
    // ------------------------------------------------------------------

    /// Release every value and empty all maps
    pub fn clear(&self) {
        self.clear_pending_writes();
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, value)) = self.entries.remove(&key) {
                value.release();
            }
        }
        self.consumers.clear();
        self.aliases.clear();
        *self.loops.lock() = LoopState::default();
        tracing::debug!("🧽 [{}] Context store cleared", self.run_id);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.entries.len(),
            pending: self.pending_len(),
            active_loops: self.loops.lock().stack.len(),
            estimated_bytes: self.entries.iter().map(|e| e.value().size()).sum(),
        }
    }
}
