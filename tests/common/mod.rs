//! Common test utilities for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use mechaway_core::cache::{FixedMemoryMonitor, ResolutionCache};
use mechaway_core::config::{Config, ContextConfig};
use mechaway_core::context::{RefValueFactory, RunContextStore};
use mechaway_core::runtime::{
    ExecutionEngine, ExecutionResult, ExecutorRegistry, NodeContext, NodeExecutor, ResolvedConfig, ValidationError,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Context thresholds with the spool directory pointed at a test temp dir.
pub fn test_context_config(dir: &Path) -> ContextConfig {
    ContextConfig {
        memory_threshold: 1024 * 1024,
        json_threshold: 2 * 1024 * 1024,
        base64_threshold: 512 * 1024,
        spool_dir: dir.to_path_buf(),
        spool_prefix: "mechaway-test".to_string(),
    }
}

pub fn test_store(dir: &Path) -> Arc<RunContextStore> {
    Arc::new(RunContextStore::new(
        "test-run",
        RefValueFactory::new(test_context_config(dir)),
    ))
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.context = test_context_config(dir);
    config.engine.max_steps = 100;
    config
}

/// Engine over `registry` with a cache that never sees memory pressure.
pub fn test_engine(config: &Config, registry: Arc<ExecutorRegistry>) -> ExecutionEngine {
    let cache = ResolutionCache::with_monitor(config.cache.clone(), Arc::new(FixedMemoryMonitor(0.0)));
    ExecutionEngine::new(config, registry).with_cache(Arc::new(cache))
}

/// What a scripted node saw when it ran.
#[derive(Debug, Clone)]
pub struct Call {
    pub node: String,
    pub inputs: Map<String, Value>,
    pub active_loops: Vec<String>,
    /// watched key → (present in store, live consumer count)
    pub watched: HashMap<String, (bool, i64)>,
}

/// Returns queued results per node key; falls back to SUCCESS with `{"node": key}`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ExecutionResult>>>,
    watched: Vec<String>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, node: &str, results: Vec<ExecutionResult>) -> Self {
        self.scripts.lock().insert(node.to_string(), results.into());
        self
    }

    /// Record presence and consumer count of `key` on every call.
    pub fn watch(mut self, key: &str) -> Self {
        self.watched.push(key.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, node: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.node == node).collect()
    }

    pub fn visited(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.node).collect()
    }
}

#[async_trait]
impl NodeExecutor for ScriptedExecutor {
    async fn execute(&self, config: &ResolvedConfig, ctx: &NodeContext) -> anyhow::Result<ExecutionResult> {
        let store = ctx.store();
        let watched = self
            .watched
            .iter()
            .map(|key| (key.clone(), (store.contains(key), store.consumer_count(key))))
            .collect();
        self.calls.lock().push(Call {
            node: config.node_key.clone(),
            inputs: config.inputs.clone(),
            active_loops: store.active_loops(),
            watched,
        });

        let scripted = self
            .scripts
            .lock()
            .get_mut(&config.node_key)
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or_else(|| ExecutionResult::success(Some(output(json!({"node": config.node_key}))))))
    }
}

/// Always raises.
#[derive(Debug)]
pub struct FailingExecutor;

#[async_trait]
impl NodeExecutor for FailingExecutor {
    async fn execute(&self, _config: &ResolvedConfig, _ctx: &NodeContext) -> anyhow::Result<ExecutionResult> {
        Err(anyhow::anyhow!("connection refused"))
    }
}

/// Sleeps past any sensible test timeout.
#[derive(Debug)]
pub struct SlowExecutor(pub Duration);

#[async_trait]
impl NodeExecutor for SlowExecutor {
    async fn execute(&self, _config: &ResolvedConfig, _ctx: &NodeContext) -> anyhow::Result<ExecutionResult> {
        tokio::time::sleep(self.0).await;
        Ok(ExecutionResult::success(None))
    }
}

/// Rejects every dispatch at runtime validation.
#[derive(Debug, Default)]
pub struct RejectingExecutor {
    pub executed: Mutex<usize>,
}

#[async_trait]
impl NodeExecutor for RejectingExecutor {
    async fn execute(&self, _config: &ResolvedConfig, _ctx: &NodeContext) -> anyhow::Result<ExecutionResult> {
        *self.executed.lock() += 1;
        Ok(ExecutionResult::success(None))
    }

    async fn validate_runtime(&self, config: &ResolvedConfig, _ctx: &NodeContext) -> Vec<ValidationError> {
        vec![ValidationError::new("inputs.amount", format!("missing for {}", config.node_key))]
    }
}

/// Object map from a `json!` object literal.
pub fn output(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
