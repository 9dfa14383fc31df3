/// Hot-reload executor registry using ArcSwap
///
/// Maps a node type identifier to its executor. Registration swaps the whole map
/// pointer, so lookups during concurrent runs stay lock-free and never observe a
/// half-updated registry.

use crate::runtime::executor::NodeExecutor;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Executor registry shared by the compiler and the engine
///
/// Cloned `Arc<dyn NodeExecutor>` handles are returned from `get`, so a run keeps
/// using the executor it looked up even if the type is re-registered mid-run.
#[derive(Debug)]
pub struct ExecutorRegistry {
    /// Key: node type, Value: executor shared by every run
    executors: ArcSwap<HashMap<String, Arc<dyn NodeExecutor>>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    /// Create an empty registry
    ///
    /// Node types are added with `register`; compiling a workflow that names an
    /// unregistered type fails.
    pub fn new() -> Self {
        Self {
            executors: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Register or replace the executor for a node type
    pub fn register(&self, node_type: &str, executor: Arc<dyn NodeExecutor>) {
        self.executors.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(node_type.to_string(), Arc::clone(&executor));
            next
        });
        tracing::info!("🔌 Registered executor for node type '{}'", node_type);
    }

    pub fn unregister(&self, node_type: &str) -> bool {
        let mut removed = false;
        self.executors.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(node_type).is_some();
            next
        });
        if removed {
            tracing::info!("🔌 Removed executor for node type '{}'", node_type);
        }
        removed
    }

    /// Lock-free lookup
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.load().get(node_type).cloned()
    }

    pub fn node_types(&self) -> Vec<String> {
        self.executors.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.load().is_empty()
    }
}
