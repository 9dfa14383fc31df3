/// Execution context handed to node executors
///
/// Wraps the run's context store for one node dispatch. Writes are staged and become
/// visible under `<node key>.<key>` once the engine flushes them after the node returns;
/// reads see the resolved inputs and the live store. Scoped resources (pooled
/// connections and the like) are looked up by type and owned by the embedding
/// application.

use crate::context::{Payload, RunContextStore, WriteOptions};
use crate::error::{ContextError, ContextResult};
use crate::runtime::policy::NodePolicy;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Where `read` looks first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadOptions {
    /// Resolved node inputs first, then the context store
    #[default]
    Default,
    /// Context store first, then resolved node inputs
    PreferContext,
}

/// Type-keyed set of shared resources
#[derive(Default)]
pub struct ResourceSet {
    resources: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSet")
            .field("resources", &self.resources.len())
            .finish()
    }
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, resource: Arc<T>) {
        self.resources.insert(TypeId::of::<T>(), resource);
    }

    pub fn with<T: Any + Send + Sync>(mut self, resource: T) -> Self {
        self.insert(Arc::new(resource));
        self
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources
            .get(&TypeId::of::<T>())
            .and_then(|resource| Arc::clone(resource).downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// What an executor sees of the run while one node executes
///
/// Reads go through the node's resolved inputs and the run context store; writes are
/// staged and only become visible once the engine flushes them after the node returns.
#[derive(Debug, Clone)]
pub struct NodeContext {
    run_id: String,
    node_key: String,
    store: Arc<RunContextStore>,
    inputs: Arc<Map<String, Value>>,
    resources: Arc<ResourceSet>,
    policy: NodePolicy,
}

impl NodeContext {
    /// Build the context for one dispatch of `node_key`
    ///
    /// `inputs` are the node's already-resolved templates and `policy` the layered
    /// timeout / retry / rate-limit values for this node.
    pub fn new(
        node_key: impl Into<String>,
        store: Arc<RunContextStore>,
        inputs: Map<String, Value>,
        resources: Arc<ResourceSet>,
        policy: NodePolicy,
    ) -> Self {
        Self {
            run_id: store.run_id().to_string(),
            node_key: node_key.into(),
            store,
            inputs: Arc::new(inputs),
            resources,
            policy,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    /// Resolved timeout / retry / rate-limit settings for this dispatch
    pub fn policy(&self) -> &NodePolicy {
        &self.policy
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn store(&self) -> &Arc<RunContextStore> {
        &self.store
    }

    /// Read a value without consuming it
    pub async fn read(&self, key: &str, options: ReadOptions) -> ContextResult<Option<Payload>> {
        let input = || self.inputs.get(key).cloned().map(Payload::Json);
        match options {
            ReadOptions::Default => match input() {
                Some(value) => Ok(Some(value)),
                None => self.store.get(key).await,
            },
            ReadOptions::PreferContext => match self.store.get(key).await? {
                Some(value) => Ok(Some(value)),
                None => Ok(input()),
            },
        }
    }

    /// Typed read; byte payloads deserialize from their JSON encoding
    pub async fn read_as<T: DeserializeOwned>(&self, key: &str, options: ReadOptions) -> ContextResult<Option<T>> {
        match self.read(key, options).await? {
            Some(Payload::Json(value)) => Ok(Some(serde_json::from_value(value)?)),
            Some(Payload::Bytes(bytes)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like `read`, but a missing key is an error
    pub async fn require(&self, key: &str, options: ReadOptions) -> ContextResult<Payload> {
        self.read(key, options).await?.ok_or_else(|| ContextError::UnknownKey {
            key: key.to_string(),
        })
    }

    /// Stage a write under `<node key>.<key>`
    pub fn write(&self, key: &str, payload: impl Into<Payload>, options: WriteOptions) {
        self.store.write(key, payload, options);
    }

    /// Stage a stream write; the value is materialized from the stream immediately
    pub async fn write_stream<R>(&self, key: &str, reader: &mut R, options: WriteOptions) -> ContextResult<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.store.write_stream(key, reader, options).await
    }

    /// Remove an absolute context key and release its value now
    pub fn remove(&self, key: &str) -> bool {
        self.store.remove(key)
    }

    pub fn get_resource<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources.get::<T>()
    }
}
