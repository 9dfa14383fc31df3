/// Execution engine: the per-run driver loop
///
/// Walks a compiled workflow one node at a time. Each step:
/// 1. resolves the node's inputs against the run context store (cache-aware, non-consuming)
/// 2. runs `validate_runtime`, then dispatches to the executor under the resolved timeout
/// 3. stages `output` under `<node key>.output` and flushes the node's pending writes
/// 4. lets the navigator pick the transition (opening/closing loop scopes)
/// 5. retires this node as a consumer of every key it read
///
/// Runs execute sequentially inside, concurrently across runs. Stores come from a shared
/// `ContextPool`; the `ResolutionCache` is process-wide and partitioned by run id.

use crate::cache::{CacheKey, ResolutionCache};
use crate::config::{Config, EngineConfig};
use crate::context::{Consumption, ContextPool, RefValueFactory, RunContextStore, WriteOptions};
use crate::error::EngineError;
use crate::runtime::executor::{ExecutionResult, NodeStatus, ResolvedConfig};
use crate::runtime::navigator::{self, HaltReason, Transition};
use crate::runtime::node_context::{NodeContext, ResourceSet};
use crate::runtime::policy::{PlatformPolicy, PolicyConfig};
use crate::runtime::registry::ExecutorRegistry;
use crate::workflow::graph::CompiledWorkflow;
use crate::workflow::template::{payload_to_json, render, scope_insert, InputTemplate};
use crate::workflow::types::{Node, Workflow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Context key trigger data is seeded under
pub const TRIGGER_KEY: &str = "trigger.output";

/// Parameters for starting a run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Generated (UUID v4) when absent
    pub run_id: Option<String>,
    /// Seeded under `trigger.output` before the first node runs
    pub trigger: Option<Value>,
    /// Per-run policy overrides, by node key
    pub policy_overrides: HashMap<String, PolicyConfig>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn trigger(mut self, data: Value) -> Self {
        self.trigger = Some(data);
        self
    }

    pub fn override_policy(mut self, node_key: impl Into<String>, policy: PolicyConfig) -> Self {
        self.policy_overrides.insert(node_key.into(), policy);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    Halted,
}

/// Final state of one engine invocation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub halt: Option<HaltReason>,
    pub last_node: Option<String>,
    pub last_output: Option<Map<String, Value>>,
    /// Node dispatches made by this invocation
    pub steps: usize,
    /// Context keys released by the final step: exhausted consumers and closed loop ledgers
    pub collected: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

struct Step {
    transition: Transition,
    output: Option<Map<String, Value>>,
    collected: Vec<String>,
}

/// Drives workflow runs against the executor registry
#[derive(Debug)]
pub struct ExecutionEngine {
    registry: Arc<ExecutorRegistry>,
    pool: Arc<ContextPool>,
    cache: Arc<ResolutionCache>,
    policy: PlatformPolicy,
    config: EngineConfig,
    resources: Arc<ResourceSet>,
    /// Policy overrides of suspended runs, needed again on resume
    suspended: DashMap<String, Arc<HashMap<String, PolicyConfig>>>,
}

impl ExecutionEngine {
    pub fn new(config: &Config, registry: Arc<ExecutorRegistry>) -> Self {
        let factory = RefValueFactory::new(config.context.clone());
        Self {
            registry,
            pool: Arc::new(ContextPool::new(factory, config.pool.clone())),
            cache: Arc::new(ResolutionCache::new(config.cache.clone())),
            policy: config.policy.clone(),
            config: config.engine.clone(),
            resources: Arc::new(ResourceSet::new()),
            suspended: DashMap::new(),
        }
    }

    /// Share a cache between engines (or inject one with a fixed memory monitor)
    pub fn with_cache(mut self, cache: Arc<ResolutionCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_pool(mut self, pool: Arc<ContextPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Resources executors can look up by type through their `NodeContext`
    pub fn with_resources(mut self, resources: ResourceSet) -> Self {
        self.resources = Arc::new(resources);
        self
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    /// Compile a definition against this engine's registry
    pub fn compile(&self, workflow: Workflow) -> Result<CompiledWorkflow, EngineError> {
        CompiledWorkflow::compile(workflow, &self.registry)
    }

    /// Start a new run at the workflow's start node
    pub async fn start(&self, workflow: &CompiledWorkflow, request: RunRequest) -> Result<RunOutcome, EngineError> {
        let run_id = request
            .run_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let store = self.pool.get_or_create(&run_id);

        for (key, consumers) in workflow.consumers() {
            for consumer in consumers {
                store.register_consumer(key, consumer);
            }
        }
        if let Some(trigger) = request.trigger {
            store.put(TRIGGER_KEY, trigger).await;
        }

        tracing::info!("🚀 Starting run {} of workflow '{}' at node '{}'", run_id, workflow.id(), workflow.start());
        let overrides = Arc::new(request.policy_overrides);
        self.drive(workflow, store, workflow.start().to_string(), overrides).await
    }

    /// Re-enter a suspended (RETRY / WAITING) run at `node_key`
    ///
    /// Consumers are not registered again; the store still carries the counts left
    /// when the run halted.
    pub async fn resume(&self, workflow: &CompiledWorkflow, run_id: &str, node_key: &str) -> Result<RunOutcome, EngineError> {
        let store = self.pool.get(run_id).ok_or_else(|| EngineError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        let overrides = self
            .suspended
            .get(run_id)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_default();

        tracing::info!("▶️ Resuming run {} at node '{}'", run_id, node_key);
        self.drive(workflow, store, node_key.to_string(), overrides).await
    }

    async fn drive(
        &self,
        workflow: &CompiledWorkflow,
        store: Arc<RunContextStore>,
        start: String,
        overrides: Arc<HashMap<String, PolicyConfig>>,
    ) -> Result<RunOutcome, EngineError> {
        let run_id = store.run_id().to_string();
        let started_at = Utc::now();
        let run_started = Instant::now();
        let mut current = start;
        let mut steps = 0usize;

        loop {
            if steps >= self.config.max_steps {
                let limit = self.config.max_steps;
                return Err(self.abort(&store, EngineError::StepLimitExceeded { limit }));
            }
            steps += 1;

            let Some(node) = workflow.node(&current) else {
                return Err(self.abort(&store, EngineError::NodeNotFound(current)));
            };
            tracing::info!("📍 Step {}: Executing node '{}' (type: {})", steps, node.key, node.node_type);

            let step = match self.step(workflow, &store, node, &overrides).await {
                Ok(step) => step,
                Err(e) => return Err(self.abort(&store, e)),
            };
            let last_output = step.output;
            let collected = step.collected;

            let outcome = |status, halt| RunOutcome {
                run_id: run_id.clone(),
                status,
                halt,
                last_node: Some(node.key.clone()),
                last_output: last_output.clone(),
                steps,
                collected: collected.clone(),
                started_at,
                finished_at: Utc::now(),
            };

            match step.transition {
                Transition::Advance(next) => current = next,
                Transition::Stay => {}
                Transition::Complete => {
                    self.teardown(&run_id);
                    tracing::info!("🎉 Run {} completed in {:?} after {} steps", run_id, run_started.elapsed(), steps);
                    return Ok(outcome(RunStatus::Completed, None));
                }
                Transition::Halt(reason) => {
                    if reason.is_suspension() {
                        self.suspended.insert(run_id.clone(), Arc::clone(&overrides));
                        tracing::info!("⏸️ Run {} suspended at node '{}'", run_id, node.key);
                    } else {
                        self.teardown(&run_id);
                        tracing::info!("🛑 Run {} halted at node '{}'", run_id, node.key);
                    }
                    return Ok(outcome(RunStatus::Halted, Some(reason)));
                }
                Transition::Fail(message) => {
                    let error = EngineError::NodeFailed {
                        node_key: node.key.clone(),
                        message,
                    };
                    return Err(self.abort(&store, error));
                }
            }
        }
    }

    async fn step(
        &self,
        workflow: &CompiledWorkflow,
        store: &Arc<RunContextStore>,
        node: &Node,
        overrides: &HashMap<String, PolicyConfig>,
    ) -> Result<Step, EngineError> {
        let executor = self
            .registry
            .get(&node.node_type)
            .ok_or_else(|| EngineError::ExecutorNotFound {
                node_type: node.node_type.clone(),
            })?;
        let policy = self
            .policy
            .resolve(node.config.policy.as_ref(), overrides.get(&node.key));
        let inputs = self.resolve_inputs(workflow, store, node).await?;

        let config = ResolvedConfig {
            node_key: node.key.clone(),
            node_type: node.node_type.clone(),
            inputs: inputs.clone(),
            params: node.config.params.clone(),
            policy: policy.clone(),
        };
        let ctx = NodeContext::new(
            node.key.clone(),
            Arc::clone(store),
            inputs,
            Arc::clone(&self.resources),
            policy.clone(),
        );

        let node_started = Instant::now();
        let violations = executor.validate_runtime(&config, &ctx).await;
        let result = if !violations.is_empty() {
            ExecutionResult::validation_error(violations)
        } else {
            match tokio::time::timeout(policy.timeout, executor.execute(&config, &ctx)).await {
                Err(_) => {
                    return Err(EngineError::Timeout {
                        node_key: node.key.clone(),
                        timeout: policy.timeout,
                    })
                }
                Ok(Err(e)) => {
                    return Err(EngineError::NodeFailed {
                        node_key: node.key.clone(),
                        message: format!("{:#}", e),
                    })
                }
                Ok(Ok(result)) => result,
            }
        };

        let run_id = store.run_id();
        if matches!(result.status, NodeStatus::Error | NodeStatus::ValidationError) {
            store.clear_pending_writes();
        } else {
            match &result.output {
                Some(output) => store.write("output", Value::Object(output.clone()), WriteOptions::default()),
                None => tracing::warn!("⚠️ Node '{}' returned no output, nothing stored", node.key),
            }
            let report = store.flush_pending_writes(&node.key).await;
            for key in &report.committed {
                self.cache.invalidate_key(run_id, key);
            }
        }

        let navigation = navigator::navigate(node, &result, store);
        let mut collected = navigation.collected;

        let leaving = match &navigation.transition {
            Transition::Advance(next) => *next != node.key || !store.active_loops().is_empty(),
            Transition::Complete => true,
            _ => false,
        };
        if leaving {
            for key in workflow.referenced_keys(&node.key) {
                if store.consume(&node.key, key) == Consumption::Collected {
                    collected.push(key.clone());
                }
            }
        }
        for key in &collected {
            self.cache.invalidate_key(run_id, key);
        }

        tracing::info!("✅ Node '{}' finished with {:?} in {:?}", node.key, result.status, node_started.elapsed());
        Ok(Step {
            transition: navigation.transition,
            output: result.output,
            collected,
        })
    }

    /// Resolve every input of `node`; templates over a single context key go through the cache
    ///
    /// Cache entries are shared by every node of the run that resolves the same template,
    /// so the consuming node is not part of the key.
    async fn resolve_inputs(
        &self,
        workflow: &CompiledWorkflow,
        store: &Arc<RunContextStore>,
        node: &Node,
    ) -> Result<Map<String, Value>, EngineError> {
        let mut resolved = Map::new();
        for (name, template) in workflow.inputs(&node.key) {
            let value = match template {
                InputTemplate::Literal(value) => Ok(value.clone()),
                _ => {
                    let references = template.references();
                    let cacheable = references
                        .first()
                        .filter(|primary| references.iter().all(|r| r.context_key == primary.context_key));
                    match (cacheable, template.raw()) {
                        (Some(primary), Some(raw)) => {
                            let key = CacheKey::new(&primary.context_key, &primary.path(), raw);
                            self.cache
                                .resolve(store.run_id(), key, store, evaluate(store, template))
                                .await
                        }
                        _ => evaluate(store, template).await,
                    }
                }
            };
            let value = value.map_err(|message| EngineError::Template {
                node_key: node.key.clone(),
                input: name.clone(),
                message,
            })?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    /// Fatal path: close loops, drop staged writes, tear the run down
    fn abort(&self, store: &RunContextStore, error: EngineError) -> EngineError {
        store.end_all_loops();
        store.clear_pending_writes();
        tracing::error!("❌ Run {} failed: {}", store.run_id(), error);
        self.teardown(store.run_id());
        error
    }

    fn teardown(&self, run_id: &str) {
        self.pool.remove(run_id);
        self.cache.invalidate_workflow(run_id);
        self.suspended.remove(run_id);
    }
}

/// Evaluate one input template against the store without consuming anything
async fn evaluate(store: &RunContextStore, template: &InputTemplate) -> Result<Value, String> {
    match template {
        InputTemplate::Literal(value) => Ok(value.clone()),
        InputTemplate::Reference { reference, .. } => {
            let value = if reference.selector.is_empty() {
                store
                    .get(&reference.context_key)
                    .await
                    .map(|payload| payload.map(payload_to_json))
            } else {
                store.select(&reference.context_key, &reference.selector).await
            };
            value.map(|v| v.unwrap_or(Value::Null)).map_err(|e| e.to_string())
        }
        InputTemplate::Render { raw, references } => {
            let mut scope = Map::new();
            for reference in references {
                let payload = store
                    .get(&reference.context_key)
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(payload) = payload {
                    scope_insert(&mut scope, &reference.context_key, payload_to_json(payload));
                }
            }
            render(raw, &scope).map(Value::String).map_err(|e| e.to_string())
        }
    }
}
