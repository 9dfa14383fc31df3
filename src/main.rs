/// Mechaway core demo
///
/// Runs a small looping workflow end to end against the execution engine and prints the
/// run outcome. Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::Result;
use async_trait::async_trait;
use mechaway_core::config::Config;
use mechaway_core::context::ContextPool;
use mechaway_core::runtime::{
    ExecutionEngine, ExecutionResult, ExecutorRegistry, NodeContext, NodeExecutor, NodeStatus, ReadOptions,
    ResolvedConfig, RunRequest,
};
use mechaway_core::workflow::{Node, Workflow};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Echoes its resolved inputs as output
#[derive(Debug)]
struct EchoExecutor;

#[async_trait]
impl NodeExecutor for EchoExecutor {
    async fn execute(&self, config: &ResolvedConfig, _ctx: &NodeContext) -> Result<ExecutionResult> {
        Ok(ExecutionResult::success(Some(config.inputs.clone())))
    }
}

/// Counts up to `params.times`, looping on itself, then hands over to `params.then`
#[derive(Debug)]
struct CounterExecutor;

#[async_trait]
impl NodeExecutor for CounterExecutor {
    async fn execute(&self, config: &ResolvedConfig, ctx: &NodeContext) -> Result<ExecutionResult> {
        let times = config.params.get("times").and_then(Value::as_u64).unwrap_or(1);
        let seen: Option<Value> = ctx
            .read_as(&format!("{}.output", ctx.node_key()), ReadOptions::PreferContext)
            .await?;
        let count = seen
            .as_ref()
            .and_then(|out| out.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;

        let mut output = Map::new();
        output.insert("count".into(), json!(count));
        output.insert("greeting".into(), config.inputs.get("greeting").cloned().unwrap_or(Value::Null));

        let result = if count < times {
            ExecutionResult::goto(NodeStatus::LoopNext, Some(ctx.node_key().to_string()))
        } else {
            let then = config.params.get("then").and_then(Value::as_str).map(str::to_string);
            ExecutionResult::goto(NodeStatus::LoopEnd, then)
        };
        Ok(result.with_output(output))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let registry = Arc::new(ExecutorRegistry::new());
    registry.register("echo", Arc::new(EchoExecutor));
    registry.register("counter", Arc::new(CounterExecutor));

    let engine = ExecutionEngine::new(&Config::default(), registry);
    let sweeper = ContextPool::spawn_sweeper(Arc::clone(engine.pool()));
    let workflow = engine.compile(
        Workflow::new("wf-demo", "greet")
            .node(
                Node::new("greet", "echo")
                    .then("count")
                    .input("greeting", "Hello {{ trigger.output.name | title }}"),
            )
            .node(
                Node::new("count", "counter")
                    .params(json!({"times": 3, "then": "report"}))
                    .input("greeting", "{{ greet.output.greeting }}")
                    .input("previous", "{{ count.output.count }}"),
            )
            .node(Node::new("report", "echo").input("total", "{{ count.output.count }}")),
    )?;

    let outcome = engine
        .start(&workflow, RunRequest::new().trigger(json!({"name": "ada"})))
        .await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    sweeper.abort();
    Ok(())
}
