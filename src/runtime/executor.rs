/// Node executor contract
///
/// Concrete node types (SQL, HTTP, transforms...) live outside this crate. The engine only
/// sees this trait: it hands an executor the node's resolved config plus a `NodeContext`
/// and interprets the returned `ExecutionResult` through the navigator.

use crate::runtime::node_context::NodeContext;
use crate::runtime::policy::NodePolicy;
use crate::workflow::types::NodeConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome status reported by an executor; drives the navigator's transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Success,
    Error,
    Retry,
    Waiting,
    Next,
    ValidationError,
    LoopNext,
    LoopEnd,
    LoopContinue,
    LoopBreak,
}

/// Field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result of executing a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: NodeStatus,
    /// Stored under `<node key>.output` when present
    pub output: Option<Map<String, Value>>,
    pub error: Option<String>,
    /// Explicit successor for NEXT and the loop statuses
    pub next_node_key: Option<String>,
    #[serde(default)]
    pub validation: Vec<ValidationError>,
}

impl ExecutionResult {
    pub fn new(status: NodeStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
            next_node_key: None,
            validation: Vec::new(),
        }
    }

    pub fn success(output: Option<Map<String, Value>>) -> Self {
        Self {
            output,
            ..Self::new(NodeStatus::Success)
        }
    }

    /// NEXT (or a loop status) pointing at an explicit successor
    pub fn goto(status: NodeStatus, next_node_key: Option<String>) -> Self {
        Self {
            next_node_key,
            ..Self::new(status)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(NodeStatus::Error)
        }
    }

    pub fn validation_error(errors: Vec<ValidationError>) -> Self {
        Self {
            validation: errors,
            ..Self::new(NodeStatus::ValidationError)
        }
    }

    pub fn with_output(mut self, output: Map<String, Value>) -> Self {
        self.output = Some(output);
        self
    }
}

/// Node config after template resolution and policy layering
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub node_key: String,
    pub node_type: String,
    pub inputs: Map<String, Value>,
    pub params: Value,
    pub policy: NodePolicy,
}

/// Capability implemented once per node type
#[async_trait]
pub trait NodeExecutor: Send + Sync + std::fmt::Debug {
    /// Run the node. An `Err` is fatal to the run; controlled failures should be
    /// reported through `ExecutionResult` statuses instead.
    async fn execute(&self, config: &ResolvedConfig, ctx: &NodeContext) -> Result<ExecutionResult>;

    /// Static checks at workflow compile time
    fn validate_definition(&self, _config: &NodeConfig) -> Vec<ValidationError> {
        Vec::new()
    }

    /// Checks against resolved inputs right before dispatch
    async fn validate_runtime(&self, _config: &ResolvedConfig, _ctx: &NodeContext) -> Vec<ValidationError> {
        Vec::new()
    }
}
