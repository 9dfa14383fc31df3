/// Core workflow type definitions
///
/// A workflow is a set of keyed nodes; each node names its executor type, its declared
/// successors and a config whose inputs may hold minijinja templates over context keys
/// (`{{ fetch.output.user }}`). These types are deserialized from JSON definitions.

use crate::runtime::policy::PolicyConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-grading")
    pub id: String,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Key of the node the driver loop starts on
    pub start: String,
    pub nodes: Vec<Node>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, start: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            start: start.into(),
            nodes: Vec::new(),
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }
}

/// A single node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node key within the workflow; outputs land under `<key>.output`
    pub key: String,
    /// Executor type identifier, looked up in the executor registry
    #[serde(rename = "type")]
    pub node_type: String,
    /// Declared successors; SUCCESS advances to the first one
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub config: NodeConfig,
}

impl Node {
    pub fn new(key: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            node_type: node_type.into(),
            next: Vec::new(),
            config: NodeConfig::default(),
        }
    }

    pub fn then(mut self, successor: impl Into<String>) -> Self {
        self.next.push(successor.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.inputs.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.config.params = params;
        self
    }

    pub fn policy(mut self, policy: PolicyConfig) -> Self {
        self.config.policy = Some(policy);
        self
    }
}

/// Authored node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Input name → literal value or template string
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Executor-specific parameters, passed through untouched
    #[serde(default)]
    pub params: Value,
    /// Timeout / retry / rate-limit overrides
    #[serde(default)]
    pub policy: Option<PolicyConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_authored_definition() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf-greet",
            "start": "fetch",
            "nodes": [
                {"key": "fetch", "type": "http", "next": ["greet"]},
                {
                    "key": "greet",
                    "type": "transform",
                    "config": {
                        "inputs": {"name": "{{ fetch.output.name | upper }}"},
                        "policy": {"timeout": "5s"}
                    }
                }
            ]
        }))
        .unwrap();

        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(workflow.nodes[0].next, vec!["greet".to_string()]);
        assert_eq!(workflow.nodes[1].node_type, "transform");
        assert!(workflow.nodes[1].config.policy.is_some());
        assert!(workflow.nodes[0].config.inputs.is_empty());
    }
}
