/// Workflow compilation
///
/// Turns a `Workflow` definition into the execution-ready form the engine walks:
/// a petgraph of `next` edges for structural checks, the parsed input templates of each
/// node and the consumer map (context key → nodes that read it) that drives
/// reference-counted cleanup in the run context store.

use crate::error::EngineError;
use crate::runtime::registry::ExecutorRegistry;
use crate::workflow::template::InputTemplate;
use crate::workflow::types::{Node, Workflow};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Execution-ready workflow
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    /// Base workflow definition
    pub workflow: Workflow,
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    /// node key → (input name, compiled template), in authored order
    inputs: HashMap<String, Vec<(String, InputTemplate)>>,
    /// context key → distinct consuming node keys
    consumers: BTreeMap<String, BTreeSet<String>>,
    /// node key → distinct context keys it reads
    references: HashMap<String, Vec<String>>,
}

impl CompiledWorkflow {
    /// Compile and validate a workflow against the registered executors
    ///
    /// Every structural problem and every executor `validate_definition` failure is
    /// collected and reported together in one `InvalidWorkflow`.
    pub fn compile(workflow: Workflow, registry: &ExecutorRegistry) -> Result<Self, EngineError> {
        tracing::debug!("🏗️ Compiling workflow '{}' with {} nodes", workflow.id, workflow.nodes.len());
        let mut errors = Vec::new();

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in &workflow.nodes {
            if index.contains_key(&node.key) {
                errors.push(format!("duplicate node key '{}'", node.key));
                continue;
            }
            index.insert(node.key.clone(), graph.add_node(node.key.clone()));
        }

        for node in &workflow.nodes {
            for successor in &node.next {
                match (index.get(&node.key), index.get(successor)) {
                    (Some(&from), Some(&to)) => {
                        graph.update_edge(from, to, ());
                    }
                    _ => errors.push(format!("node '{}' points at unknown successor '{}'", node.key, successor)),
                }
            }
        }

        if !index.contains_key(&workflow.start) {
            errors.push(format!("start node '{}' does not exist", workflow.start));
        }

        let mut inputs = HashMap::new();
        let mut consumers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut references = HashMap::new();
        for node in &workflow.nodes {
            let compiled: Vec<(String, InputTemplate)> = node
                .config
                .inputs
                .iter()
                .map(|(name, value)| (name.clone(), InputTemplate::parse(value)))
                .collect();

            let mut read_keys: Vec<String> = Vec::new();
            for (_, template) in &compiled {
                for reference in template.references() {
                    if !read_keys.contains(&reference.context_key) {
                        read_keys.push(reference.context_key.clone());
                    }
                    consumers
                        .entry(reference.context_key.clone())
                        .or_default()
                        .insert(node.key.clone());
                }
            }

            errors.extend(Self::validate_node(node, registry));
            references.insert(node.key.clone(), read_keys);
            inputs.insert(node.key.clone(), compiled);
        }

        if !errors.is_empty() {
            tracing::warn!("❌ Workflow '{}' failed compilation with {} errors", workflow.id, errors.len());
            return Err(EngineError::InvalidWorkflow(errors));
        }

        let compiled = Self {
            workflow,
            graph,
            index,
            inputs,
            consumers,
            references,
        };
        compiled.warn_unreachable();
        Ok(compiled)
    }

    fn validate_node(node: &Node, registry: &ExecutorRegistry) -> Vec<String> {
        match registry.get(&node.node_type) {
            Some(executor) => executor
                .validate_definition(&node.config)
                .into_iter()
                .map(|error| format!("node '{}': {}", node.key, error))
                .collect(),
            None => vec![format!(
                "node '{}': no executor registered for type '{}'",
                node.key, node.node_type
            )],
        }
    }

    /// Nodes only reachable through explicit next-node keys are legal, so this only logs
    fn warn_unreachable(&self) {
        let reachable = self.reachable_from(&self.workflow.start);
        for node in &self.workflow.nodes {
            if !reachable.contains(&node.key) {
                tracing::debug!("🔍 Node '{}' is not reachable through declared successors", node.key);
            }
        }
    }

    /// Node keys reachable from `start` along declared `next` edges
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let Some(&start) = self.index.get(start) else {
            return HashSet::new();
        };
        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(idx) = bfs.next(&self.graph) {
            reachable.insert(self.graph[idx].clone());
        }
        reachable
    }

    pub fn id(&self) -> &str {
        &self.workflow.id
    }

    pub fn start(&self) -> &str {
        &self.workflow.start
    }

    pub fn node(&self, key: &str) -> Option<&Node> {
        self.workflow.nodes.iter().find(|node| node.key == key)
    }

    pub fn inputs(&self, node_key: &str) -> &[(String, InputTemplate)] {
        self.inputs.get(node_key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Context keys a node reads through its input templates
    pub fn referenced_keys(&self, node_key: &str) -> &[String] {
        self.references.get(node_key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Context key → nodes that read it
    pub fn consumers(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.consumers
    }

    pub fn consumer_count(&self, context_key: &str) -> usize {
        self.consumers.get(context_key).map(BTreeSet::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::{ExecutionResult, NodeExecutor, ResolvedConfig, ValidationError};
    use crate::runtime::node_context::NodeContext;
    use crate::workflow::types::NodeConfig;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl NodeExecutor for Noop {
        async fn execute(&self, _config: &ResolvedConfig, _ctx: &NodeContext) -> anyhow::Result<ExecutionResult> {
            Ok(ExecutionResult::success(None))
        }

        fn validate_definition(&self, config: &NodeConfig) -> Vec<ValidationError> {
            if config.params.get("forbidden").is_some() {
                vec![ValidationError::new("params.forbidden", "not allowed")]
            } else {
                Vec::new()
            }
        }
    }

    fn registry() -> ExecutorRegistry {
        let registry = ExecutorRegistry::new();
        registry.register("noop", Arc::new(Noop));
        registry
    }

    #[test]
    fn builds_consumer_map_from_templates() {
        let workflow = Workflow::new("wf", "a")
            .node(Node::new("a", "noop").then("b"))
            .node(
                Node::new("b", "noop")
                    .then("c")
                    .input("name", "{{ a.output.name }}")
                    .input("greeting", "Hi {{ a.output.name }} / {{ a.output.id }}"),
            )
            .node(Node::new("c", "noop").input("all", "{{ a.output }}"));

        let compiled = CompiledWorkflow::compile(workflow, &registry()).unwrap();
        assert_eq!(compiled.consumer_count("a.output"), 2);
        assert_eq!(compiled.referenced_keys("b"), &["a.output".to_string()]);
        assert!(compiled.referenced_keys("a").is_empty());
        assert_eq!(compiled.reachable_from("a").len(), 3);
    }

    #[test]
    fn collects_every_problem() {
        let workflow = Workflow::new("wf", "missing")
            .node(Node::new("a", "noop").then("ghost"))
            .node(Node::new("a", "noop"))
            .node(Node::new("b", "unknown-type"))
            .node(Node::new("c", "noop").params(serde_json::json!({"forbidden": true})));

        let Err(EngineError::InvalidWorkflow(errors)) = CompiledWorkflow::compile(workflow, &registry()) else {
            panic!("expected an invalid workflow");
        };
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("ghost")));
        assert!(errors.iter().any(|e| e.contains("duplicate")));
        assert!(errors.iter().any(|e| e.contains("start node")));
        assert!(errors.iter().any(|e| e.contains("unknown-type")));
        assert!(errors.iter().any(|e| e.contains("params.forbidden")));
    }
}
