/// Workflow Definition Layer
///
/// This module handles workflow definitions and their compilation:
/// - Type definitions (Workflow, Node, NodeConfig)
/// - minijinja input templates and context-key references
/// - petgraph-based compilation into the consumer map the run store counts down

// Core workflow type definitions
pub mod types;

pub mod template;

// Compilation and structural validation
pub mod graph;

// Re-export commonly used types
pub use graph::CompiledWorkflow;
pub use template::{InputTemplate, TemplateRef};
pub use types::{Node, NodeConfig, Workflow};
