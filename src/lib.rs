/// Mechaway core: run context, resolution cache and execution state machine
///
/// This library is the execution core of the Mechaway workflow engine: a tiered,
/// reference-counted run context store, an adaptive cache for template resolution and
/// the node-by-node driver loop that interprets execution results.

// Core configuration and setup
pub mod config;

pub mod error;

// Run context layer - RefValue backends, per-run store, run pool
pub mod context;

// Cost- and demand-aware template resolution cache
pub mod cache;

// Workflow definitions, templates and compilation
pub mod workflow;

// Runtime execution engine - driver loop, navigator, executor contract
pub mod runtime;

// Re-export commonly used types for external consumers
pub use config::Config;
pub use context::{ContextPool, Payload, RefValue, RunContextStore, WriteOptions};
pub use error::{ContextError, EngineError};
pub use runtime::{ExecutionEngine, ExecutionResult, NodeExecutor, NodeStatus, RunOutcome, RunRequest};
pub use workflow::{CompiledWorkflow, Node, Workflow};
