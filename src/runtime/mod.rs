/// Runtime Execution Engine
///
/// This module provides the execution state machine for workflow runs.
/// It handles:
/// - The executor contract and its hot-swappable registry
/// - Per-node policy resolution (timeout, retry, rate limit)
/// - The navigator's status → transition table
/// - The sequential driver loop over the run context store

// Node executor contract consumed by the engine
pub mod executor;

pub mod registry;

pub mod policy;

// Execution context exposed to executors
pub mod node_context;

pub mod navigator;

// Driver loop
pub mod engine;

// Re-export main types
pub use engine::{ExecutionEngine, RunOutcome, RunRequest, RunStatus};
pub use executor::{ExecutionResult, NodeExecutor, NodeStatus, ResolvedConfig, ValidationError};
pub use navigator::{HaltReason, Transition};
pub use node_context::{NodeContext, ReadOptions, ResourceSet};
pub use policy::{NodePolicy, PlatformPolicy, PolicyConfig};
pub use registry::ExecutorRegistry;
