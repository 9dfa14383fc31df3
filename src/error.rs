/// Error types for the run context store and execution engine
///
/// Resource-layer faults (`ContextError`) are mostly absorbed close to where they happen:
/// the factory falls back to memory, release failures are logged. The ones that do reach
/// callers are explicit conditions (released value, missing file, bad selector).
/// `EngineError` is what aborts a run.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by RefValues and the run context store
#[derive(Debug, Error)]
pub enum ContextError {
    /// Backing file does not exist (adopting a path, restoring a descriptor)
    #[error("context file not found: {path}")]
    NotFound { path: PathBuf },

    /// Read attempted after the value was released
    #[error("{backend} value has already been released")]
    Released { backend: &'static str },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Pointer / JSONPath selector could not be evaluated
    #[error("invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    /// Restored file no longer matches the persisted checksum
    #[error("checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("unknown context key: {key}")]
    UnknownKey { key: String },
}

/// Fatal run failures surfaced by the execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("no executor registered for node type '{node_type}'")]
    ExecutorNotFound { node_type: String },

    /// Workflow failed compilation or definition validation
    #[error("invalid workflow: {}", .0.join("; "))]
    InvalidWorkflow(Vec<String>),

    /// Executor raised an error or returned ERROR status
    #[error("node '{node_key}' failed: {message}")]
    NodeFailed { node_key: String, message: String },

    #[error("node '{node_key}' timed out after {timeout:?}")]
    Timeout { node_key: String, timeout: Duration },

    #[error("failed to resolve input '{input}' of node '{node_key}': {message}")]
    Template {
        node_key: String,
        input: String,
        message: String,
    },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: usize },
}

pub type ContextResult<T> = std::result::Result<T, ContextError>;
