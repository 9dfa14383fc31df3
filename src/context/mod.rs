/// Run Context Layer
///
/// Tiered storage for intermediate node outputs:
/// - RefValue backends (memory / parsed JSON / temp file) and the factory that picks one
/// - Persisted descriptors for run-state round-tripping
/// - The per-run context store with consumer counts, loop-aware cleanup and staged writes
/// - A run-keyed pool that owns stores and reclaims idle runs

pub mod payload;

pub mod ref_value;

pub mod descriptor;

// Backend selection heuristics
pub mod factory;

pub mod store;

pub mod pool;

pub use descriptor::ValueDescriptor;
pub use factory::RefValueFactory;
pub use payload::{BackendKind, Payload, StoragePreference, WriteOptions};
pub use pool::ContextPool;
pub use ref_value::{ByteStream, FileContent, RefValue};
pub use store::{Consumption, FlushReport, RunContextStore, StoreStats};
