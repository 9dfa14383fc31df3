/// Resolution Cache
///
/// Cost- and demand-aware caching of template resolutions, sized from live consumer
/// counts in each run's context store.

pub mod memory;

pub mod resolution;

pub use memory::{FixedMemoryMonitor, MemoryMonitor, SystemMemoryMonitor};
pub use resolution::{normalize_key, CacheKey, CacheStats, ResolutionCache};
