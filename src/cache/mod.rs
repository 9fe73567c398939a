//! Memory and disk cache tiers.

pub mod disk;
pub mod memory;

pub use disk::{DiskCache, Editor, Snapshot};
pub use memory::{CacheStats, MemoryCache};
