//! Cache Module
//!
//! The cache engine contract and its in-memory TTL backend.

pub(crate) mod contract;
mod entry;
pub(crate) mod flight;
mod memory;
pub(crate) mod notify;
pub(crate) mod stats;


// Re-export public types
pub use contract::{
    lazy, Cache, CacheKey, CacheValue, DeletePredicate, OnExpired, RangeVisitor, Ttl, ValueInit,
};
pub use entry::CacheEntry;
pub use memory::MemoryStore;
pub use stats::CacheStats;
