//! Expiry Cache - A generic expiring key-value cache
//!
//! One contract ([`Cache`]) with an in-memory TTL backend and a hash-indexed
//! persistent backend offering fast (digest) and safe (raw key) encodings.

pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod hasher;
pub mod persist;
pub mod tasks;

pub use cache::{lazy, Cache, CacheStats, MemoryStore, Ttl};
pub use config::{Config, Driver};
pub use error::{CacheError, Result};
pub use factory::CacheFactory;
pub use hasher::{Hasher, XxHasher};
pub use persist::{KeyMode, MemoryTable, PersistenceDriver, PersistentStore};
