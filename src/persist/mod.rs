//! Persistent Backend Module
//!
//! Hash-indexed persistent storage of cache rows, with fast (digest pair) and
//! safe (raw key) primary-key encodings.

mod driver;
mod record;
mod store;

pub use driver::{MemoryTable, PersistResult, PersistenceDriver, Upsert};
pub use record::{KeyMode, KeyPattern, Partition, PrimaryKey, StoredRecord};
pub use store::{PersistentKey, PersistentStore, PersistentValue};
