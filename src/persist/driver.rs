//! Persistence Collaborator Boundary
//!
//! The row operations the persistent store needs from its storage layer, plus
//! an in-process table that implements them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::cache::contract::extended;
use crate::error::PersistenceError;
use crate::persist::record::{KeyPattern, Partition, PrimaryKey, StoredRecord};

/// Result of a driver operation.
pub type PersistResult<T> = std::result::Result<T, PersistenceError>;

/// Outcome of [`PersistenceDriver::insert_if_vacant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert {
    /// The row that occupied the slot before the call, if any
    pub previous: Option<StoredRecord>,
    /// Whether the new record was written
    pub inserted: bool,
}

/// Storage collaborator of the persistent store.
///
/// Every method must be atomic with respect to the others on the same primary
/// key. Methods that take a `cache_key` only act on a row owning that raw key.
#[async_trait]
pub trait PersistenceDriver: Send + Sync {
    /// Writes `record` when the slot is vacant at `now`: absent, expired, or
    /// owned by a different raw key. Otherwise returns the live row untouched.
    async fn insert_if_vacant(
        &self,
        key: &PrimaryKey,
        record: StoredRecord,
        now: DateTime<Utc>,
    ) -> PersistResult<Upsert>;

    /// Unconditionally writes `record`, returning the replaced row.
    async fn put(&self, key: &PrimaryKey, record: StoredRecord)
        -> PersistResult<Option<StoredRecord>>;

    async fn get(&self, key: &PrimaryKey) -> PersistResult<Option<StoredRecord>>;

    /// Sets the heartbeat to `now` and extends expiry towards `extend_to`
    /// without ever shortening it. Only live rows owned by `cache_key` are touched.
    async fn refresh(
        &self,
        key: &PrimaryKey,
        cache_key: &str,
        now: DateTime<Utc>,
        extend_to: Option<DateTime<Utc>>,
    ) -> PersistResult<Option<StoredRecord>>;

    /// Deletes the row owned by `cache_key`. With `expected`, deletes only if
    /// the stored payload still equals it.
    async fn remove(
        &self,
        key: &PrimaryKey,
        cache_key: &str,
        expected: Option<&[u8]>,
    ) -> PersistResult<Option<StoredRecord>>;

    /// Deletes the row owned by `cache_key` only if it is expired at `now`, so
    /// a concurrent rewrite survives whatever its payload.
    async fn remove_expired(
        &self,
        key: &PrimaryKey,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> PersistResult<Option<StoredRecord>>;

    /// Deletes each `(key, cache_key)` pair; returns the removed rows.
    async fn remove_batch(&self, keys: &[(PrimaryKey, String)]) -> PersistResult<Vec<StoredRecord>>;

    /// Deletes every row of the partition; returns the removed rows.
    async fn clear_partition(&self, partition: Partition) -> PersistResult<Vec<StoredRecord>>;

    /// Every row of the partition.
    async fn scan_partition(&self, partition: Partition) -> PersistResult<Vec<StoredRecord>>;

    /// Rows of the partition whose expiry is at or before `before`, via the expiry index.
    async fn scan_expired(
        &self,
        partition: Partition,
        before: DateTime<Utc>,
    ) -> PersistResult<Vec<StoredRecord>>;

    /// Rows of the partition whose raw key matches `pattern`.
    async fn scan_pattern(
        &self,
        partition: Partition,
        pattern: &KeyPattern,
    ) -> PersistResult<Vec<StoredRecord>>;
}

// == Memory Table ==
/// In-process driver: an ordered primary index plus an expiry index.
///
/// Suitable for tests and single-process deployments; contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryTable {
    state: Mutex<TableState>,
    offline: AtomicBool,
}

#[derive(Debug, Default)]
struct TableState {
    rows: BTreeMap<PrimaryKey, StoredRecord>,
    by_expiry: BTreeSet<(DateTime<Utc>, PrimaryKey)>,
}

impl TableState {
    fn insert(&mut self, key: PrimaryKey, record: StoredRecord) -> Option<StoredRecord> {
        let previous = self.remove(&key);
        if let Some(at) = record.expires_at {
            self.by_expiry.insert((at, key.clone()));
        }
        self.rows.insert(key, record);
        previous
    }

    fn remove(&mut self, key: &PrimaryKey) -> Option<StoredRecord> {
        let record = self.rows.remove(key)?;
        if let Some(at) = record.expires_at {
            self.by_expiry.remove(&(at, key.clone()));
        }
        Some(record)
    }

    fn owned(&self, key: &PrimaryKey, cache_key: &str) -> Option<&StoredRecord> {
        self.rows
            .get(key)
            .filter(|record| record.cache_key == cache_key)
    }

    fn partition(&self, partition: Partition) -> impl Iterator<Item = (&PrimaryKey, &StoredRecord)> {
        self.rows.iter().filter(move |(key, _)| partition.contains(key))
    }
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unreachable storage layer: every call fails while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total number of rows across all partitions.
    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> PersistResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(
                "memory table is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceDriver for MemoryTable {
    async fn insert_if_vacant(
        &self,
        key: &PrimaryKey,
        record: StoredRecord,
        now: DateTime<Utc>,
    ) -> PersistResult<Upsert> {
        self.check()?;
        let mut state = self.state.lock();
        if let Some(existing) = state.rows.get(key) {
            if existing.is_live_for(&record.cache_key, now) {
                return Ok(Upsert {
                    previous: Some(existing.clone()),
                    inserted: false,
                });
            }
        }
        let previous = state.insert(key.clone(), record);
        Ok(Upsert {
            previous,
            inserted: true,
        })
    }

    async fn put(
        &self,
        key: &PrimaryKey,
        record: StoredRecord,
    ) -> PersistResult<Option<StoredRecord>> {
        self.check()?;
        Ok(self.state.lock().insert(key.clone(), record))
    }

    async fn get(&self, key: &PrimaryKey) -> PersistResult<Option<StoredRecord>> {
        self.check()?;
        Ok(self.state.lock().rows.get(key).cloned())
    }

    async fn refresh(
        &self,
        key: &PrimaryKey,
        cache_key: &str,
        now: DateTime<Utc>,
        extend_to: Option<DateTime<Utc>>,
    ) -> PersistResult<Option<StoredRecord>> {
        self.check()?;
        let mut state = self.state.lock();
        let mut record = match state.owned(key, cache_key) {
            Some(record) if !record.is_expired_at(now) => record.clone(),
            _ => return Ok(None),
        };
        record.updated_at = now;
        record.expires_at = extended(record.expires_at, extend_to);
        state.insert(key.clone(), record.clone());
        Ok(Some(record))
    }

    async fn remove(
        &self,
        key: &PrimaryKey,
        cache_key: &str,
        expected: Option<&[u8]>,
    ) -> PersistResult<Option<StoredRecord>> {
        self.check()?;
        let mut state = self.state.lock();
        let matches = state
            .owned(key, cache_key)
            .is_some_and(|record| expected.map_or(true, |bytes| record.value == bytes));
        if !matches {
            return Ok(None);
        }
        Ok(state.remove(key))
    }

    async fn remove_expired(
        &self,
        key: &PrimaryKey,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> PersistResult<Option<StoredRecord>> {
        self.check()?;
        let mut state = self.state.lock();
        let expired = state
            .owned(key, cache_key)
            .is_some_and(|record| record.is_expired_at(now));
        if !expired {
            return Ok(None);
        }
        Ok(state.remove(key))
    }

    async fn remove_batch(&self, keys: &[(PrimaryKey, String)]) -> PersistResult<Vec<StoredRecord>> {
        self.check()?;
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        for (key, cache_key) in keys {
            if state.owned(key, cache_key).is_some() {
                removed.extend(state.remove(key));
            }
        }
        Ok(removed)
    }

    async fn clear_partition(&self, partition: Partition) -> PersistResult<Vec<StoredRecord>> {
        self.check()?;
        let mut state = self.state.lock();
        let keys: Vec<PrimaryKey> = state.partition(partition).map(|(key, _)| key.clone()).collect();
        Ok(keys.iter().filter_map(|key| state.remove(key)).collect())
    }

    async fn scan_partition(&self, partition: Partition) -> PersistResult<Vec<StoredRecord>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .partition(partition)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn scan_expired(
        &self,
        partition: Partition,
        before: DateTime<Utc>,
    ) -> PersistResult<Vec<StoredRecord>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .by_expiry
            .iter()
            .take_while(|(at, _)| *at <= before)
            .filter(|(_, key)| partition.contains(key))
            .filter_map(|(_, key)| state.rows.get(key).cloned())
            .collect())
    }

    async fn scan_pattern(
        &self,
        partition: Partition,
        pattern: &KeyPattern,
    ) -> PersistResult<Vec<StoredRecord>> {
        self.check()?;
        let state = self.state.lock();
        Ok(state
            .partition(partition)
            .filter(|(_, record)| pattern.matches(&record.cache_key))
            .map(|(_, record)| record.clone())
            .collect())
    }
}
