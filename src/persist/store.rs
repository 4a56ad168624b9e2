//! Hash-Indexed Persistent Store
//!
//! Backend of the cache contract over a [`PersistenceDriver`], in fast or safe
//! key mode.

use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bincode::config::standard as bincode_config;
use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::contract::{
    check_ttl, deadline, remaining, Cache, CacheKey, CacheValue, DeletePredicate, OnExpired,
    RangeVisitor, Ttl, ValueInit,
};
use crate::cache::flight::SingleFlight;
use crate::cache::notify::ExpiryNotifier;
use crate::cache::stats::StatsRecorder;
use crate::cache::CacheStats;
use crate::config::PersistentConfig;
use crate::error::{CacheError, Result};
use crate::hasher::Hasher;
use crate::persist::driver::PersistenceDriver;
use crate::persist::record::{KeyMode, KeyPattern, Partition, PrimaryKey, StoredRecord};
use crate::tasks::{spawn_reaper, Reaper, Sweep};

/// Bounds on values a persistent store can hold.
pub trait PersistentValue: CacheValue + Serialize + DeserializeOwned {}

impl<T> PersistentValue for T where T: CacheValue + Serialize + DeserializeOwned {}

/// Bounds on keys a persistent store can hold. Keys are rebuilt from their raw
/// form for `range` and expiry callbacks.
pub trait PersistentKey: CacheKey + FromStr {}

impl<T> PersistentKey for T where T: CacheKey + FromStr {}

// == Persistent Store ==
/// Cache backend that stores rows through a persistence collaborator.
///
/// In [`KeyMode::Fast`] the raw key is verified after every digest lookup: a
/// mismatch reads as "not found" and is counted as a collision. Writes still
/// clobber a colliding row, so two keys colliding on both digests overwrite
/// each other. Prefix and suffix deletion is only available in [`KeyMode::Safe`].
pub struct PersistentStore<K, V>
where
    K: PersistentKey,
    V: PersistentValue,
{
    shared: Arc<Shared<K, V>>,
    reaper: Mutex<Option<Reaper>>,
}

struct Shared<K, V>
where
    K: PersistentKey,
    V: PersistentValue,
{
    driver: Arc<dyn PersistenceDriver>,
    hasher: Arc<dyn Hasher>,
    identity: String,
    partition: Partition,
    default_ttl: Option<Duration>,
    flight: SingleFlight<String>,
    notifier: ExpiryNotifier<K>,
    stats: StatsRecorder,
    _values: PhantomData<fn() -> V>,
}

impl<K, V> PersistentStore<K, V>
where
    K: PersistentKey,
    V: PersistentValue,
{
    /// Creates a store for `identity` in `mode`.
    ///
    /// Spawns the expiry sweep when `sweep_interval` is set, which requires a
    /// running Tokio runtime.
    pub fn new(
        driver: Arc<dyn PersistenceDriver>,
        hasher: Arc<dyn Hasher>,
        identity: impl Into<String>,
        mode: KeyMode,
        config: &PersistentConfig,
    ) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(CacheError::Configuration(
                "identity must not be empty".to_string(),
            ));
        }
        let default_ttl = check_ttl(config.default_ttl)?;
        let partition = Partition {
            mode,
            instance_hash: hasher.digest(&identity),
        };

        let shared = Arc::new(Shared {
            driver,
            hasher,
            identity,
            partition,
            default_ttl,
            flight: SingleFlight::new(),
            notifier: ExpiryNotifier::new(true),
            stats: StatsRecorder::new(),
            _values: PhantomData,
        });

        let reaper = match config.sweep_interval {
            Some(interval) => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(CacheError::Configuration(
                        "the expiry sweep requires a running Tokio runtime".to_string(),
                    ));
                }
                Some(spawn_reaper(shared.clone(), interval))
            }
            None => None,
        };

        Ok(Self {
            shared,
            reaper: Mutex::new(reaper),
        })
    }

    pub fn mode(&self) -> KeyMode {
        self.shared.partition.mode
    }

    /// Removes expired rows now, as one sweep would.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.shared.purge_expired().await
    }
}

impl<K, V> Shared<K, V>
where
    K: PersistentKey,
    V: PersistentValue,
{
    fn primary_key(&self, raw: &str) -> PrimaryKey {
        PrimaryKey::encode(
            self.partition.mode,
            self.hasher.as_ref(),
            self.partition.instance_hash,
            raw,
        )
    }

    fn record(
        &self,
        raw: String,
        value: &V,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<StoredRecord> {
        Ok(StoredRecord {
            instance_id: self.identity.clone(),
            cache_key: raw,
            value: encode_to_vec(value, bincode_config())?,
            expires_at: deadline(now, ttl),
            created_at: now,
            updated_at: now,
        })
    }

    fn decode(&self, record: &StoredRecord) -> Result<V> {
        let (value, _) = decode_from_slice(&record.value, bincode_config())?;
        Ok(value)
    }

    /// Fetches the live row owned by `raw`, expiring it lazily if needed.
    async fn live(&self, raw: &str, now: DateTime<Utc>) -> Result<Option<StoredRecord>> {
        let key = self.primary_key(raw);
        let Some(record) = self.driver.get(&key).await? else {
            return Ok(None);
        };
        if record.cache_key != raw {
            debug!(
                "digest collision in {}: wanted {}, slot holds {}",
                self.identity, raw, record.cache_key
            );
            self.stats.record_collision();
            return Ok(None);
        }
        if record.is_expired_at(now) {
            self.expire(&key, raw, now).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn lookup(&self, raw: &str) -> Result<Option<StoredRecord>> {
        let found = self.live(raw, Utc::now()).await?;
        self.stats.record_lookup(found.is_some());
        Ok(found)
    }

    /// Deletes a row that is still expired at `now`; fires the callback when
    /// this call did the delete.
    async fn expire(&self, key: &PrimaryKey, cache_key: &str, now: DateTime<Utc>) -> Result<bool> {
        let removed = self.driver.remove_expired(key, cache_key, now).await?;
        match removed {
            Some(record) => {
                self.expired(&record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn expired(&self, record: &StoredRecord) {
        self.stats.record_expiration();
        match record.cache_key.parse::<K>() {
            Ok(key) => self.notifier.notify(key),
            Err(_) => warn!(
                "expired key {} in {} does not parse back into a cache key",
                record.cache_key, self.identity
            ),
        }
    }

    /// Accounts for a row that was displaced by a write.
    fn displaced(&self, raw: &str, previous: &StoredRecord, now: DateTime<Utc>) {
        if previous.is_expired_at(now) {
            self.expired(previous);
        }
        if previous.cache_key != raw {
            debug!(
                "digest collision in {}: {} overwrote {}",
                self.identity, raw, previous.cache_key
            );
            self.stats.record_collision();
        }
    }

    /// Extends a live row; an expired one is settled through the lazy path.
    async fn refresh(&self, raw: &str, ttl: Option<Duration>) -> Result<Option<StoredRecord>> {
        let ttl = check_ttl(ttl)?.or(self.default_ttl);
        let now = Utc::now();
        let refreshed = self
            .driver
            .refresh(&self.primary_key(raw), raw, now, deadline(now, ttl))
            .await?;
        if refreshed.is_none() {
            self.live(raw, now).await?;
        }
        Ok(refreshed)
    }

    /// Counts live rows among removed ones, settling expired ones.
    fn settle(&self, removed: &[StoredRecord], now: DateTime<Utc>) -> usize {
        removed
            .iter()
            .filter(|record| {
                if record.is_expired_at(now) {
                    self.expired(record);
                    false
                } else {
                    true
                }
            })
            .count()
    }

    async fn load_or_insert(
        &self,
        raw: String,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<(V, bool)> {
        let now = Utc::now();
        let key = self.primary_key(&raw);
        let record = self.record(raw.clone(), &value, ttl, now)?;
        let upsert = self.driver.insert_if_vacant(&key, record, now).await?;

        if !upsert.inserted {
            if let Some(existing) = upsert.previous {
                return Ok((self.decode(&existing)?, true));
            }
        }
        if let Some(previous) = &upsert.previous {
            self.displaced(&raw, previous, now);
        }
        Ok((value, false))
    }

    async fn remove_matching(&self, pattern: KeyPattern) -> Result<usize> {
        let rows = self.driver.scan_pattern(self.partition, &pattern).await?;
        let keys: Vec<(PrimaryKey, String)> = rows
            .into_iter()
            .map(|record| (self.primary_key(&record.cache_key), record.cache_key))
            .collect();
        let removed = self.driver.remove_batch(&keys).await?;
        Ok(self.settle(&removed, Utc::now()))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let rows = self.driver.scan_expired(self.partition, now).await?;
        let mut removed = 0;
        for record in rows {
            let key = self.primary_key(&record.cache_key);
            if self.expire(&key, &record.cache_key, now).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl<K, V> Sweep for Shared<K, V>
where
    K: PersistentKey,
    V: PersistentValue,
{
    async fn sweep_expired(&self) -> Result<usize> {
        self.purge_expired().await
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for PersistentStore<K, V>
where
    K: PersistentKey,
    V: PersistentValue,
{
    async fn load(&self, key: &K) -> Result<Option<V>> {
        match self.shared.lookup(&key.to_string()).await? {
            Some(record) => Ok(Some(self.shared.decode(&record)?)),
            None => Ok(None),
        }
    }

    async fn load_or_store(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(V, bool)> {
        let ttl = check_ttl(ttl)?;
        self.shared.load_or_insert(key.to_string(), value, ttl).await
    }

    async fn load_or_store_with(
        &self,
        key: K,
        init: ValueInit<V>,
        ttl: Option<Duration>,
    ) -> Result<(V, bool)> {
        let ttl = check_ttl(ttl)?;
        let raw = key.to_string();
        let shared = &self.shared;
        if let Some(record) = shared.live(&raw, Utc::now()).await? {
            return Ok((shared.decode(&record)?, true));
        }

        shared
            .flight
            .run(raw.clone(), move || async move {
                if let Some(record) = shared.live(&raw, Utc::now()).await? {
                    return Ok((shared.decode(&record)?, true));
                }
                let value = match init().await {
                    Ok(value) => value,
                    Err(err) => return Err(CacheError::Construction(err)),
                };
                shared.load_or_insert(raw, value, ttl).await
            })
            .await
    }

    async fn load_and_delete(&self, key: &K) -> Result<Option<V>> {
        let raw = key.to_string();
        let removed = self
            .shared
            .driver
            .remove(&self.shared.primary_key(&raw), &raw, None)
            .await?;
        match removed {
            Some(record) if record.is_expired_at(Utc::now()) => {
                self.shared.expired(&record);
                Ok(None)
            }
            Some(record) => Ok(Some(self.shared.decode(&record)?)),
            None => Ok(None),
        }
    }

    async fn load_and_delete_if(
        &self,
        key: &K,
        predicate: DeletePredicate<'_, V>,
    ) -> Result<(Option<V>, bool)> {
        let raw = key.to_string();
        let Some(record) = self.shared.live(&raw, Utc::now()).await? else {
            return Ok((None, false));
        };
        let value = self.shared.decode(&record)?;
        if !predicate(&value) {
            return Ok((Some(value), false));
        }

        // compare-and-delete: a concurrent overwrite is left in place
        let removed = self
            .shared
            .driver
            .remove(&self.shared.primary_key(&raw), &raw, Some(&record.value))
            .await?;
        Ok((Some(value), removed.is_some()))
    }

    async fn load_and_refresh(&self, key: &K, ttl: Option<Duration>) -> Result<Option<V>> {
        let refreshed = self.shared.refresh(&key.to_string(), ttl).await?;
        self.shared.stats.record_lookup(refreshed.is_some());
        match refreshed {
            Some(record) => Ok(Some(self.shared.decode(&record)?)),
            None => Ok(None),
        }
    }

    async fn load_with_expiry(&self, key: &K) -> Result<Option<(V, Option<DateTime<Utc>>)>> {
        match self.shared.lookup(&key.to_string()).await? {
            Some(record) => Ok(Some((self.shared.decode(&record)?, record.expires_at))),
            None => Ok(None),
        }
    }

    async fn refresh(&self, key: &K, ttl: Option<Duration>) -> Result<bool> {
        Ok(self.shared.refresh(&key.to_string(), ttl).await?.is_some())
    }

    async fn ttl(&self, key: &K) -> Result<Option<Ttl>> {
        let now = Utc::now();
        let record = self.shared.live(&key.to_string(), now).await?;
        Ok(record.map(|record| remaining(record.expires_at, now)))
    }

    async fn is_expired(&self, key: &K) -> Result<bool> {
        let raw = key.to_string();
        let record = self.shared.driver.get(&self.shared.primary_key(&raw)).await?;
        Ok(record.map_or(true, |record| !record.is_live_for(&raw, Utc::now())))
    }

    async fn heartbeat(&self, key: &K) -> Result<Option<DateTime<Utc>>> {
        let record = self.shared.live(&key.to_string(), Utc::now()).await?;
        Ok(record.map(|record| record.updated_at))
    }

    async fn store(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()> {
        let ttl = check_ttl(ttl)?;
        let raw = key.to_string();
        let now = Utc::now();
        let primary = self.shared.primary_key(&raw);
        let record = self.shared.record(raw.clone(), &value, ttl, now)?;
        if let Some(previous) = self.shared.driver.put(&primary, record).await? {
            self.shared.displaced(&raw, &previous, now);
        }
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<bool> {
        Ok(self.load_and_delete(key).await?.is_some())
    }

    async fn delete_all(&self) -> Result<usize> {
        let removed = self.shared.driver.clear_partition(self.shared.partition).await?;
        Ok(self.shared.settle(&removed, Utc::now()))
    }

    async fn delete_and_count(&self, keys: &[K]) -> Result<usize> {
        let keys: Vec<(PrimaryKey, String)> = keys
            .iter()
            .map(|key| {
                let raw = key.to_string();
                (self.shared.primary_key(&raw), raw)
            })
            .collect();
        let removed = self.shared.driver.remove_batch(&keys).await?;
        Ok(self.shared.settle(&removed, Utc::now()))
    }

    async fn range(&self, visit: RangeVisitor<'_, K, V>) -> Result<()> {
        let now = Utc::now();
        let rows = self.shared.driver.scan_partition(self.shared.partition).await?;
        for record in rows.iter().filter(|record| !record.is_expired_at(now)) {
            let Ok(key) = record.cache_key.parse::<K>() else {
                warn!(
                    "skipping key {} in {}: does not parse back into a cache key",
                    record.cache_key, self.shared.identity
                );
                continue;
            };
            let value = self.shared.decode(record)?;
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        if self.shared.partition.mode == KeyMode::Fast {
            return Err(CacheError::Unsupported(
                "prefix deletion needs raw keys in the primary index (safe mode)",
            ));
        }
        self.shared
            .remove_matching(KeyPattern::Prefix(prefix.to_string()))
            .await
    }

    async fn delete_suffix(&self, suffix: &str) -> Result<usize> {
        if self.shared.partition.mode == KeyMode::Fast {
            return Err(CacheError::Unsupported(
                "suffix deletion needs raw keys in the primary index (safe mode)",
            ));
        }
        self.shared
            .remove_matching(KeyPattern::Suffix(suffix.to_string()))
            .await
    }

    fn set_on_expired(&self, callback: OnExpired<K>) {
        self.shared.notifier.set(callback);
    }

    fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot(None)
    }

    async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().await.as_mut() {
            reaper.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::contract::lazy;
    use crate::error::{BoxError, PersistenceError};
    use crate::hasher::XxHasher;
    use crate::persist::driver::{MemoryTable, PersistResult, Upsert};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Driver that lands a pending write right before an expiry delete, as a
    /// concurrent `store` would between a reader's fetch and its delete.
    struct RewriteBeforeExpiry {
        table: Arc<MemoryTable>,
        pending: parking_lot::Mutex<Option<(PrimaryKey, StoredRecord)>>,
    }

    #[async_trait]
    impl PersistenceDriver for RewriteBeforeExpiry {
        async fn insert_if_vacant(
            &self,
            key: &PrimaryKey,
            record: StoredRecord,
            now: DateTime<Utc>,
        ) -> PersistResult<Upsert> {
            self.table.insert_if_vacant(key, record, now).await
        }

        async fn put(
            &self,
            key: &PrimaryKey,
            record: StoredRecord,
        ) -> PersistResult<Option<StoredRecord>> {
            self.table.put(key, record).await
        }

        async fn get(&self, key: &PrimaryKey) -> PersistResult<Option<StoredRecord>> {
            self.table.get(key).await
        }

        async fn refresh(
            &self,
            key: &PrimaryKey,
            cache_key: &str,
            now: DateTime<Utc>,
            extend_to: Option<DateTime<Utc>>,
        ) -> PersistResult<Option<StoredRecord>> {
            self.table.refresh(key, cache_key, now, extend_to).await
        }

        async fn remove(
            &self,
            key: &PrimaryKey,
            cache_key: &str,
            expected: Option<&[u8]>,
        ) -> PersistResult<Option<StoredRecord>> {
            self.table.remove(key, cache_key, expected).await
        }

        async fn remove_expired(
            &self,
            key: &PrimaryKey,
            cache_key: &str,
            now: DateTime<Utc>,
        ) -> PersistResult<Option<StoredRecord>> {
            let pending = self.pending.lock().take();
            if let Some((pending_key, record)) = pending {
                self.table.put(&pending_key, record).await?;
            }
            self.table.remove_expired(key, cache_key, now).await
        }

        async fn remove_batch(
            &self,
            keys: &[(PrimaryKey, String)],
        ) -> PersistResult<Vec<StoredRecord>> {
            self.table.remove_batch(keys).await
        }

        async fn clear_partition(&self, partition: Partition) -> PersistResult<Vec<StoredRecord>> {
            self.table.clear_partition(partition).await
        }

        async fn scan_partition(&self, partition: Partition) -> PersistResult<Vec<StoredRecord>> {
            self.table.scan_partition(partition).await
        }

        async fn scan_expired(
            &self,
            partition: Partition,
            before: DateTime<Utc>,
        ) -> PersistResult<Vec<StoredRecord>> {
            self.table.scan_expired(partition, before).await
        }

        async fn scan_pattern(
            &self,
            partition: Partition,
            pattern: &KeyPattern,
        ) -> PersistResult<Vec<StoredRecord>> {
            self.table.scan_pattern(partition, pattern).await
        }
    }

    fn lazy_only() -> PersistentConfig {
        PersistentConfig {
            default_ttl: Some(Duration::from_secs(300)),
            sweep_interval: None,
        }
    }

    fn open(
        table: &Arc<MemoryTable>,
        hasher: Arc<dyn Hasher>,
        mode: KeyMode,
    ) -> PersistentStore<String, String> {
        PersistentStore::new(table.clone(), hasher, "tenant", mode, &lazy_only()).unwrap()
    }

    fn safe() -> PersistentStore<String, String> {
        open(&Arc::new(MemoryTable::new()), Arc::new(XxHasher::default()), KeyMode::Safe)
    }

    /// Digest that maps every key to the same slot.
    fn colliding() -> Arc<dyn Hasher> {
        Arc::new(|raw: &str| if raw == "tenant" { 1u64 } else { 42u64 })
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[tokio::test]
    async fn test_store_and_load_round_trip() {
        let cache = safe();
        cache.store(key("k"), key("v"), None).await.unwrap();
        assert_eq!(cache.load(&key("k")).await.unwrap(), Some(key("v")));
    }

    #[tokio::test]
    async fn test_structured_values() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Session {
            user: u64,
            roles: Vec<String>,
        }

        let table = Arc::new(MemoryTable::new());
        let cache: PersistentStore<u64, Session> = PersistentStore::new(
            table,
            Arc::new(XxHasher::default()),
            "sessions",
            KeyMode::Fast,
            &lazy_only(),
        )
        .unwrap();

        let session = Session {
            user: 7,
            roles: vec!["admin".to_string()],
        };
        cache.store(7, session.clone(), None).await.unwrap();
        assert_eq!(cache.load(&7).await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn test_identities_are_partitioned() {
        let table = Arc::new(MemoryTable::new());
        let hasher: Arc<dyn Hasher> = Arc::new(XxHasher::default());
        let a: PersistentStore<String, String> =
            PersistentStore::new(table.clone(), hasher.clone(), "a", KeyMode::Safe, &lazy_only())
                .unwrap();
        let b: PersistentStore<String, String> =
            PersistentStore::new(table.clone(), hasher, "b", KeyMode::Safe, &lazy_only()).unwrap();

        a.store(key("k"), key("from-a"), None).await.unwrap();

        assert!(b.load(&key("k")).await.unwrap().is_none());
        assert_eq!(b.delete_all().await.unwrap(), 0);
        assert_eq!(a.load(&key("k")).await.unwrap(), Some(key("from-a")));
    }

    #[tokio::test]
    async fn test_fast_mode_collision_overwrites() {
        let table = Arc::new(MemoryTable::new());
        let cache = open(&table, colliding(), KeyMode::Fast);

        cache.store(key("alpha"), key("1"), None).await.unwrap();
        cache.store(key("beta"), key("2"), None).await.unwrap();

        assert_eq!(table.len(), 1, "colliding keys share one row");
        assert_eq!(cache.load(&key("alpha")).await.unwrap(), None);
        assert_eq!(cache.load(&key("beta")).await.unwrap(), Some(key("2")));
        assert_eq!(cache.stats().collisions, 2);
    }

    #[tokio::test]
    async fn test_fast_mode_write_over_expired_colliding_row_fires_callback() {
        let table = Arc::new(MemoryTable::new());
        let cache = open(&table, colliding(), KeyMode::Fast);
        let (tx, mut rx) = mpsc::unbounded_channel();
        cache.set_on_expired(Arc::new(move |k: String| {
            let _ = tx.send(k);
        }));

        cache
            .store(key("alpha"), key("1"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.store(key("beta"), key("2"), None).await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("alpha"));
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.collisions, 1);
        assert_eq!(cache.load(&key("beta")).await.unwrap(), Some(key("2")));
    }

    #[tokio::test]
    async fn test_safe_mode_retains_colliding_keys() {
        let table = Arc::new(MemoryTable::new());
        let cache = open(&table, colliding(), KeyMode::Safe);

        cache.store(key("alpha"), key("1"), None).await.unwrap();
        cache.store(key("beta"), key("2"), None).await.unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(cache.load(&key("alpha")).await.unwrap(), Some(key("1")));
        assert_eq!(cache.load(&key("beta")).await.unwrap(), Some(key("2")));
        assert_eq!(cache.stats().collisions, 0);
    }

    #[tokio::test]
    async fn test_fast_mode_delete_does_not_touch_colliding_row() {
        let table = Arc::new(MemoryTable::new());
        let cache = open(&table, colliding(), KeyMode::Fast);

        cache.store(key("beta"), key("2"), None).await.unwrap();

        assert!(!cache.delete(&key("alpha")).await.unwrap());
        assert_eq!(cache.load(&key("beta")).await.unwrap(), Some(key("2")));
    }

    #[tokio::test]
    async fn test_fast_mode_rejects_prefix_deletion() {
        let cache = open(
            &Arc::new(MemoryTable::new()),
            Arc::new(XxHasher::default()),
            KeyMode::Fast,
        );

        assert!(matches!(
            cache.delete_prefix("user:").await,
            Err(CacheError::Unsupported(_))
        ));
        assert!(matches!(
            cache.delete_suffix(":1").await,
            Err(CacheError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_safe_mode_delete_prefix() {
        let cache = safe();
        for k in ["user:1", "user:2", "order:1"] {
            cache.store(key(k), key("v"), None).await.unwrap();
        }

        assert_eq!(cache.delete_prefix("user:").await.unwrap(), 2);
        assert!(cache.load(&key("user:1")).await.unwrap().is_none());
        assert!(cache.load(&key("order:1")).await.unwrap().is_some());
        assert_eq!(cache.delete_suffix(":1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_load_or_store_first_writer_wins() {
        let cache = safe();

        assert_eq!(
            cache.load_or_store(key("k"), key("v1"), None).await.unwrap(),
            (key("v1"), false)
        );
        assert_eq!(
            cache.load_or_store(key("k"), key("v2"), None).await.unwrap(),
            (key("v1"), true)
        );
    }

    #[tokio::test]
    async fn test_load_or_store_with_runs_constructor_once() {
        let cache = Arc::new(safe());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let init = lazy(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, BoxError>(key("built"))
                });
                cache.load_or_store_with(key("k"), init, None).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().0, "built");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_and_lazy_callback() {
        let cache = safe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        cache.set_on_expired(Arc::new(move |k: String| {
            let _ = tx.send(k);
        }));

        cache
            .store(key("k"), key("v"), Some(Duration::from_millis(50)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.load(&key("k")).await.unwrap().is_some());
        match cache.ttl(&key("k")).await.unwrap() {
            Some(Ttl::Remaining(left)) => {
                assert!(left > Duration::ZERO && left <= Duration::from_millis(50))
            }
            other => panic!("unexpected ttl {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(cache.is_expired(&key("k")).await.unwrap());
        assert!(cache.load(&key("k")).await.unwrap().is_none());
        assert_eq!(rx.recv().await.as_deref(), Some("k"));
        assert_eq!(cache.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lazy_expiry_spares_concurrent_rewrite_with_same_value() {
        let table = Arc::new(MemoryTable::new());
        let driver = Arc::new(RewriteBeforeExpiry {
            table: table.clone(),
            pending: parking_lot::Mutex::new(None),
        });
        let cache: PersistentStore<String, String> = PersistentStore::new(
            driver.clone(),
            Arc::new(XxHasher::default()),
            "tenant",
            KeyMode::Safe,
            &lazy_only(),
        )
        .unwrap();

        cache
            .store(key("k"), key("v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let primary = cache.shared.primary_key("k");
        let mut fresh = table.get(&primary).await.unwrap().unwrap();
        let now = Utc::now();
        fresh.updated_at = now;
        fresh.expires_at = Some(now + chrono::Duration::seconds(60));
        *driver.pending.lock() = Some((primary, fresh));

        assert_eq!(cache.load(&key("k")).await.unwrap(), None);

        assert_eq!(table.len(), 1, "the rewrite must survive");
        assert_eq!(cache.stats().expirations, 0);
        assert_eq!(cache.load(&key("k")).await.unwrap(), Some(key("v")));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_rows() {
        let table = Arc::new(MemoryTable::new());
        let cache: PersistentStore<String, String> = PersistentStore::new(
            table.clone(),
            Arc::new(XxHasher::default()),
            "tenant",
            KeyMode::Safe,
            &PersistentConfig {
                default_ttl: None,
                sweep_interval: Some(Duration::from_millis(10)),
            },
        )
        .unwrap();

        cache
            .store(key("short"), key("v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        cache.store(key("long"), key("v"), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(table.len(), 1);
        assert_eq!(cache.stats().expirations, 1);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_and_delete_if() {
        let cache = safe();
        cache.store(key("k"), key("keep"), None).await.unwrap();

        let (value, removed) = cache
            .load_and_delete_if(&key("k"), &|v: &String| v == "drop")
            .await
            .unwrap();
        assert_eq!((value, removed), (Some(key("keep")), false));

        let (_, removed) = cache
            .load_and_delete_if(&key("k"), &|v: &String| v == "keep")
            .await
            .unwrap();
        assert!(removed);
        assert!(cache.load(&key("k")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_and_heartbeat() {
        let cache = safe();
        cache
            .store(key("k"), key("v"), Some(Duration::from_millis(40)))
            .await
            .unwrap();
        let first = cache.heartbeat(&key("k")).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            cache.load_and_refresh(&key("k"), None).await.unwrap(),
            Some(key("v"))
        );
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.heartbeat(&key("k")).await.unwrap().unwrap() > first);
        assert!(cache.refresh(&key("k"), None).await.unwrap());
        assert!(!cache.refresh(&key("absent"), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_count_and_range() {
        let cache = safe();
        for k in ["a", "b", "c"] {
            cache.store(key(k), key(k), None).await.unwrap();
        }

        let mut seen = Vec::new();
        cache
            .range(&mut |k: &String, v: &String| {
                seen.push((k.clone(), v.clone()));
                true
            })
            .await
            .unwrap();
        assert_eq!(seen.len(), 3);

        let removed = cache
            .delete_and_count(&[key("a"), key("b"), key("zzz")])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.delete_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let table = Arc::new(MemoryTable::new());
        let cache = open(&table, Arc::new(XxHasher::default()), KeyMode::Safe);
        table.set_offline(true);

        let result = cache.load(&key("k")).await;
        assert!(matches!(
            result,
            Err(CacheError::Persistence(PersistenceError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_empty_identity_rejected() {
        let result = PersistentStore::<String, String>::new(
            Arc::new(MemoryTable::new()),
            Arc::new(XxHasher::default()),
            "",
            KeyMode::Safe,
            &lazy_only(),
        );
        assert!(matches!(result, Err(CacheError::Configuration(_))));
    }
}
