//! In-Memory TTL Store
//!
//! Sharded concurrent map with lazy read-time expiry, a background reaper and
//! expiry callbacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::contract::{
    check_ttl, Cache, CacheKey, CacheValue, DeletePredicate, OnExpired, RangeVisitor, Ttl,
    ValueInit,
};
use crate::cache::flight::SingleFlight;
use crate::cache::notify::ExpiryNotifier;
use crate::cache::stats::StatsRecorder;
use crate::cache::{CacheEntry, CacheStats};
use crate::config::MemoryConfig;
use crate::error::{CacheError, Result};
use crate::tasks::{spawn_reaper, Reaper, Sweep};

// == Memory Store ==
/// In-process backend of the cache contract.
///
/// An entry whose expiry has passed fires the expiry callback exactly once
/// when it leaves the map, whichever path removes it.
pub struct MemoryStore<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    shared: Arc<Shared<K, V>>,
    reaper: Mutex<Option<Reaper>>,
}

struct Shared<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    entries: DashMap<K, CacheEntry<V>>,
    flight: SingleFlight<K>,
    notifier: ExpiryNotifier<K>,
    stats: StatsRecorder,
    default_ttl: Option<Duration>,
}

impl<K, V> MemoryStore<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    // == Constructor ==
    /// Creates a store from its tuning section.
    ///
    /// Spawns the reaper when `reap_interval` is set, which requires a running
    /// Tokio runtime.
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        let default_ttl = check_ttl(config.default_ttl)?;
        let shared = Arc::new(Shared {
            entries: DashMap::new(),
            flight: SingleFlight::new(),
            notifier: ExpiryNotifier::new(config.notify_expired),
            stats: StatsRecorder::new(),
            default_ttl,
        });

        let reaper = match config.reap_interval {
            Some(interval) => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(CacheError::Configuration(
                        "the reaper requires a running Tokio runtime".to_string(),
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

    /// Creates a store without a reaper; expiry is purely lazy.
    pub fn unreaped(default_ttl: Option<Duration>) -> Result<Self> {
        Self::new(&MemoryConfig {
            default_ttl,
            reap_interval: None,
            notify_expired: true,
        })
    }

    // == Length ==
    /// Number of stored entries, including expired ones not yet reaped.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Removes expired entries now, as one reaper pass would.
    pub fn purge_expired(&self) -> usize {
        self.shared.purge_expired()
    }
}

impl<K, V> Shared<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    /// Live entry, cloned through `read`. Expired entries are evicted on the way.
    fn live<T>(
        &self,
        key: &K,
        now: DateTime<Utc>,
        read: impl FnOnce(&CacheEntry<V>) -> T,
    ) -> Option<T> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => return Some(read(entry.value())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.evict_if_expired(key, now);
        }
        None
    }

    fn lookup<T>(&self, key: &K, read: impl FnOnce(&CacheEntry<V>) -> T) -> Option<T> {
        let found = self.live(key, Utc::now(), read);
        self.stats.record_lookup(found.is_some());
        found
    }

    /// Removes `key` only if it is still expired at `now`. The winner of the
    /// race with other readers and the reaper fires the callback.
    fn evict_if_expired(&self, key: &K, now: DateTime<Utc>) -> bool {
        match self.entries.remove_if(key, |_, entry| entry.is_expired_at(now)) {
            Some((key, _)) => {
                self.expired(key);
                true
            }
            None => false,
        }
    }

    fn expired(&self, key: K) {
        self.stats.record_expiration();
        self.notifier.notify(key);
    }

    /// Accounts for an entry that has already left the map; yields its value if it was live.
    fn settle(&self, key: K, entry: CacheEntry<V>, now: DateTime<Utc>) -> Option<V> {
        if entry.is_expired_at(now) {
            self.expired(key);
            None
        } else {
            Some(entry.value)
        }
    }

    fn load_or_insert(&self, key: K, value: V, ttl: Option<Duration>) -> (V, bool) {
        let now = Utc::now();
        let replaced = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired_at(now) {
                    return (occupied.get().value.clone(), true);
                }
                let key = occupied.key().clone();
                occupied.insert(CacheEntry::created_at(value.clone(), ttl, now));
                Some(key)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::created_at(value.clone(), ttl, now));
                None
            }
        };
        if let Some(key) = replaced {
            self.expired(key);
        }
        (value, false)
    }

    fn remove_matching(&self, matches: impl Fn(&str) -> bool) -> usize {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|item| matches(&item.key().to_string()))
            .map(|item| item.key().clone())
            .collect();
        self.remove_many(keys.iter())
    }

    fn remove_many<'a>(&self, keys: impl Iterator<Item = &'a K>) -> usize {
        let now = Utc::now();
        keys.filter_map(|key| self.entries.remove(key))
            .filter_map(|(key, entry)| self.settle(key, entry, now))
            .count()
    }

    fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|item| item.value().is_expired_at(now))
            .map(|item| item.key().clone())
            .collect();

        expired
            .iter()
            .filter(|key| self.evict_if_expired(key, now))
            .count()
    }
}

#[async_trait]
impl<K, V> Sweep for Shared<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn sweep_expired(&self) -> Result<usize> {
        Ok(self.purge_expired())
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for MemoryStore<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn load(&self, key: &K) -> Result<Option<V>> {
        Ok(self.shared.lookup(key, |entry| entry.value.clone()))
    }

    async fn load_or_store(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(V, bool)> {
        let ttl = check_ttl(ttl)?;
        Ok(self.shared.load_or_insert(key, value, ttl))
    }

    async fn load_or_store_with(
        &self,
        key: K,
        init: ValueInit<V>,
        ttl: Option<Duration>,
    ) -> Result<(V, bool)> {
        let ttl = check_ttl(ttl)?;
        if let Some(value) = self.shared.live(&key, Utc::now(), |entry| entry.value.clone()) {
            return Ok((value, true));
        }

        let shared = &self.shared;
        shared
            .flight
            .run(key.clone(), move || async move {
                if let Some(value) = shared.live(&key, Utc::now(), |entry| entry.value.clone()) {
                    return Ok((value, true));
                }
                debug!("constructing value for missing key {}", key);
                let value = match init().await {
                    Ok(value) => value,
                    Err(err) => return Err(CacheError::Construction(err)),
                };
                Ok(shared.load_or_insert(key, value, ttl))
            })
            .await
    }

    async fn load_and_delete(&self, key: &K) -> Result<Option<V>> {
        let now = Utc::now();
        Ok(self
            .shared
            .entries
            .remove(key)
            .and_then(|(key, entry)| self.shared.settle(key, entry, now)))
    }

    async fn load_and_delete_if(
        &self,
        key: &K,
        predicate: DeletePredicate<'_, V>,
    ) -> Result<(Option<V>, bool)> {
        let now = Utc::now();
        let Some((value, revision)) = self
            .shared
            .live(key, now, |entry| (entry.value.clone(), entry.revision))
        else {
            return Ok((None, false));
        };
        // predicate runs without a shard guard so it may call back into the store
        if !predicate(&value) {
            return Ok((Some(value), false));
        }
        let removed = self
            .shared
            .entries
            .remove_if(key, |_, entry| entry.revision == revision && !entry.is_expired_at(now))
            .is_some();
        Ok((Some(value), removed))
    }

    async fn load_and_refresh(&self, key: &K, ttl: Option<Duration>) -> Result<Option<V>> {
        let ttl = check_ttl(ttl)?.or(self.shared.default_ttl);
        let now = Utc::now();
        let expired = match self.shared.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired_at(now) => {
                entry.refresh(ttl, now);
                self.shared.stats.record_lookup(true);
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        // shard guard is released here; evicting under it would deadlock
        if expired {
            self.shared.evict_if_expired(key, now);
        }
        self.shared.stats.record_lookup(false);
        Ok(None)
    }

    async fn load_with_expiry(&self, key: &K) -> Result<Option<(V, Option<DateTime<Utc>>)>> {
        Ok(self
            .shared
            .lookup(key, |entry| (entry.value.clone(), entry.expires_at)))
    }

    async fn refresh(&self, key: &K, ttl: Option<Duration>) -> Result<bool> {
        let ttl = check_ttl(ttl)?.or(self.shared.default_ttl);
        let now = Utc::now();
        let expired = match self.shared.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired_at(now) => {
                entry.refresh(ttl, now);
                return Ok(true);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.shared.evict_if_expired(key, now);
        }
        Ok(false)
    }

    async fn ttl(&self, key: &K) -> Result<Option<Ttl>> {
        let now = Utc::now();
        Ok(self.shared.live(key, now, |entry| entry.ttl_remaining(now)))
    }

    async fn is_expired(&self, key: &K) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .shared
            .entries
            .get(key)
            .map_or(true, |entry| entry.is_expired_at(now)))
    }

    async fn heartbeat(&self, key: &K) -> Result<Option<DateTime<Utc>>> {
        Ok(self.shared.live(key, Utc::now(), |entry| entry.heartbeat))
    }

    async fn store(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()> {
        let ttl = check_ttl(ttl)?;
        let now = Utc::now();
        let previous = self
            .shared
            .entries
            .insert(key.clone(), CacheEntry::created_at(value, ttl, now));
        if let Some(previous) = previous {
            self.shared.settle(key, previous, now);
        }
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<bool> {
        Ok(self.load_and_delete(key).await?.is_some())
    }

    async fn delete_all(&self) -> Result<usize> {
        let keys: Vec<K> = self
            .shared
            .entries
            .iter()
            .map(|item| item.key().clone())
            .collect();
        Ok(self.shared.remove_many(keys.iter()))
    }

    async fn delete_and_count(&self, keys: &[K]) -> Result<usize> {
        Ok(self.shared.remove_many(keys.iter()))
    }

    async fn range(&self, visit: RangeVisitor<'_, K, V>) -> Result<()> {
        let now = Utc::now();
        let snapshot: Vec<(K, V)> = self
            .shared
            .entries
            .iter()
            .filter(|item| !item.value().is_expired_at(now))
            .map(|item| (item.key().clone(), item.value().value.clone()))
            .collect();

        for (key, value) in &snapshot {
            if !visit(key, value) {
                break;
            }
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self.shared.remove_matching(|raw| raw.starts_with(prefix)))
    }

    async fn delete_suffix(&self, suffix: &str) -> Result<usize> {
        Ok(self.shared.remove_matching(|raw| raw.ends_with(suffix)))
    }

    fn set_on_expired(&self, callback: OnExpired<K>) {
        self.shared.notifier.set(callback);
    }

    fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot(Some(self.shared.entries.len()))
    }

    async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().await.as_mut() {
            reaper.shutdown().await;
        }
    }
}
