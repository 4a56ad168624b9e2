//! Cache Engine Contract
//!
//! The operation set every backend satisfies. Callers only ever see this trait.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::cache::CacheStats;
use crate::error::{BoxError, CacheError, Result};

/// Bounds on cache keys. The `Display` form is the raw key used for
/// prefix/suffix matching and persistent indexing.
pub trait CacheKey: Eq + Hash + Clone + Display + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + Display + Send + Sync + 'static {}

/// Bounds on cache values.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Callback fired with the key of a naturally expired entry.
pub type OnExpired<K> = Arc<dyn Fn(K) + Send + Sync>;

/// Lazily evaluated value constructor for [`Cache::load_or_store_with`].
pub type ValueInit<V> =
    Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<V, BoxError>> + Send>;

/// Predicate evaluated by [`Cache::load_and_delete_if`].
pub type DeletePredicate<'a, V> = &'a (dyn Fn(&V) -> bool + Send + Sync);

/// Visitor passed to [`Cache::range`]; returning `false` stops iteration.
pub type RangeVisitor<'a, K, V> = &'a mut (dyn FnMut(&K, &V) -> bool + Send);

/// Wraps an async closure into a [`ValueInit`].
pub fn lazy<V, E, F, Fut>(init: F) -> ValueInit<V>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    E: Into<BoxError>,
{
    Box::new(move || init().map(|res| res.map_err(Into::into)).boxed())
}

// == Time To Live ==
/// Remaining lifetime of a present entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The entry never expires
    Forever,
    /// Time left until expiry
    Remaining(Duration),
}

/// Rejects zero TTLs; `None` means "no expiry" on writes and "backend default" on refreshes.
pub(crate) fn check_ttl(ttl: Option<Duration>) -> Result<Option<Duration>> {
    match ttl {
        Some(d) if d.is_zero() => Err(CacheError::InvalidTtl),
        other => Ok(other),
    }
}

/// Absolute expiry instant for a TTL starting at `now`. Out-of-range TTLs never expire.
pub(crate) fn deadline(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    now.checked_add_signed(ttl)
}

/// Refresh rule shared by all backends: never shorten, never add expiry to a
/// non-expiring entry.
pub(crate) fn extended(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(cur), Some(new)) => Some(cur.max(new)),
        (current, _) => current,
    }
}

/// Remaining lifetime of an entry expiring at `expires_at`, observed at `now`.
pub(crate) fn remaining(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Ttl {
    match expires_at {
        None => Ttl::Forever,
        Some(at) => Ttl::Remaining((at - now).to_std().unwrap_or(Duration::ZERO)),
    }
}

/// Uniform access contract for expiring key-value backends.
///
/// Expired entries behave as absent on every path. Write operations take
/// `ttl: None` as "never expires"; refresh operations take it as "use the
/// backend's default TTL".
#[async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: CacheKey,
    V: CacheValue,
{
    /// Returns the live value without touching heartbeat or expiry.
    async fn load(&self, key: &K) -> Result<Option<V>>;

    /// Returns `(existing, true)` for a live entry, otherwise stores `value`
    /// and returns `(value, false)`.
    async fn load_or_store(&self, key: K, value: V, ttl: Option<Duration>) -> Result<(V, bool)>;

    /// Like [`Cache::load_or_store`] but builds the value only on a miss.
    /// Concurrent callers on the same missing key run at most one constructor.
    async fn load_or_store_with(
        &self,
        key: K,
        init: ValueInit<V>,
        ttl: Option<Duration>,
    ) -> Result<(V, bool)>;

    /// Removes and returns the live value.
    async fn load_and_delete(&self, key: &K) -> Result<Option<V>>;

    /// Removes the entry only if `predicate` holds for its value.
    /// Returns the observed value and whether it was removed.
    async fn load_and_delete_if(
        &self,
        key: &K,
        predicate: DeletePredicate<'_, V>,
    ) -> Result<(Option<V>, bool)>;

    /// Returns the live value and extends its expiry and heartbeat.
    async fn load_and_refresh(&self, key: &K, ttl: Option<Duration>) -> Result<Option<V>>;

    /// Returns the live value with its absolute expiry (`None` = never).
    async fn load_with_expiry(&self, key: &K) -> Result<Option<(V, Option<DateTime<Utc>>)>>;

    /// Extends expiry and heartbeat; returns whether a live entry existed.
    async fn refresh(&self, key: &K, ttl: Option<Duration>) -> Result<bool>;

    /// Remaining lifetime, `None` when absent.
    async fn ttl(&self, key: &K) -> Result<Option<Ttl>>;

    /// True when absent or past expiry. Never evicts.
    async fn is_expired(&self, key: &K) -> Result<bool>;

    /// Last time the entry was written or refreshed.
    async fn heartbeat(&self, key: &K) -> Result<Option<DateTime<Utc>>>;

    /// Unconditional insert or overwrite.
    async fn store(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()>;

    /// Removes one entry; returns whether a live entry existed.
    async fn delete(&self, key: &K) -> Result<bool>;

    /// Removes every entry; returns how many live entries were removed.
    async fn delete_all(&self) -> Result<usize>;

    /// Removes a batch of keys; returns how many of them were live.
    async fn delete_and_count(&self, keys: &[K]) -> Result<usize>;

    /// Visits a snapshot of live entries until `visit` returns `false`.
    async fn range(&self, visit: RangeVisitor<'_, K, V>) -> Result<()>;

    /// Removes every key whose raw form starts with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Removes every key whose raw form ends with `suffix`.
    async fn delete_suffix(&self, suffix: &str) -> Result<usize>;

    /// Registers the expiry callback, replacing any previous one.
    fn set_on_expired(&self, callback: OnExpired<K>);

    /// Snapshot of the backend's counters.
    fn stats(&self) -> CacheStats;

    /// Stops background work and waits for it to finish. Idempotent.
    async fn shutdown(&self);
}
