//! Cache Entry Module
//!
//! Defines the structure for individual in-memory entries with TTL and heartbeat tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::contract::{deadline, extended, remaining, Ttl};

static REVISIONS: AtomicU64 = AtomicU64::new(0);

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The stored value
    pub value: V,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last write or refresh
    pub heartbeat: DateTime<Utc>,
    /// Expiration timestamp, None = no expiration
    pub expires_at: Option<DateTime<Utc>>,
    /// Unique per write; refreshes keep it
    pub(crate) revision: u64,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a new cache entry with optional TTL.
    ///
    /// # Arguments
    /// * `value` - The value to store
    /// * `ttl` - Optional TTL, None = never expires
    pub fn new(value: V, ttl: Option<Duration>) -> Self {
        Self::created_at(value, ttl, Utc::now())
    }

    /// Creates an entry as if written at `now`.
    pub fn created_at(value: V, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        Self {
            value,
            created_at: now,
            heartbeat: now,
            expires_at: deadline(now, ttl),
            revision: REVISIONS.fetch_add(1, Ordering::Relaxed),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// Boundary condition: an entry is expired once the current time is
    /// greater than or equal to its expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Checks expiry against a fixed instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if now >= expires)
    }

    // == Time To Live ==
    /// Returns the remaining lifetime observed at `now`.
    ///
    /// # Returns
    /// - `Ttl::Remaining(Duration::ZERO)` if the TTL has elapsed
    /// - `Ttl::Remaining(left)` if the entry has TTL and hasn't expired
    /// - `Ttl::Forever` if the entry never expires
    pub fn ttl_remaining(&self, now: DateTime<Utc>) -> Ttl {
        remaining(self.expires_at, now)
    }

    // == Refresh ==
    /// Updates the heartbeat and pushes expiry out to `now + ttl`.
    ///
    /// Expiry is never shortened, and an entry without expiry stays without one.
    pub fn refresh(&mut self, ttl: Option<Duration>, now: DateTime<Utc>) {
        self.heartbeat = now;
        self.expires_at = extended(self.expires_at, deadline(now, ttl));
    }
}
