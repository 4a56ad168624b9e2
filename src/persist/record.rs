//! Persistent Record Schema
//!
//! Row layout and primary-key encodings shared by the persistent store and its drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hasher::Hasher;

// == Key Mode ==
/// How the cache key participates in the primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMode {
    /// `(instance digest, key digest)`: compact, but colliding keys share a row
    Fast,
    /// `(instance digest, raw key)`: exact, larger index
    Safe,
}

// == Primary Key ==
/// Composite primary key of a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    Fast { instance_hash: u64, key_hash: u64 },
    Safe { instance_hash: u64, cache_key: String },
}

impl PrimaryKey {
    /// Encodes `cache_key` of the instance `instance_hash` under `mode`.
    pub fn encode(mode: KeyMode, hasher: &dyn Hasher, instance_hash: u64, cache_key: &str) -> Self {
        match mode {
            KeyMode::Fast => PrimaryKey::Fast {
                instance_hash,
                key_hash: hasher.digest(cache_key),
            },
            KeyMode::Safe => PrimaryKey::Safe {
                instance_hash,
                cache_key: cache_key.to_string(),
            },
        }
    }

    pub fn instance_hash(&self) -> u64 {
        match self {
            PrimaryKey::Fast { instance_hash, .. } | PrimaryKey::Safe { instance_hash, .. } => {
                *instance_hash
            }
        }
    }
}

// == Partition ==
/// The rows of one identity under one key mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub mode: KeyMode,
    pub instance_hash: u64,
}

impl Partition {
    pub fn contains(&self, key: &PrimaryKey) -> bool {
        let mode = match key {
            PrimaryKey::Fast { .. } => KeyMode::Fast,
            PrimaryKey::Safe { .. } => KeyMode::Safe,
        };
        mode == self.mode && key.instance_hash() == self.instance_hash
    }
}

// == Stored Record ==
/// One persisted cache row. The raw key is always kept, so fast-mode reads can
/// verify it after a digest match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Identity the row belongs to
    pub instance_id: String,
    /// Raw cache key
    pub cache_key: String,
    /// Opaque serialized value
    pub value: Vec<u8>,
    /// Expiration timestamp, None = no expiration
    pub expires_at: Option<DateTime<Utc>>,
    /// When the row was written
    pub created_at: DateTime<Utc>,
    /// Last write or refresh (the heartbeat)
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if now >= expires)
    }

    /// True when the row is live at `now` and belongs to `cache_key`.
    pub fn is_live_for(&self, cache_key: &str, now: DateTime<Utc>) -> bool {
        self.cache_key == cache_key && !self.is_expired_at(now)
    }
}

// == Key Pattern ==
/// Raw-key match used by prefix and suffix deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Prefix(String),
    Suffix(String),
}

impl KeyPattern {
    pub fn matches(&self, cache_key: &str) -> bool {
        match self {
            KeyPattern::Prefix(prefix) => cache_key.starts_with(prefix.as_str()),
            KeyPattern::Suffix(suffix) => cache_key.ends_with(suffix.as_str()),
        }
    }
}
