//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror.

use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

/// Boxed error returned by caller-supplied value constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// == Persistence Error ==
/// Failure reported by a persistence collaborator.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The storage layer could not be reached
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The storage layer rejected or failed the operation
    #[error("Storage operation failed: {0}")]
    Operation(String),

    /// Any other driver-specific failure
    #[error(transparent)]
    Other(BoxError),
}

// == Cache Error Enum ==
/// Unified error type for cache operations and construction.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Configuration is inconsistent or incomplete
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Driver selector names no known backend
    #[error("Unknown cache driver: {0}")]
    UnknownDriver(String),

    /// A zero TTL was supplied
    #[error("Invalid TTL: a TTL must be greater than zero")]
    InvalidTtl,

    /// The constructor passed to `load_or_store_with` failed; nothing was stored
    #[error("Value construction failed: {0}")]
    Construction(#[source] BoxError),

    /// The persistence collaborator failed
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A value could not be encoded for storage
    #[error("Serialization error: {0}")]
    Serialization(#[from] EncodeError),

    /// A stored payload could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] DecodeError),

    /// The backend cannot perform this operation in its current mode
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
