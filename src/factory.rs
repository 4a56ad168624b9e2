//! Cache Factory
//!
//! Builds the configured backend and hands it out behind the cache contract.

use std::sync::Arc;

use tracing::info;

use crate::cache::{Cache, CacheKey, CacheValue, MemoryStore};
use crate::config::{Config, Driver};
use crate::error::{CacheError, Result};
use crate::hasher::{Hasher, XxHasher};
use crate::persist::{KeyMode, PersistenceDriver, PersistentKey, PersistentStore, PersistentValue};

/// Constructs backends from configuration.
///
/// The hasher is passed down to persistent backends; persistent drivers need a
/// storage collaborator registered with [`CacheFactory::with_persistence`].
#[derive(Clone)]
pub struct CacheFactory {
    hasher: Arc<dyn Hasher>,
    persistence: Option<Arc<dyn PersistenceDriver>>,
}

impl CacheFactory {
    pub fn new(hasher: Arc<dyn Hasher>) -> Self {
        Self {
            hasher,
            persistence: None,
        }
    }

    /// Registers the storage collaborator used by persistent drivers.
    pub fn with_persistence(mut self, driver: Arc<dyn PersistenceDriver>) -> Self {
        self.persistence = Some(driver);
        self
    }

    /// Builds the backend named by `config.driver`.
    ///
    /// Keys and values must satisfy the persistent bounds whichever driver is
    /// configured; use [`CacheFactory::build_memory`] for values that cannot be
    /// serialized.
    ///
    /// Fails with a configuration error when the config is invalid, when the
    /// driver is not available, or when a persistent driver has no collaborator.
    pub fn build<K, V>(&self, config: &Config) -> Result<Box<dyn Cache<K, V>>>
    where
        K: PersistentKey,
        V: PersistentValue,
    {
        config.validate()?;

        let mode = match config.driver {
            Driver::Memory => return self.build_memory(config),
            Driver::PersistentFast => KeyMode::Fast,
            Driver::PersistentSafe => KeyMode::Safe,
            Driver::File | Driver::Remote => {
                return Err(CacheError::Configuration(format!(
                    "driver `{}` is not available",
                    config.driver
                )));
            }
        };

        let driver = self.persistence.clone().ok_or_else(|| {
            CacheError::Configuration(format!(
                "driver `{}` requires a persistence collaborator",
                config.driver
            ))
        })?;

        info!(
            "Building {:?}-mode persistent cache for identity {}",
            mode, config.identity
        );
        let store = PersistentStore::<K, V>::new(
            driver,
            self.hasher.clone(),
            config.identity.clone(),
            mode,
            &config.persistent,
        )?;
        Ok(Box::new(store))
    }

    /// Builds the in-memory backend, which places no serialization bounds on
    /// keys or values. Fails unless `config.driver` is [`Driver::Memory`].
    pub fn build_memory<K, V>(&self, config: &Config) -> Result<Box<dyn Cache<K, V>>>
    where
        K: CacheKey,
        V: CacheValue,
    {
        config.validate()?;
        if config.driver != Driver::Memory {
            return Err(CacheError::Configuration(format!(
                "driver `{}` is not the memory driver",
                config.driver
            )));
        }

        info!("Building memory cache for identity {}", config.identity);
        Ok(Box::new(MemoryStore::<K, V>::new(&config.memory)?))
    }
}

impl Default for CacheFactory {
    fn default() -> Self {
        Self::new(Arc::new(XxHasher::default()))
    }
}
