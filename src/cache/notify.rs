//! Expiry callback registration and dispatch.

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::debug;

use crate::cache::contract::OnExpired;

/// Holds the single expiry callback of a backend.
pub(crate) struct ExpiryNotifier<K> {
    callback: RwLock<Option<OnExpired<K>>>,
    enabled: bool,
}

impl<K> ExpiryNotifier<K>
where
    K: Send + 'static,
{
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            callback: RwLock::new(None),
            enabled,
        }
    }

    pub(crate) fn set(&self, callback: OnExpired<K>) {
        *self.callback.write() = Some(callback);
    }

    /// Fires the callback for `key` off the current thread.
    ///
    /// Inside a Tokio runtime the call goes to the blocking pool, otherwise to
    /// a detached thread. The lock is released before dispatch.
    pub(crate) fn notify(&self, key: K) {
        if !self.enabled {
            return;
        }
        let Some(callback) = self.callback.read().clone() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || callback(key));
            }
            Err(_) => {
                debug!("no runtime available, dispatching expiry callback on a thread");
                std::thread::spawn(move || callback(key));
            }
        }
    }
}
