//! TTL Reaper Task
//!
//! Background task that periodically removes expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// A backend that can purge its expired entries.
#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    /// Removes every entry expired as of now; returns how many were removed.
    async fn sweep_expired(&self) -> Result<usize>;
}

/// Handle to a running reaper. Dropping it cancels the task.
#[derive(Debug)]
pub struct Reaper {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Cancels the task and waits for it to exit. Idempotent.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!("Reaper task ended abnormally: {}", err);
            }
        }
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns a background task that sweeps `target` every `interval`.
///
/// The first sweep runs one full interval after spawning. Must be called from
/// within a Tokio runtime.
///
/// # Example
/// ```ignore
/// let mut reaper = spawn_reaper(store.clone(), Duration::from_secs(1));
/// // Later, during shutdown:
/// reaper.shutdown().await;
/// ```
pub fn spawn_reaper(target: Arc<dyn Sweep>, interval: Duration) -> Reaper {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    let handle = tokio::spawn(async move {
        info!("Starting TTL reaper with interval of {:?}", interval);

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match target.sweep_expired().await {
                Ok(0) => debug!("TTL reaper: no expired entries found"),
                Ok(removed) => info!("TTL reaper: removed {} expired entries", removed),
                Err(err) => warn!("TTL reaper: sweep failed: {}", err),
            }
        }

        debug!("TTL reaper stopped");
    });

    Reaper {
        token,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::{CacheError, PersistenceError};

    #[derive(Default)]
    struct CountingSweep {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Sweep for CountingSweep {
        async fn sweep_expired(&self) -> Result<usize> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    struct FailingSweep;

    #[async_trait]
    impl Sweep for FailingSweep {
        async fn sweep_expired(&self) -> Result<usize> {
            Err(CacheError::Persistence(PersistenceError::Unavailable(
                "offline".to_string(),
            )))
        }
    }

    #[tokio::test]
    async fn test_reaper_sweeps_periodically() {
        let target = Arc::new(CountingSweep::default());
        let mut reaper = spawn_reaper(target.clone(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(60)).await;
        reaper.shutdown().await;

        assert!(target.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_reaper_shutdown_is_deterministic() {
        let target = Arc::new(CountingSweep::default());
        let mut reaper = spawn_reaper(target.clone(), Duration::from_millis(10));

        reaper.shutdown().await;
        assert!(reaper.is_finished(), "Task should be finished after shutdown");

        let runs = target.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(target.runs.load(Ordering::SeqCst), runs);

        // second shutdown is a no-op
        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn test_reaper_survives_sweep_errors() {
        let mut reaper = spawn_reaper(Arc::new(FailingSweep), Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!reaper.is_finished());

        reaper.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_cancels_task() {
        let target = Arc::new(CountingSweep::default());
        let reaper = spawn_reaper(target.clone(), Duration::from_millis(10));
        drop(reaper);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let runs = target.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(target.runs.load(Ordering::SeqCst), runs);
    }
}
