//! Single-flight gates for lazy value construction.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Per-key in-flight markers. Callers racing on one key are serialised on the
/// same gate, so the first one builds the value and the rest observe it.
#[derive(Debug)]
pub(crate) struct SingleFlight<Q>
where
    Q: Eq + Hash,
{
    gates: DashMap<Q, Arc<Mutex<()>>>,
}

impl<Q> SingleFlight<Q>
where
    Q: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            gates: DashMap::new(),
        }
    }

    /// Runs `section` while holding the gate for `key`.
    ///
    /// The marker is dropped once its last holder finishes or is cancelled;
    /// callers already queued on it still run their section one at a time.
    pub(crate) async fn run<T, F, Fut>(&self, key: Q, section: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut held = Held {
            gates: &self.gates,
            key: key.clone(),
            gate: None,
        };
        let gate = self
            .gates
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        held.gate = Some(gate.clone());

        let _permit = gate.lock_owned().await;
        section().await
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.gates.len()
    }
}

/// Releases the marker on drop, including when the caller's future is cancelled.
struct Held<'a, Q>
where
    Q: Eq + Hash,
{
    gates: &'a DashMap<Q, Arc<Mutex<()>>>,
    key: Q,
    gate: Option<Arc<Mutex<()>>>,
}

impl<Q> Drop for Held<'_, Q>
where
    Q: Eq + Hash,
{
    fn drop(&mut self) {
        let Some(gate) = self.gate.take() else {
            return;
        };
        let ptr = Arc::as_ptr(&gate);
        drop(gate);
        // only the map still owns the marker once nobody holds or awaits it
        self.gates.remove_if(&self.key, |_, current| {
            Arc::as_ptr(current) == ptr && Arc::strong_count(current) == 1
        });
    }
}
