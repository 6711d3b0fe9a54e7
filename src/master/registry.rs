//! Live-worker bookkeeping and request routing.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::engine::Engine;

/// Concurrency-safe map from worker identity to its connection handle.
///
/// The lock covers only map access, never network I/O, so selection stays
/// cheap under concurrent request bursts. An empty selection is a retryable
/// routing condition for the caller, not a fault.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<String, Arc<Engine>>,
    cursor: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the worker, replacing any previous entry under the same id.
    pub fn register(&self, id: impl Into<String>, engine: Arc<Engine>) {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.insert(id.into(), engine);
    }

    /// Removes the worker if present; no-op otherwise.
    pub fn unregister(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.remove(id);
    }

    /// Picks a live worker for the next request, round-robin over the
    /// current pool. `None` when no workers are connected.
    pub fn select_worker(&self) -> Option<Arc<Engine>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.workers.is_empty() {
            return None;
        }
        let index = inner.cursor % inner.workers.len();
        inner.cursor = inner.cursor.wrapping_add(1);
        inner.workers.values().nth(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
