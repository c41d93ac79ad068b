//! Loaded-execution cache
//!
//! Holds the workflow instance of recently advanced executions so queries
//! can be answered without touching history. Bounded; the oldest entry is
//! evicted first.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use uuid::Uuid;

use super::registry::AnyWorkflow;

struct Loaded {
    run_id: Uuid,
    tail: u64,
    instance: Box<dyn AnyWorkflow>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Loaded>,
    order: VecDeque<String>,
}

/// Bounded map of execution ID to its loaded workflow instance
pub struct ExecutionCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ExecutionCache {
    /// Create a cache holding at most `capacity` executions
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Store the instance for an execution, replacing any older one
    pub fn insert(&self, execution_id: &str, run_id: Uuid, tail: u64, instance: Box<dyn AnyWorkflow>) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get(execution_id) {
            // an older task finishing late must not replace a newer instance
            if existing.run_id == run_id && existing.tail > tail {
                return;
            }
        }

        let loaded = Loaded {
            run_id,
            tail,
            instance,
        };
        if inner.entries.insert(execution_id.to_string(), loaded).is_some() {
            inner.order.retain(|id| id != execution_id);
        }
        inner.order.push_back(execution_id.to_string());

        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    /// Run `f` against the loaded instance, if any
    pub fn query<R>(&self, execution_id: &str, f: impl FnOnce(&dyn AnyWorkflow) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(execution_id)
            .map(|loaded| f(loaded.instance.as_ref()))
    }

    /// Run and tail of the loaded instance
    pub fn position(&self, execution_id: &str) -> Option<(Uuid, u64)> {
        self.inner
            .lock()
            .entries
            .get(execution_id)
            .map(|loaded| (loaded.run_id, loaded.tail))
    }

    /// Drop an execution
    pub fn remove(&self, execution_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(execution_id).is_some();
        if removed {
            inner.order.retain(|id| id != execution_id);
        }
        removed
    }

    /// Number of loaded executions
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if nothing is loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ExecutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCache")
            .field("capacity", &self.capacity)
            .field("loaded", &self.len())
            .finish()
    }
}
