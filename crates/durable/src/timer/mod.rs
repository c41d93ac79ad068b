//! Durable timer service
//!
//! Timers live in a min-heap keyed by fire time. The heap itself is not
//! persisted: every entry corresponds to an event in some run's history
//! (`TimerStarted`, a retry delay recorded with `ActivityAttemptFailed`,
//! an execution timeout recorded with `ExecutionStarted`), so the heap is
//! rebuilt from history on recovery.
//!
//! Cancellation is lazy: cancelled entries are dropped from the index and
//! skipped when they reach the top of the heap. Once dead slots outnumber
//! live timers two to one the heap is rebuilt from the index.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

/// Below this many heap slots cancelled entries are left for lazy removal
const COMPACT_MIN_SLOTS: usize = 64;

/// What a timer does when it fires
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// A workflow timer: appends `TimerFired`
    Workflow {
        /// Timer ID chosen by the workflow
        timer_id: String,
    },

    /// Backoff before the next activity attempt
    ActivityRetry {
        /// Activity ID
        activity_id: String,
        /// Attempt to dispatch
        attempt: u32,
    },

    /// Backoff before rescheduling a failed workflow task
    WorkflowTaskRetry {
        /// Attempt to schedule
        attempt: u32,
    },

    /// Overall deadline of a run
    ExecutionTimeout,
}

/// A scheduled timer
#[derive(Debug, Clone, PartialEq)]
pub struct TimerEntry {
    /// Timer ID
    pub id: Uuid,

    /// Owning execution
    pub execution_id: String,

    /// Owning run
    pub run_id: Uuid,

    /// When the timer fires
    pub fire_at: DateTime<Utc>,

    /// Action on fire
    pub kind: TimerKind,

    /// Sequence of the event that created the timer
    pub created_by: u64,
}

impl TimerEntry {
    /// Create a timer entry
    pub fn new(
        execution_id: impl Into<String>,
        run_id: Uuid,
        kind: TimerKind,
        fire_at: DateTime<Utc>,
        created_by: u64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id: execution_id.into(),
            run_id,
            fire_at,
            kind,
            created_by,
        }
    }
}

#[derive(Default)]
struct TimerHeap {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>,
    entries: HashMap<Uuid, TimerEntry>,
}

impl TimerHeap {
    fn drop_cancelled_top(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.entries.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }

    fn compact_if_sparse(&mut self) {
        if self.heap.len() <= COMPACT_MIN_SLOTS || self.heap.len() <= 2 * self.entries.len() {
            return;
        }
        self.heap = self
            .entries
            .values()
            .map(|entry| Reverse((entry.fire_at, entry.id)))
            .collect();
    }
}

/// Min-heap of pending timers
#[derive(Default)]
pub struct TimerService {
    inner: Mutex<TimerHeap>,
    changed: Notify,
}

impl TimerService {
    /// Create an empty timer service
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer, returning its ID
    pub fn start_timer(&self, entry: TimerEntry) -> Uuid {
        let id = entry.id;
        {
            let mut inner = self.inner.lock();
            inner.heap.push(Reverse((entry.fire_at, id)));
            inner.entries.insert(id, entry);
        }
        self.changed.notify_one();
        id
    }

    /// Cancel a timer; a no-op if it already fired
    pub fn cancel_timer(&self, timer_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(&timer_id).is_some();
        inner.compact_if_sparse();
        removed
    }

    /// Cancel every timer matching `predicate`
    pub fn cancel_where(&self, predicate: impl Fn(&TimerEntry) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !predicate(entry));
        inner.compact_if_sparse();
        before - inner.entries.len()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<TimerEntry> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();

        while let Some(Reverse((fire_at, id))) = inner.heap.peek().copied() {
            if fire_at > now {
                break;
            }
            inner.heap.pop();
            if let Some(entry) = inner.entries.remove(&id) {
                due.push(entry);
            }
        }

        due
    }

    /// Fire time of the earliest live timer
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.lock();
        inner.drop_cancelled_top();
        inner.heap.peek().map(|Reverse((fire_at, _))| *fire_at)
    }

    /// Check if a matching timer is pending
    pub fn contains(&self, predicate: impl Fn(&TimerEntry) -> bool) -> bool {
        self.inner.lock().entries.values().any(predicate)
    }

    /// Number of live timers
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if no timers are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next `start_timer`
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("pending", &self.len())
            .finish()
    }
}
