//! Long-poll task matching with lease-based redelivery

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use super::Task;
use crate::clock::{self, Clock, SystemClock};

/// Pending tasks and blocked pollers of one queue
#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    waiters: VecDeque<oneshot::Sender<Task>>,
}

/// A task handed to a poller and not yet acknowledged
#[derive(Debug, Clone)]
struct Lease {
    task: Task,
    deadline: DateTime<Utc>,
}

/// Pairs enqueued tasks with long-polling workers
///
/// Queues spring into existence on first use. A task that finds a blocked
/// poller goes straight to the longest-waiting one; otherwise it waits in
/// FIFO order for the next poll. Handed-off tasks stay leased until
/// [`ack`](Self::ack)ed, and [`reclaim_expired`](Self::reclaim_expired) makes
/// any task whose lease ran out pollable again.
pub struct TaskMatcher {
    queues: DashMap<String, Arc<Mutex<QueueState>>>,
    leases: DashMap<Uuid, Lease>,
    clock: Arc<dyn Clock>,
}

impl TaskMatcher {
    /// Create a matcher using the system clock for lease deadlines
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a matcher with an explicit clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: DashMap::new(),
            leases: DashMap::new(),
            clock,
        }
    }

    fn queue(&self, name: &str) -> Arc<Mutex<QueueState>> {
        if let Some(state) = self.queues.get(name) {
            return Arc::clone(&state);
        }
        Arc::clone(&self.queues.entry(name.to_string()).or_default())
    }

    fn lease(&self, mut task: Task) -> Task {
        task.deliveries += 1;
        let deadline = clock::add(self.clock.now(), task.lease);
        self.leases.insert(
            task.id,
            Lease {
                task: task.clone(),
                deadline,
            },
        );
        task
    }

    /// Make a task available on its queue
    pub fn enqueue(&self, task: Task) {
        let state = self.queue(&task.queue);
        let mut state = state.lock();
        let mut task = task;

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            let leased = self.lease(task);
            let id = leased.id;
            match waiter.send(leased) {
                Ok(()) => {
                    trace!(task_id = %id, "handed task to waiting poller");
                    return;
                }
                Err(returned) => {
                    self.leases.remove(&id);
                    task = returned;
                    task.deliveries = task.deliveries.saturating_sub(1);
                }
            }
        }

        state.pending.push_back(task);
    }

    /// Wait up to `timeout` for a task on `queue`
    ///
    /// Returns `None` when nothing arrived in time.
    pub async fn poll(&self, queue: &str, timeout: Duration) -> Option<Task> {
        let (tx, mut rx) = oneshot::channel();
        {
            let state = self.queue(queue);
            let mut state = state.lock();
            if let Some(task) = state.pending.pop_front() {
                return Some(self.lease(task));
            }
            state.waiters.retain(|w| !w.is_closed());
            state.waiters.push_back(tx);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(task)) => Some(task),
            Ok(Err(_)) => None,
            Err(_) => {
                // A task may have been handed over between the deadline and close()
                rx.close();
                rx.try_recv().ok()
            }
        }
    }

    /// Acknowledge a handed-off task, removing it for good
    pub fn ack(&self, task_id: Uuid) -> Option<Task> {
        self.leases.remove(&task_id).map(|(_, lease)| lease.task)
    }

    /// Push a leased task's deadline out to `now + by`
    pub fn extend(&self, task_id: Uuid, by: Duration) -> bool {
        match self.leases.get_mut(&task_id) {
            Some(mut lease) => {
                lease.deadline = clock::add(self.clock.now(), by);
                true
            }
            None => false,
        }
    }

    /// Return a leased task to its queue right away
    pub fn release(&self, task_id: Uuid) -> bool {
        match self.leases.remove(&task_id) {
            Some((_, lease)) => {
                self.enqueue(lease.task);
                true
            }
            None => false,
        }
    }

    /// Drop a task whether it is pending or leased
    pub fn cancel(&self, queue: &str, task_id: Uuid) -> bool {
        let leased = self.leases.remove(&task_id).is_some();
        let state = self.queue(queue);
        let mut state = state.lock();
        let before = state.pending.len();
        state.pending.retain(|t| t.id != task_id);
        leased || state.pending.len() != before
    }

    /// Requeue every task whose lease expired at `now`
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Uuid> = self
            .leases
            .iter()
            .filter(|lease| lease.deadline <= now)
            .map(|lease| *lease.key())
            .collect();

        let mut reclaimed = 0;
        for task_id in expired {
            if let Some((_, lease)) = self.leases.remove_if(&task_id, |_, l| l.deadline <= now) {
                debug!(%task_id, queue = %lease.task.queue, "lease expired, redelivering task");
                self.enqueue(lease.task);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Check if a task is currently handed out
    pub fn is_leased(&self, task_id: Uuid) -> bool {
        self.leases.contains_key(&task_id)
    }

    /// Number of tasks waiting on a queue
    pub fn pending_len(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|state| state.lock().pending.len())
            .unwrap_or(0)
    }

    /// Number of tasks handed out and not yet acknowledged
    pub fn leased_len(&self) -> usize {
        self.leases.len()
    }
}

impl Default for TaskMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMatcher")
            .field("queues", &self.queues.len())
            .field("leases", &self.leases.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::matcher::TaskKind;

    fn workflow_task(queue: &str) -> Task {
        Task::new(
            queue,
            "exec-1",
            Uuid::now_v7(),
            TaskKind::Workflow { attempt: 1 },
            Utc::now(),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_with_none() {
        let matcher = TaskMatcher::new();
        assert!(matcher.poll("q", Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test]
    async fn test_pending_task_is_returned_immediately() {
        let matcher = TaskMatcher::new();
        let task = workflow_task("q");
        let id = task.id;
        matcher.enqueue(task);

        let polled = matcher.poll("q", Duration::from_secs(1)).await.unwrap();
        assert_eq!(polled.id, id);
        assert_eq!(polled.deliveries, 1);
        assert!(matcher.is_leased(id));
        assert_eq!(matcher.pending_len("q"), 0);
    }

    #[tokio::test]
    async fn test_waiting_pollers_share_tasks() {
        let matcher = Arc::new(TaskMatcher::new());

        let mut pollers = Vec::new();
        for _ in 0..2 {
            let matcher = Arc::clone(&matcher);
            pollers.push(tokio::spawn(async move {
                matcher.poll("q", Duration::from_secs(30)).await
            }));
        }
        // let both pollers register
        while matcher.queue("q").lock().waiters.len() < 2 {
            tokio::task::yield_now().await;
        }

        let first = workflow_task("q");
        let second = workflow_task("q");
        let mut expected = vec![first.id, second.id];
        matcher.enqueue(first);
        matcher.enqueue(second);

        let mut got = Vec::new();
        for poller in pollers {
            got.push(poller.await.unwrap().unwrap().id);
        }
        got.sort();
        expected.sort();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let matcher = TaskMatcher::new();
        matcher.enqueue(workflow_task("a"));

        assert!(matcher.poll("b", Duration::from_millis(10)).await.is_none());
        assert!(matcher.poll("a", Duration::from_millis(10)).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let clock = ManualClock::new();
        let matcher = TaskMatcher::with_clock(Arc::new(clock.clone()));
        let task = workflow_task("q");
        let id = task.id;
        matcher.enqueue(task);

        let first = matcher.poll("q", Duration::from_secs(1)).await.unwrap();
        assert_eq!(matcher.reclaim_expired(clock.now()), 0);

        clock.advance(Duration::from_secs(11));
        assert_eq!(matcher.reclaim_expired(clock.now()), 1);

        let again = matcher.poll("q", Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.id, id);
        assert_eq!(again.deliveries, 2);
    }

    #[tokio::test]
    async fn test_acked_task_is_not_redelivered() {
        let clock = ManualClock::new();
        let matcher = TaskMatcher::with_clock(Arc::new(clock.clone()));
        matcher.enqueue(workflow_task("q"));

        let task = matcher.poll("q", Duration::from_secs(1)).await.unwrap();
        assert!(matcher.ack(task.id).is_some());

        clock.advance(Duration::from_secs(60));
        assert_eq!(matcher.reclaim_expired(clock.now()), 0);
        assert!(matcher.poll("q", Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_extend_keeps_lease_alive() {
        let clock = ManualClock::new();
        let matcher = TaskMatcher::with_clock(Arc::new(clock.clone()));
        matcher.enqueue(workflow_task("q"));
        let task = matcher.poll("q", Duration::from_secs(1)).await.unwrap();

        clock.advance(Duration::from_secs(8));
        assert!(matcher.extend(task.id, Duration::from_secs(10)));
        clock.advance(Duration::from_secs(8));

        assert_eq!(matcher.reclaim_expired(clock.now()), 0);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let matcher = TaskMatcher::new();
        let task = workflow_task("q");
        let id = task.id;
        matcher.enqueue(task);

        assert!(matcher.cancel("q", id));
        assert_eq!(matcher.pending_len("q"), 0);
        assert!(!matcher.cancel("q", id));
    }
}
