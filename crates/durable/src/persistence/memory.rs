//! In-memory implementation of EventLogStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::store::*;
use crate::workflow::HistoryEvent;

/// One run's metadata and log
struct RunState {
    record: ExecutionRecord,
    events: Vec<HistoryEvent>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, RunState>,
    current: HashMap<String, Uuid>,
}

/// In-memory implementation of EventLogStore
///
/// Stores everything behind a single lock and provides the same semantics
/// as the PostgreSQL implementation. Shared between engines through an
/// `Arc`, it survives an engine being dropped, which is how tests simulate
/// a worker crash.
///
/// # Example
///
/// ```
/// use keel_durable::InMemoryEventLogStore;
///
/// let store = InMemoryEventLogStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryEventLogStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventLogStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of runs (open and closed)
    pub fn run_count(&self) -> usize {
        self.inner.read().runs.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.runs.clear();
        inner.current.clear();
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventLogStore {
    async fn create_execution(&self, new: NewExecution) -> Result<ExecutionRecord, StoreError> {
        let mut inner = self.inner.write();

        if let Some(run_id) = inner.current.get(&new.execution_id) {
            if let Some(run) = inner.runs.get(run_id) {
                if !run.record.status.is_closed() {
                    return Err(StoreError::AlreadyStarted {
                        execution_id: new.execution_id,
                        run_id: *run_id,
                    });
                }
            }
        }
        if inner.runs.contains_key(&new.run_id) {
            return Err(StoreError::InvalidSequence(format!(
                "run {} already exists",
                new.run_id
            )));
        }

        let status = validate_batch(0, &new.events)?;
        let record = ExecutionRecord {
            execution_id: new.execution_id.clone(),
            run_id: new.run_id,
            workflow_type: new.workflow_type,
            task_queue: new.task_queue,
            status: status.unwrap_or(ExecutionStatus::Running),
            last_sequence: new.events.len() as u64,
            created_at: new.created_at,
            closed_at: status.map(|_| new.created_at),
        };

        inner.runs.insert(
            new.run_id,
            RunState {
                record: record.clone(),
                events: new.events,
            },
        );
        inner.current.insert(new.execution_id, new.run_id);

        debug!(execution_id = %record.execution_id, run_id = %record.run_id, "created run");
        Ok(record)
    }

    async fn append(
        &self,
        run_id: Uuid,
        expected_tail: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        if run.record.status.is_closed() {
            return Err(StoreError::ExecutionClosed(run_id));
        }
        if run.record.last_sequence != expected_tail {
            return Err(StoreError::Conflict {
                expected: expected_tail,
                actual: run.record.last_sequence,
            });
        }

        let closed = validate_batch(expected_tail, &events)?;
        if let Some(status) = closed {
            run.record.status = status;
            run.record.closed_at = events.last().map(|e| e.recorded_at);
        }
        run.record.last_sequence += events.len() as u64;
        run.events.extend(events);

        Ok(run.record.last_sequence)
    }

    async fn read(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<HistoryEvent>, StoreError> {
        let inner = self.inner.read();
        let run = inner
            .runs
            .get(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        Ok(run
            .events
            .iter()
            .filter(|e| e.sequence >= from_seq)
            .cloned()
            .collect())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        self.inner
            .read()
            .runs
            .get(&run_id)
            .map(|run| run.record.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn current_run(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
        let inner = self.inner.read();
        inner
            .current
            .get(execution_id)
            .and_then(|run_id| inner.runs.get(run_id))
            .map(|run| run.record.clone())
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))
    }

    async fn list_open_runs(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        let inner = self.inner.read();
        let mut open: Vec<ExecutionRecord> = inner
            .runs
            .values()
            .filter(|run| !run.record.status.is_closed())
            .map(|run| run.record.clone())
            .collect();
        open.sort_by_key(|record| record.run_id);
        Ok(open)
    }

    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();

        let expired: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|run| run.record.closed_at.is_some_and(|at| at < cutoff))
            .map(|run| run.record.run_id)
            .collect();

        for run_id in &expired {
            if let Some(run) = inner.runs.remove(run_id) {
                if inner.current.get(&run.record.execution_id) == Some(run_id) {
                    inner.current.remove(&run.record.execution_id);
                }
            }
        }

        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowEvent;
    use serde_json::json;
    use std::sync::Arc;

    fn new_execution(execution_id: &str) -> NewExecution {
        let now = Utc::now();
        NewExecution {
            execution_id: execution_id.to_string(),
            run_id: Uuid::now_v7(),
            workflow_type: "test".to_string(),
            task_queue: "default".to_string(),
            created_at: now,
            events: HistoryEvent::batch(
                0,
                now,
                vec![
                    WorkflowEvent::ExecutionStarted {
                        workflow_type: "test".to_string(),
                        input: json!({}),
                        task_queue: "default".to_string(),
                        execution_timeout_ms: None,
                        continued_from: None,
                    },
                    WorkflowEvent::WorkflowTaskScheduled {
                        task_queue: "default".to_string(),
                        attempt: 1,
                    },
                ],
            ),
        }
    }

    fn timer_fired(tail: u64, id: &str) -> Vec<HistoryEvent> {
        HistoryEvent::batch(
            tail,
            Utc::now(),
            vec![WorkflowEvent::TimerFired {
                timer_id: id.to_string(),
            }],
        )
    }

    fn completed(tail: u64) -> Vec<HistoryEvent> {
        HistoryEvent::batch(
            tail,
            Utc::now(),
            vec![WorkflowEvent::ExecutionCompleted { result: json!(1) }],
        )
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let store = InMemoryEventLogStore::new();
        let record = store.create_execution(new_execution("e1")).await.unwrap();

        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.last_sequence, 2);

        let events = store.read(record.run_id, 1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(store.read(record.run_id, 2).await.unwrap().len(), 1);
        assert_eq!(store.current_run("e1").await.unwrap().run_id, record.run_id);
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected_while_open() {
        let store = InMemoryEventLogStore::new();
        let first = store.create_execution(new_execution("e1")).await.unwrap();

        let err = store.create_execution(new_execution("e1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyStarted { run_id, .. } if run_id == first.run_id));

        store.append(first.run_id, 2, completed(2)).await.unwrap();
        let second = store.create_execution(new_execution("e1")).await.unwrap();
        assert_ne!(second.run_id, first.run_id);
        assert_eq!(store.current_run("e1").await.unwrap().run_id, second.run_id);
    }

    #[tokio::test]
    async fn test_append_conflict() {
        let store = InMemoryEventLogStore::new();
        let run = store.create_execution(new_execution("e1")).await.unwrap();

        assert_eq!(store.append(run.run_id, 2, timer_fired(2, "a")).await.unwrap(), 3);

        let err = store.append(run.run_id, 2, timer_fired(2, "b")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn test_terminal_event_closes_run() {
        let store = InMemoryEventLogStore::new();
        let run = store.create_execution(new_execution("e1")).await.unwrap();

        store.append(run.run_id, 2, completed(2)).await.unwrap();
        let record = store.get_run(run.run_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.closed_at.is_some());

        let err = store.append(run.run_id, 3, timer_fired(3, "late")).await.unwrap_err();
        assert!(matches!(err, StoreError::ExecutionClosed(_)));
        assert!(store.list_open_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_exactly_one_wins() {
        let store = Arc::new(InMemoryEventLogStore::new());
        let run_id = store.create_execution(new_execution("e1")).await.unwrap().run_id;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append(run_id, 2, timer_fired(2, &format!("t{i}")))
                    .await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(StoreError::Conflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 15);
    }

    #[tokio::test]
    async fn test_purge_closed_before() {
        let store = InMemoryEventLogStore::new();
        let open = store.create_execution(new_execution("open")).await.unwrap();
        let done = store.create_execution(new_execution("done")).await.unwrap();
        store.append(done.run_id, 2, completed(2)).await.unwrap();

        let purged = store
            .purge_closed_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(store.get_run(open.run_id).await.is_ok());
        assert!(matches!(
            store.current_run("done").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
