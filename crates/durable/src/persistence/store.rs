//! EventLogStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{HistoryEvent, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No run exists for the execution ID
    #[error("execution not found: {0}")]
    NotFound(String),

    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// The execution's current run is still open
    #[error("execution already started: {execution_id} (run {run_id})")]
    AlreadyStarted { execution_id: String, run_id: Uuid },

    /// Optimistic concurrency check failed
    #[error("append conflict: expected tail {expected}, actual {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// The run already recorded a terminal event
    #[error("run is closed: {0}")]
    ExecutionClosed(Uuid),

    /// The batch does not continue the log correctly
    #[error("invalid event batch: {0}")]
    InvalidSequence(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Run is open
    Running,

    /// Run completed successfully
    Completed,

    /// Run failed
    Failed,

    /// Run was cancelled
    Cancelled,

    /// Run hit its execution timeout
    TimedOut,

    /// Run handed over to a new run
    Continued,
}

impl ExecutionStatus {
    /// Status a terminal event closes a run with
    pub fn closed_by(event: &WorkflowEvent) -> Option<Self> {
        match event {
            WorkflowEvent::ExecutionCompleted { .. } => Some(Self::Completed),
            WorkflowEvent::ExecutionFailed { .. } => Some(Self::Failed),
            WorkflowEvent::ExecutionCancelled { .. } => Some(Self::Cancelled),
            WorkflowEvent::ExecutionTimedOut => Some(Self::TimedOut),
            WorkflowEvent::ExecutionContinuedAsNew { .. } => Some(Self::Continued),
            _ => None,
        }
    }

    /// Check if the run is closed
    pub fn is_closed(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Continued => "continued",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            "continued" => Ok(Self::Continued),
            other => Err(StoreError::Serialization(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// Metadata of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Client-supplied execution ID
    pub execution_id: String,

    /// Run ID
    pub run_id: Uuid,

    /// Registered workflow type
    pub workflow_type: String,

    /// Queue workflow tasks are dispatched on
    pub task_queue: String,

    /// Current status
    pub status: ExecutionStatus,

    /// Sequence of the last event in the log
    pub last_sequence: u64,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// When the run closed
    pub closed_at: Option<DateTime<Utc>>,
}

/// A run to create, with its opening events
#[derive(Debug, Clone)]
pub struct NewExecution {
    /// Client-supplied execution ID
    pub execution_id: String,

    /// Run ID
    pub run_id: Uuid,

    /// Registered workflow type
    pub workflow_type: String,

    /// Queue workflow tasks are dispatched on
    pub task_queue: String,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Opening events, starting at sequence 1
    pub events: Vec<HistoryEvent>,
}

/// Append-only, per-run event log
///
/// This trait abstracts the persistence layer. The only durability
/// requirement is a conditional append and an ordered read: an append
/// succeeds only when the caller's `expected_tail` matches the log's
/// actual last sequence, so concurrent writers to one run cannot both win.
///
/// Runs are grouped by execution ID. Each execution has exactly one
/// current run; a new run can be created once the current one is closed.
#[async_trait]
pub trait EventLogStore: Send + Sync + 'static {
    /// Create a run and make it the execution's current run
    ///
    /// Fails with [`StoreError::AlreadyStarted`] if the current run is open.
    async fn create_execution(&self, new: NewExecution) -> Result<ExecutionRecord, StoreError>;

    /// Append events after `expected_tail`, returning the new tail
    async fn append(
        &self,
        run_id: Uuid,
        expected_tail: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<u64, StoreError>;

    /// Read events with `sequence >= from_seq`, in order
    async fn read(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Get a run's metadata
    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRecord, StoreError>;

    /// Get the current run of an execution
    async fn current_run(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError>;

    /// List every run that is still open
    async fn list_open_runs(&self) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Delete runs (and their events) closed before `cutoff`
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Check that `events` continue a log whose tail is `tail`
///
/// Returns the status the batch closes the run with, if any. A terminal
/// event must be the last one in the batch.
pub(crate) fn validate_batch(
    tail: u64,
    events: &[HistoryEvent],
) -> Result<Option<ExecutionStatus>, StoreError> {
    if events.is_empty() {
        return Err(StoreError::InvalidSequence("empty batch".to_string()));
    }

    let mut closed = None;
    for (offset, event) in events.iter().enumerate() {
        let expected = tail + offset as u64 + 1;
        if event.sequence != expected {
            return Err(StoreError::InvalidSequence(format!(
                "expected sequence {expected}, got {}",
                event.sequence
            )));
        }
        if closed.is_some() {
            return Err(StoreError::InvalidSequence(format!(
                "event {} follows a terminal event",
                event.sequence
            )));
        }
        closed = ExecutionStatus::closed_by(&event.event);
    }

    Ok(closed)
}
