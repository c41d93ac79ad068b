//! Engine errors

use uuid::Uuid;

use super::registry::RegistryError;
use crate::persistence::StoreError;
use crate::workflow::WorkflowError;

/// Errors from the client and worker API
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Another writer appended first; re-read and retry
    #[error("append conflict: expected tail {expected}, actual {actual}")]
    Conflict { expected: u64, actual: u64 },

    /// Workflow code diverged from its recorded history
    #[error("non-determinism in run {run_id} at sequence {sequence}: {detail}")]
    NonDeterminism {
        run_id: Uuid,
        sequence: u64,
        detail: String,
    },

    /// Replay could not run to the end of history
    #[error("replay failed: {0}")]
    ReplayFailed(String),

    /// No worker holds the execution loaded; retry later
    #[error("execution not loaded: {0}")]
    Unavailable(String),

    /// The query handler returned an error
    #[error("query failed: {0}")]
    Query(WorkflowError),

    /// No such execution
    #[error("execution not found: {0}")]
    NotFound(String),

    /// No such task, or it was already completed
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// The run closed while the operation was in flight
    #[error("run is closed: {0}")]
    RunClosed(Uuid),

    /// The execution's current run is still open
    #[error("execution already started: {0}")]
    AlreadyStarted(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { expected, actual } => Self::Conflict { expected, actual },
            StoreError::NotFound(execution_id) => Self::NotFound(execution_id),
            StoreError::AlreadyStarted { execution_id, .. } => Self::AlreadyStarted(execution_id),
            StoreError::ExecutionClosed(run_id) => Self::RunClosed(run_id),
            other => Self::Store(other),
        }
    }
}

impl EngineError {
    /// Whether retrying the same call can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}
