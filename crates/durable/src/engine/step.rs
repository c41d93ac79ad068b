//! Values passed between the engine and its callers

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use super::registry::AnyWorkflow;
use crate::activity::ActivityOutcome;
use crate::workflow::{WorkflowAction, WorkflowError};

/// What advancing a run decided
#[derive(Debug, Clone, PartialEq)]
pub enum StepDecision {
    /// Record these commands (possibly none)
    Commands {
        commands: Vec<WorkflowAction>,
        markers: Vec<(String, i32)>,
    },

    /// The handler panicked; fail the workflow task and retry it
    TaskFailed { cause: String },

    /// Close the run as failed (non-determinism, history limit)
    FailExecution { error: WorkflowError },

    /// The run is already closed; nothing to do
    AlreadyClosed,
}

/// Result of [`Engine::advance`](super::Engine::advance)
pub struct WorkflowStep {
    /// Execution ID
    pub execution_id: String,

    /// Run that was replayed
    pub run_id: Uuid,

    /// Tail the step was computed against
    pub tail: u64,

    /// Attempt number of this workflow task
    pub task_attempt: u32,

    /// What to record
    pub decision: StepDecision,

    /// Replayed instance, kept loaded for queries once committed
    pub instance: Option<Box<dyn AnyWorkflow>>,
}

impl WorkflowStep {
    /// Commands this step would record
    pub fn commands(&self) -> &[WorkflowAction] {
        match &self.decision {
            StepDecision::Commands { commands, .. } => commands,
            _ => &[],
        }
    }

    /// Query the replayed instance
    pub fn query(&self, name: &str, args: &Value) -> Option<Result<Value, WorkflowError>> {
        self.instance.as_ref().map(|instance| instance.query(name, args))
    }
}

impl fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("execution_id", &self.execution_id)
            .field("run_id", &self.run_id)
            .field("tail", &self.tail)
            .field("task_attempt", &self.task_attempt)
            .field("decision", &self.decision)
            .field("loaded", &self.instance.is_some())
            .finish()
    }
}

/// Outcome reported to [`Engine::complete_task`](super::Engine::complete_task)
#[derive(Debug)]
pub enum TaskOutcome {
    /// A workflow task's step, from `advance`
    Workflow(WorkflowStep),

    /// An activity attempt's outcome
    Activity(ActivityOutcome),
}

/// Terminal outcome of an execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Completed with a result
    Completed(Value),

    /// Failed with an error
    Failed(WorkflowError),

    /// Cancelled on request
    Cancelled { reason: String },

    /// Ran past its execution timeout
    TimedOut,
}

impl ExecutionOutcome {
    /// Result value, if completed
    pub fn into_result(self) -> Result<Value, Self> {
        match self {
            Self::Completed(value) => Ok(value),
            other => Err(other),
        }
    }
}

/// Options for starting an execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions {
    /// Queue for workflow tasks (defaults to the engine's default queue)
    pub task_queue: Option<String>,

    /// Overall deadline for each run
    pub execution_timeout: Option<Duration>,
}

impl StartOptions {
    /// Route workflow tasks to a queue
    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_queue = Some(queue.into());
        self
    }

    /// Set the execution timeout
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}
