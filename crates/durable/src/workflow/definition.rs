//! The `Workflow` trait and its error type

use serde::{de::DeserializeOwned, Serialize};

use super::{WorkflowAction, WorkflowContext, WorkflowSignal};
use crate::activity::ActivityFailure;

/// Failure that closes an execution, as recorded in `ExecutionFailed`
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    pub message: String,

    /// Stable identifier; see [`error_codes`] for the ones the engine assigns
    pub code: Option<String>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_code(error_codes::SERIALIZATION)
    }
}

/// Error codes the engine assigns to failures it records itself
pub mod error_codes {
    /// Replay diverged from recorded history
    pub const NON_DETERMINISM: &str = "NON_DETERMINISM";

    /// Workflow task kept failing until its retry policy gave up
    pub const WORKFLOW_TASK_FAILED: &str = "WORKFLOW_TASK_FAILED";

    /// Run history grew past the configured limit
    pub const HISTORY_LIMIT_EXCEEDED: &str = "HISTORY_LIMIT_EXCEEDED";

    /// A payload could not be (de)serialized
    pub const SERIALIZATION: &str = "SERIALIZATION";

    /// An activity failed and the workflow did not handle it
    pub const ACTIVITY_FAILED: &str = "ACTIVITY_FAILED";
}

/// What a handler returns: new actions, or an unhandled failure
///
/// An `Err` closes the execution with `ExecutionFailed`.
pub type WorkflowResult = Result<Vec<WorkflowAction>, WorkflowError>;

/// Durable business logic, written as handlers over recorded events
///
/// The engine rebuilds an instance by calling [`new`](Self::new) with the
/// run's input and feeding it every recorded event in order. Each handler
/// returns the actions to take next; the workflow never blocks or performs
/// I/O itself.
///
/// Handlers must be deterministic. Fed the same events, they must return
/// the same actions, or replay fails with a non-determinism error. Time,
/// randomness and code-change branches come from the [`WorkflowContext`].
///
/// ```ignore
/// struct Renewal {
///     account: String,
/// }
///
/// impl Workflow for Renewal {
///     const TYPE: &'static str = "renewal";
///     type Input = String;
///     type Output = serde_json::Value;
///
///     fn new(account: String) -> Self {
///         Self { account }
///     }
///
///     fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowResult {
///         Ok(vec![WorkflowAction::timer("grace", Duration::from_secs(86_400))])
///     }
///
///     fn on_timer_fired(&mut self, _ctx: &mut WorkflowContext, _timer_id: &str) -> WorkflowResult {
///         Ok(vec![WorkflowAction::schedule_activity("bill", "bill_account", json!(self.account))])
///     }
///
///     fn on_activity_completed(&mut self, _ctx: &mut WorkflowContext, _id: &str, receipt: Value) -> WorkflowResult {
///         Ok(vec![WorkflowAction::complete(receipt)])
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Name runs are stored and looked up under
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;

    /// Shape of the completion result
    type Output: Serialize + DeserializeOwned + Send;

    /// Build the initial state, for new runs and for replays alike
    fn new(input: Self::Input) -> Self;

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> WorkflowResult;

    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> WorkflowResult;

    /// Called when an activity fails for good (retries exhausted, timed out, cancelled)
    ///
    /// The default treats the failure as unhandled.
    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        failure: &ActivityFailure,
    ) -> WorkflowResult {
        let _ = ctx;
        Err(WorkflowError::new(format!("activity '{activity_id}' failed: {failure}"))
            .with_code(error_codes::ACTIVITY_FAILED))
    }

    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) -> WorkflowResult {
        let _ = (ctx, timer_id);
        Ok(vec![])
    }

    /// Signals are delivered in the order they were recorded
    fn on_signal(&mut self, ctx: &mut WorkflowContext, signal: &WorkflowSignal) -> WorkflowResult {
        let _ = (ctx, signal);
        Ok(vec![])
    }

    /// Called when a client requests cancellation
    ///
    /// Cancellation is cooperative. The default closes the execution as
    /// cancelled right away.
    fn on_cancel_requested(&mut self, ctx: &mut WorkflowContext, reason: &str) -> WorkflowResult {
        let _ = ctx;
        Ok(vec![WorkflowAction::cancel(reason)])
    }

    /// Answer a read-only query against current state
    fn query(&self, name: &str, args: &serde_json::Value) -> Result<serde_json::Value, WorkflowError> {
        let _ = args;
        Err(WorkflowError::new(format!("unknown query: {name}")))
    }
}

/// Serialize a typed output into a completion action
pub fn complete_with<T: Serialize>(output: &T) -> WorkflowResult {
    Ok(vec![WorkflowAction::complete(serde_json::to_value(output)?)])
}
