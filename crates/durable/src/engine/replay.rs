//! Deterministic replay of workflow code against recorded history
//!
//! Replay rebuilds a workflow instance by feeding it every input event of a
//! run in sequence order. Each action a handler returns is either matched
//! against the next command event already in history, or, once history is
//! exhausted, collected as a new command for the caller to record. An action
//! that disagrees with the recorded command means the workflow code no
//! longer behaves the way it did when the history was written.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::trace;
use uuid::Uuid;

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
use crate::activity::ActivityFailure;
use crate::workflow::{HistoryEvent, WorkflowAction, WorkflowContext, WorkflowEvent, WorkflowResult};

/// Errors from replay
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// History does not begin with `ExecutionStarted`
    #[error("history does not start with ExecutionStarted")]
    MissingStart,

    /// Workflow type could not be instantiated
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Workflow code diverged from history
    #[error("non-determinism at sequence {sequence}: {detail}")]
    NonDeterminism { sequence: u64, detail: String },

    /// A handler panicked
    #[error("workflow handler panicked: {0}")]
    Panicked(String),
}

/// Result of replaying a run's full history
pub struct ReplayOutcome {
    /// Instance with every input applied
    pub instance: Box<dyn AnyWorkflow>,

    /// Commands not yet recorded in history
    pub commands: Vec<WorkflowAction>,

    /// Version markers chosen for the first time
    pub markers: Vec<(String, i32)>,

    /// Sequence of the last event replayed
    pub tail: u64,

    /// Attempt number of the workflow task being run
    pub task_attempt: u32,
}

impl fmt::Debug for ReplayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayOutcome")
            .field("workflow_type", &self.instance.workflow_type())
            .field("commands", &self.commands)
            .field("markers", &self.markers)
            .field("tail", &self.tail)
            .field("task_attempt", &self.task_attempt)
            .finish()
    }
}

/// Replay `history` through a fresh instance of its workflow type
pub fn replay(
    registry: &WorkflowRegistry,
    execution_id: &str,
    run_id: Uuid,
    history: &[HistoryEvent],
) -> Result<ReplayOutcome, ReplayError> {
    let first = history.first().ok_or(ReplayError::MissingStart)?;
    let WorkflowEvent::ExecutionStarted {
        workflow_type,
        input,
        ..
    } = &first.event
    else {
        return Err(ReplayError::MissingStart);
    };

    let instance = registry.create(workflow_type, input.clone())?;
    let mut ctx = WorkflowContext::new(execution_id, run_id, workflow_type.as_str(), first.recorded_at);

    let mut cursor = VecDeque::new();
    let mut last_recorded = 0;
    for event in history {
        match &event.event {
            WorkflowEvent::VersionMarkerRecorded { change_id, version } => {
                ctx.load_marker(change_id.clone(), *version);
                last_recorded = event.sequence;
            }
            e if e.is_command() => {
                cursor.push_back(event);
                last_recorded = event.sequence;
            }
            _ => {}
        }
    }

    let mut replayer = Replayer {
        instance,
        ctx,
        cursor,
        commands: Vec::new(),
        markers: Vec::new(),
        cancelled_timers: HashSet::new(),
        cancelled_activities: HashSet::new(),
        closed: false,
    };

    for event in history {
        if replayer.closed {
            break;
        }
        replayer.ctx.set_now(event.recorded_at);
        replayer.ctx.set_replaying(event.sequence < last_recorded);
        replayer.apply(event)?;
    }

    if let Some(leftover) = replayer.cursor.front() {
        return Err(ReplayError::NonDeterminism {
            sequence: leftover.sequence,
            detail: format!(
                "history has {} that replay did not produce",
                leftover.event.kind()
            ),
        });
    }

    Ok(ReplayOutcome {
        instance: replayer.instance,
        commands: replayer.commands,
        markers: replayer.markers,
        tail: history.last().map(|e| e.sequence).unwrap_or(0),
        task_attempt: task_attempt(history),
    })
}

/// Attempt number of the next workflow task
///
/// Counts the workflow task failures since the last successful task.
pub(crate) fn task_attempt(history: &[HistoryEvent]) -> u32 {
    let mut failures = 0;
    for event in history {
        match &event.event {
            WorkflowEvent::WorkflowTaskFailed { .. } => failures += 1,
            WorkflowEvent::WorkflowTaskCompleted { .. }
            | WorkflowEvent::VersionMarkerRecorded { .. } => failures = 0,
            e if e.is_command() => failures = 0,
            _ => {}
        }
    }
    failures + 1
}

struct Replayer<'h> {
    instance: Box<dyn AnyWorkflow>,
    ctx: WorkflowContext,
    cursor: VecDeque<&'h HistoryEvent>,
    commands: Vec<WorkflowAction>,
    markers: Vec<(String, i32)>,
    cancelled_timers: HashSet<String>,
    cancelled_activities: HashSet<String>,
    closed: bool,
}

impl Replayer<'_> {
    fn apply(&mut self, event: &HistoryEvent) -> Result<(), ReplayError> {
        let instance = &mut self.instance;
        let ctx = &mut self.ctx;

        let handled: Option<WorkflowResult> = match &event.event {
            WorkflowEvent::ExecutionStarted { .. } => run(|| instance.on_start(ctx))?,
            WorkflowEvent::CancellationRequested { reason } => {
                ctx.mark_cancel_requested();
                run(|| instance.on_cancel_requested(ctx, reason))?
            }
            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                ..
            } if !self.cancelled_activities.contains(activity_id) => {
                run(|| instance.on_activity_completed(ctx, activity_id, result.clone()))?
            }
            WorkflowEvent::ActivityFailed {
                activity_id,
                failure,
                ..
            } if !self.cancelled_activities.contains(activity_id) => {
                run(|| instance.on_activity_failed(ctx, activity_id, failure))?
            }
            WorkflowEvent::ActivityTimedOut {
                activity_id,
                timeout_type,
            } if !self.cancelled_activities.contains(activity_id) => {
                let failure = ActivityFailure::timeout(*timeout_type);
                run(|| instance.on_activity_failed(ctx, activity_id, &failure))?
            }
            WorkflowEvent::TimerFired { timer_id } if !self.cancelled_timers.contains(timer_id) => {
                run(|| instance.on_timer_fired(ctx, timer_id))?
            }
            WorkflowEvent::SignalReceived { signal } => run(|| instance.on_signal(ctx, signal))?,
            _ => None,
        };

        let Some(result) = handled else {
            return Ok(());
        };

        if let Some(violation) = self.ctx.take_violation() {
            return Err(ReplayError::NonDeterminism {
                sequence: event.sequence,
                detail: violation,
            });
        }
        self.markers.extend(self.ctx.take_new_markers());

        let actions = match result {
            Ok(actions) => actions,
            Err(error) => vec![WorkflowAction::fail(error)],
        };

        for action in actions {
            self.accept(action)?;
            if self.closed {
                break;
            }
        }
        Ok(())
    }

    fn accept(&mut self, action: WorkflowAction) -> Result<(), ReplayError> {
        match &action {
            WorkflowAction::CancelTimer { timer_id } => {
                self.cancelled_timers.insert(timer_id.clone());
            }
            WorkflowAction::CancelActivity { activity_id } => {
                self.cancelled_activities.insert(activity_id.clone());
            }
            _ => {}
        }
        self.closed = action.is_terminal();

        match self.cursor.pop_front() {
            Some(recorded) if matches(&action, &recorded.event) => {
                trace!(sequence = recorded.sequence, action = %action.describe(), "matched recorded command");
                Ok(())
            }
            Some(recorded) => Err(ReplayError::NonDeterminism {
                sequence: recorded.sequence,
                detail: format!(
                    "expected {} but workflow produced {}",
                    recorded.event.kind(),
                    action.describe()
                ),
            }),
            None => {
                self.commands.push(action);
                Ok(())
            }
        }
    }
}

/// Run a handler, turning a panic into an error
fn run<F>(handler: F) -> Result<Option<WorkflowResult>, ReplayError>
where
    F: FnOnce() -> WorkflowResult,
{
    catch_unwind(AssertUnwindSafe(handler))
        .map(Some)
        .map_err(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            ReplayError::Panicked(message)
        })
}

/// Check whether `action` is the command that recorded `event`
fn matches(action: &WorkflowAction, event: &WorkflowEvent) -> bool {
    match (action, event) {
        (
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            },
            WorkflowEvent::ActivityScheduled {
                activity_id: recorded_id,
                activity_type: recorded_type,
                ..
            },
        ) => activity_id == recorded_id && activity_type == recorded_type,
        (
            WorkflowAction::StartTimer { timer_id, .. },
            WorkflowEvent::TimerStarted {
                timer_id: recorded, ..
            },
        )
        | (
            WorkflowAction::CancelTimer { timer_id },
            WorkflowEvent::TimerCancelled { timer_id: recorded },
        ) => timer_id == recorded,
        (
            WorkflowAction::CancelActivity { activity_id },
            WorkflowEvent::ActivityCancelled {
                activity_id: recorded,
            },
        ) => activity_id == recorded,
        (WorkflowAction::CompleteWorkflow { .. }, WorkflowEvent::ExecutionCompleted { .. })
        | (WorkflowAction::FailWorkflow { .. }, WorkflowEvent::ExecutionFailed { .. })
        | (WorkflowAction::CancelWorkflow { .. }, WorkflowEvent::ExecutionCancelled { .. })
        | (WorkflowAction::ContinueAsNew { .. }, WorkflowEvent::ExecutionContinuedAsNew { .. }) => {
            true
        }
        _ => false,
    }
}
