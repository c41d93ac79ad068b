//! History records: what happened to a run, in order

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityFailure;
use crate::reliability::TimeoutType;

/// One entry in a run's append-only log
///
/// History is the only durable state of a run. Replay feeds it back through
/// workflow code; recovery derives pending tasks, timers and retries from it.
/// An appended event is never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // --- run lifecycle ---
    /// Always the first event of a run
    ExecutionStarted {
        workflow_type: String,
        input: serde_json::Value,
        /// Workflow tasks for this run go here
        task_queue: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_timeout_ms: Option<u64>,
        /// Set when this run was opened by continue-as-new
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continued_from: Option<Uuid>,
    },

    ExecutionCompleted {
        result: serde_json::Value,
    },

    ExecutionFailed {
        error: WorkflowError,
    },

    /// The workflow accepted a cancellation request
    ExecutionCancelled {
        reason: String,
    },

    ExecutionTimedOut,

    /// Closes this run; `new_run_id` carries the execution forward
    ExecutionContinuedAsNew {
        new_run_id: Uuid,
        input: serde_json::Value,
    },

    /// A client asked for cancellation; the workflow decides what to do
    CancellationRequested {
        reason: String,
    },

    // --- workflow tasks ---
    WorkflowTaskScheduled {
        task_queue: String,
        /// 1 unless earlier tasks failed
        attempt: u32,
    },

    /// Only written when the previous attempt failed
    WorkflowTaskCompleted {
        attempt: u32,
    },

    WorkflowTaskFailed {
        attempt: u32,
        cause: String,
    },

    // --- activities ---
    ActivityScheduled {
        /// Unique within the run
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    /// Written only next to a failed attempt; a successful attempt is
    /// summarised by [`WorkflowEvent::ActivityCompleted`] alone.
    ActivityStarted {
        activity_id: String,
        attempt: u32,
        worker_id: String,
    },

    /// One failed attempt; a terminal activity event follows when it was the last
    ActivityAttemptFailed {
        activity_id: String,
        attempt: u32,
        failure: ActivityFailure,
        /// Backoff chosen for the next attempt; `None` means give up
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_delay_ms: Option<u64>,
    },

    ActivityCompleted {
        activity_id: String,
        attempt: u32,
        result: serde_json::Value,
    },

    /// Retries exhausted or the failure was not retryable
    ActivityFailed {
        activity_id: String,
        attempts: u32,
        failure: ActivityFailure,
    },

    ActivityTimedOut {
        activity_id: String,
        timeout_type: TimeoutType,
    },

    ActivityCancelled {
        activity_id: String,
    },

    // --- timers ---
    TimerStarted {
        timer_id: String,
        fire_at: DateTime<Utc>,
    },

    TimerFired {
        timer_id: String,
    },

    TimerCancelled {
        timer_id: String,
    },

    // --- signals and versioning ---
    SignalReceived {
        signal: WorkflowSignal,
    },

    /// Branch chosen by the first `get_version` call for `change_id`
    VersionMarkerRecorded {
        change_id: String,
        version: i32,
    },
}

impl WorkflowEvent {
    /// Snake-case event kind, as stored in the `event_type` column
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
            Self::ExecutionTimedOut => "execution_timed_out",
            Self::ExecutionContinuedAsNew { .. } => "execution_continued_as_new",
            Self::CancellationRequested { .. } => "cancellation_requested",
            Self::WorkflowTaskScheduled { .. } => "workflow_task_scheduled",
            Self::WorkflowTaskCompleted { .. } => "workflow_task_completed",
            Self::WorkflowTaskFailed { .. } => "workflow_task_failed",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityStarted { .. } => "activity_started",
            Self::ActivityAttemptFailed { .. } => "activity_attempt_failed",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::ActivityTimedOut { .. } => "activity_timed_out",
            Self::ActivityCancelled { .. } => "activity_cancelled",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
            Self::SignalReceived { .. } => "signal_received",
            Self::VersionMarkerRecorded { .. } => "version_marker_recorded",
        }
    }

    /// Activity this event belongs to, if any
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityStarted { activity_id, .. }
            | Self::ActivityAttemptFailed { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityTimedOut { activity_id, .. }
            | Self::ActivityCancelled { activity_id } => Some(activity_id),
            _ => None,
        }
    }

    pub fn timer_id(&self) -> Option<&str> {
        match self {
            Self::TimerStarted { timer_id, .. }
            | Self::TimerFired { timer_id }
            | Self::TimerCancelled { timer_id } => Some(timer_id),
            _ => None,
        }
    }

    /// Closes the run; nothing may be appended after it
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionCancelled { .. }
                | Self::ExecutionTimedOut
                | Self::ExecutionContinuedAsNew { .. }
        )
    }

    /// Settles an activity for good
    pub fn is_activity_resolution(&self) -> bool {
        matches!(
            self,
            Self::ActivityCompleted { .. }
                | Self::ActivityFailed { .. }
                | Self::ActivityTimedOut { .. }
                | Self::ActivityCancelled { .. }
        )
    }

    /// Command events are what replay matches handler output against.
    /// Version markers are excluded; they are looked up by change id.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::ActivityScheduled { .. }
                | Self::ActivityCancelled { .. }
                | Self::TimerStarted { .. }
                | Self::TimerCancelled { .. }
                | Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionCancelled { .. }
                | Self::ExecutionContinuedAsNew { .. }
        )
    }

    /// Delivered to a workflow handler during replay
    pub fn is_workflow_input(&self) -> bool {
        matches!(
            self,
            Self::ExecutionStarted { .. }
                | Self::CancellationRequested { .. }
                | Self::ActivityCompleted { .. }
                | Self::ActivityFailed { .. }
                | Self::ActivityTimedOut { .. }
                | Self::TimerFired { .. }
                | Self::SignalReceived { .. }
        )
    }
}

/// An event as recorded in history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// 1-based and gapless within a run
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: WorkflowEvent,
}

impl HistoryEvent {
    /// Stamp a batch of events for appending after `tail`
    pub fn batch(tail: u64, recorded_at: DateTime<Utc>, events: Vec<WorkflowEvent>) -> Vec<Self> {
        events
            .into_iter()
            .zip(tail + 1..)
            .map(|(event, sequence)| Self {
                sequence,
                recorded_at,
                event,
            })
            .collect()
    }
}
