//! Commands returned by workflow handlers

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::{duration_millis, RetryPolicy, TimeoutConfig};

/// Commands a workflow can issue
///
/// Workflow code never performs side effects itself: it returns actions,
/// and each new action is recorded as a [`WorkflowEvent`](super::WorkflowEvent)
/// before anything executes it. On replay, the actions a handler returns are
/// matched against the events already recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Run an activity; its outcome comes back as an event
    ScheduleActivity {
        /// Must be unique within the run
        activity_id: String,

        /// Name resolved against the worker's activity registry
        activity_type: String,

        input: serde_json::Value,

        options: ActivityOptions,
    },

    /// Durable timer, relative to the time the task runs
    StartTimer {
        /// Must be unique within the run
        timer_id: String,

        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Drop a pending timer; no-op once it fired
    CancelTimer { timer_id: String },

    /// Stop a pending activity and resolve it as cancelled
    CancelActivity { activity_id: String },

    /// Close the run with a result
    CompleteWorkflow { result: serde_json::Value },

    /// Close the run as failed
    FailWorkflow { error: WorkflowError },

    /// Acknowledge a cancellation request and close the execution
    CancelWorkflow {
        /// Why the execution stopped
        reason: String,
    },

    /// Close this run and start a fresh one with a new input
    ContinueAsNew {
        /// Input for the next run
        input: serde_json::Value,
    },
}

impl WorkflowAction {
    /// [`ScheduleActivity`](Self::ScheduleActivity) with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::schedule_activity_with(activity_id, activity_type, input, ActivityOptions::default())
    }

    /// [`ScheduleActivity`](Self::ScheduleActivity) with `options`
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::CancelWorkflow {
            reason: reason.into(),
        }
    }

    pub fn continue_as_new(input: serde_json::Value) -> Self {
        Self::ContinueAsNew { input }
    }

    /// Fire `timer_id` after `duration`
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    pub fn cancel_timer(timer_id: impl Into<String>) -> Self {
        Self::CancelTimer {
            timer_id: timer_id.into(),
        }
    }

    pub fn cancel_activity(activity_id: impl Into<String>) -> Self {
        Self::CancelActivity {
            activity_id: activity_id.into(),
        }
    }

    /// Whether this action closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. }
                | Self::FailWorkflow { .. }
                | Self::CancelWorkflow { .. }
                | Self::ContinueAsNew { .. }
        )
    }

    /// Short description used in non-determinism reports
    pub fn describe(&self) -> String {
        match self {
            Self::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            } => format!("schedule_activity({activity_id}, {activity_type})"),
            Self::StartTimer { timer_id, .. } => format!("start_timer({timer_id})"),
            Self::CancelTimer { timer_id } => format!("cancel_timer({timer_id})"),
            Self::CancelActivity { activity_id } => format!("cancel_activity({activity_id})"),
            Self::CompleteWorkflow { .. } => "complete_workflow".to_string(),
            Self::FailWorkflow { .. } => "fail_workflow".to_string(),
            Self::CancelWorkflow { .. } => "cancel_workflow".to_string(),
            Self::ContinueAsNew { .. } => "continue_as_new".to_string(),
        }
    }
}

/// Per-activity retry, timeout and routing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActivityOptions {
    /// Applied to every failed attempt
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Timeout tiers
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Queue to dispatch to (defaults to the execution's queue)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
}

impl ActivityOptions {
    /// Replace the retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.schedule_to_start = Some(timeout);
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.start_to_close = timeout;
        self
    }

    pub fn with_schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.schedule_to_close = Some(timeout);
        self
    }

    /// Fail an attempt that goes this long without a heartbeat
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.timeouts.heartbeat = Some(timeout);
        self
    }

    /// Route the activity to a specific task queue
    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_queue = Some(queue.into());
        self
    }
}
