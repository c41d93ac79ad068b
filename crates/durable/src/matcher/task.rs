//! Dispatchable work items

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::ActivityOptions;

/// A unit of work waiting for, or held by, a poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task ID (stable across redeliveries)
    pub id: Uuid,

    /// Queue the task was enqueued on
    pub queue: String,

    /// Execution the task belongs to
    pub execution_id: String,

    /// Run the task belongs to
    pub run_id: Uuid,

    /// What needs doing
    pub kind: TaskKind,

    /// When the task was first enqueued
    pub enqueued_at: DateTime<Utc>,

    /// Visibility window granted on each hand-off
    #[serde(with = "crate::reliability::duration_millis")]
    pub lease: Duration,

    /// Number of times the task has been handed to a poller
    #[serde(default)]
    pub deliveries: u32,
}

/// Kind of task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// The run's workflow code needs advancing
    Workflow {
        /// Workflow task attempt (1-based)
        attempt: u32,
    },

    /// One attempt of a scheduled activity
    Activity(ActivityTask),
}

/// Activity attempt carried by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Activity ID within the run
    pub activity_id: String,

    /// Registered activity type
    pub activity_type: String,

    /// Activity input
    pub input: serde_json::Value,

    /// Attempt number (1-based)
    pub attempt: u32,

    /// Retry and timeout options
    pub options: ActivityOptions,

    /// When the activity was scheduled (first attempt)
    pub scheduled_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with a fresh ID
    pub fn new(
        queue: impl Into<String>,
        execution_id: impl Into<String>,
        run_id: Uuid,
        kind: TaskKind,
        enqueued_at: DateTime<Utc>,
        lease: Duration,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue: queue.into(),
            execution_id: execution_id.into(),
            run_id,
            kind,
            enqueued_at,
            lease,
            deliveries: 0,
        }
    }

    /// Activity payload, if this is an activity task
    pub fn as_activity(&self) -> Option<&ActivityTask> {
        match &self.kind {
            TaskKind::Activity(activity) => Some(activity),
            TaskKind::Workflow { .. } => None,
        }
    }

    /// Check if this is a workflow task
    pub fn is_workflow(&self) -> bool {
        matches!(self.kind, TaskKind::Workflow { .. })
    }
}
