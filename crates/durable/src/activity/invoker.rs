//! Activity invoker
//!
//! Runs a single activity attempt on the worker side, enforcing the attempt
//! tiers in-process:
//!
//! - `start_to_close`: the attempt future is abandoned once it runs too long
//! - `heartbeat`: the attempt is abandoned when heartbeats stop arriving
//! - cancellation: the attempt is abandoned when its token is tripped
//!
//! A panicking activity fails its attempt with a retryable
//! [`ACTIVITY_PANICKED`] error instead of taking the worker down.
//!
//! The queue-side tiers (`schedule_to_start`, `schedule_to_close`) and the
//! retry decision belong to the engine, which sees every attempt's outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::context::{Heartbeat, HeartbeatError};
use super::{ActivityContext, ActivityFailure, ActivityRegistry};
use crate::matcher::Task;
use crate::reliability::TimeoutType;

/// Error type recorded when no handler matches an activity type
pub const ACTIVITY_NOT_REGISTERED: &str = "ActivityNotRegistered";

/// Error type recorded when an activity body panics
pub const ACTIVITY_PANICKED: &str = "ActivityPanicked";

/// Receives heartbeats from running attempts
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    /// Record liveness (and optional progress) for the attempt carried by `task_id`
    ///
    /// Returning [`HeartbeatError::Cancelled`] or [`HeartbeatError::NotActive`]
    /// stops the attempt.
    async fn record_heartbeat(
        &self,
        task_id: Uuid,
        details: Option<Value>,
    ) -> Result<(), HeartbeatError>;
}

/// Outcome of one activity attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    /// Activity returned a value
    Completed(Value),

    /// Attempt failed
    Failed(ActivityFailure),
}

/// Executes activity attempts against a registry
#[derive(Debug, Clone)]
pub struct ActivityInvoker {
    registry: Arc<ActivityRegistry>,
}

impl ActivityInvoker {
    /// Create an invoker
    pub fn new(registry: Arc<ActivityRegistry>) -> Self {
        Self { registry }
    }

    /// Registry used to resolve handlers
    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Run one attempt of the activity carried by `task`
    #[instrument(skip(self, task, cancel, sink), fields(task_id = %task.id))]
    pub async fn invoke(
        &self,
        task: &Task,
        cancel: CancellationToken,
        sink: &dyn HeartbeatSink,
    ) -> ActivityOutcome {
        let Some(activity) = task.as_activity() else {
            return ActivityOutcome::Failed(ActivityFailure::ApplicationError {
                error_type: Some("InvalidTask".to_string()),
                message: "workflow task handed to activity invoker".to_string(),
                retryable: false,
                details: None,
            });
        };

        let Some(handler) = self.registry.resolve(&activity.activity_type) else {
            warn!(activity_type = %activity.activity_type, "no handler registered");
            return ActivityOutcome::Failed(ActivityFailure::ApplicationError {
                error_type: Some(ACTIVITY_NOT_REGISTERED.to_string()),
                message: format!("no handler registered for '{}'", activity.activity_type),
                retryable: true,
                details: None,
            });
        };

        let (tx, mut rx) = mpsc::channel::<Heartbeat>(16);
        let ctx = ActivityContext::new(
            task.id,
            task.execution_id.clone(),
            task.run_id,
            activity.activity_id.clone(),
            activity.activity_type.clone(),
            activity.attempt,
            activity.options.retry_policy.max_attempts,
        )
        .reporting_to(tx)
        .cancelled_by(cancel.clone());

        let timeouts = &activity.options.timeouts;
        let mut attempt = AssertUnwindSafe(handler(Arc::new(ctx), activity.input.clone())).catch_unwind();
        let close_at = Instant::now() + timeouts.start_to_close;
        let mut heartbeat_at = timeouts.heartbeat.map(|hb| Instant::now() + hb);

        loop {
            let next_heartbeat = heartbeat_at;
            let heartbeat_deadline = async move {
                match next_heartbeat {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                result = &mut attempt => {
                    return match result {
                        Ok(Ok(value)) => ActivityOutcome::Completed(value),
                        Ok(Err(err)) => ActivityOutcome::Failed(err.into()),
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            warn!(%message, "activity panicked");
                            ActivityOutcome::Failed(ActivityFailure::ApplicationError {
                                error_type: Some(ACTIVITY_PANICKED.to_string()),
                                message,
                                retryable: true,
                                details: None,
                            })
                        }
                    };
                }
                _ = cancel.cancelled() => {
                    debug!("attempt cancelled");
                    return ActivityOutcome::Failed(ActivityFailure::cancelled("cancellation requested"));
                }
                _ = tokio::time::sleep_until(close_at) => {
                    return ActivityOutcome::Failed(ActivityFailure::timeout(TimeoutType::StartToClose));
                }
                _ = heartbeat_deadline => {
                    return ActivityOutcome::Failed(ActivityFailure::timeout(TimeoutType::Heartbeat));
                }
                Some(beat) = rx.recv() => {
                    heartbeat_at = timeouts.heartbeat.map(|hb| Instant::now() + hb);
                    match sink.record_heartbeat(task.id, beat.details).await {
                        Ok(()) | Err(HeartbeatError::Detached) => {}
                        Err(HeartbeatError::Cancelled) | Err(HeartbeatError::NotActive) => cancel.cancel(),
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "activity panicked".to_string())
}
