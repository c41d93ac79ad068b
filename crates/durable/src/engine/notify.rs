//! Lifecycle notifications
//!
//! The engine publishes what it does on a broadcast channel so that an
//! outside metrics or logging layer can follow along. Publishing never
//! waits: a subscriber that falls behind skips ahead and loses the
//! notifications it missed.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::persistence::ExecutionStatus;

/// Something that happened to an execution
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A run was created
    ExecutionStarted {
        execution_id: String,
        run_id: Uuid,
        workflow_type: String,
    },

    /// A task was made available to pollers
    TaskScheduled {
        task_id: Uuid,
        queue: String,
        execution_id: String,
        /// `"workflow"` or `"activity"`
        kind: &'static str,
    },

    /// A task was acknowledged
    TaskCompleted { task_id: Uuid, execution_id: String },

    /// A run reached a terminal status
    ExecutionClosed {
        execution_id: String,
        run_id: Uuid,
        status: ExecutionStatus,
    },
}

impl LifecycleEvent {
    /// Execution the notification is about
    pub fn execution_id(&self) -> &str {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::TaskScheduled { execution_id, .. }
            | Self::TaskCompleted { execution_id, .. }
            | Self::ExecutionClosed { execution_id, .. } => execution_id,
        }
    }
}

/// Fan-out of lifecycle notifications
#[derive(Debug, Clone)]
pub struct LifecycleNotifier {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleNotifier {
    /// Create a notifier buffering up to `capacity` notifications per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every notification published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publish a notification; a no-op without subscribers
    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(n: u8) -> LifecycleEvent {
        LifecycleEvent::TaskCompleted {
            task_id: Uuid::now_v7(),
            execution_id: format!("exec-{n}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        LifecycleNotifier::new(4).publish(completed(1));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let notifier = LifecycleNotifier::new(2);
        let mut rx = notifier.subscribe();

        for n in 0..5 {
            notifier.publish(completed(n));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().execution_id(), "exec-3");
    }
}
