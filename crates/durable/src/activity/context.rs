//! What a running activity attempt can see and do

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One liveness report from a running attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    /// Progress the attempt wants recorded, if any
    pub details: Option<serde_json::Value>,
}

/// Why a heartbeat was refused
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeartbeatError {
    /// Nobody is listening any more; the invoker already returned
    #[error("heartbeat receiver dropped")]
    Detached,

    /// The attempt's token was tripped
    #[error("activity was cancelled")]
    Cancelled,

    /// The engine no longer tracks this attempt (stale task or closed execution)
    #[error("activity attempt is no longer active")]
    NotActive,
}

/// Handle given to activity code for one attempt
///
/// Identifies the attempt and lets the code report progress and notice
/// cancellation. Long-running activities with a heartbeat timeout must call
/// [`heartbeat`](Self::heartbeat) more often than that timeout, and should
/// return promptly once [`is_cancelled`](Self::is_cancelled) turns true:
///
/// ```ignore
/// registry.register_fn("export", |ctx, input| async move {
///     for page in pages(&input) {
///         if ctx.is_cancelled() {
///             return Err(ActivityError::cancelled("export interrupted"));
///         }
///         upload(page).await?;
///         ctx.heartbeat(Some(json!({ "page": page.number }))).await?;
///     }
///     Ok(json!({ "pages": input["pages"] }))
/// });
/// ```
#[derive(Debug)]
pub struct ActivityContext {
    /// Task carrying this attempt
    pub task_id: Uuid,

    pub execution_id: String,
    pub run_id: Uuid,

    /// Activity ID within the run
    pub activity_id: String,

    /// Registered type the attempt was resolved by
    pub activity_type: String,

    /// 1-based
    pub attempt: u32,

    /// 0 means unlimited
    pub max_attempts: u32,

    beats: Option<mpsc::Sender<Heartbeat>>,
    cancel: CancellationToken,
}

impl ActivityContext {
    pub fn new(
        task_id: Uuid,
        execution_id: impl Into<String>,
        run_id: Uuid,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            task_id,
            execution_id: execution_id.into(),
            run_id,
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            attempt,
            max_attempts,
            beats: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Forward heartbeats to `tx`
    pub fn reporting_to(mut self, tx: mpsc::Sender<Heartbeat>) -> Self {
        self.beats = Some(tx);
        self
    }

    /// Share cancellation with the engine's per-attempt token
    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Report liveness, optionally with progress details
    ///
    /// Fails once the attempt is cancelled or the invoker has stopped
    /// listening. Without a receiver the call is a no-op.
    pub async fn heartbeat(&self, details: Option<serde_json::Value>) -> Result<(), HeartbeatError> {
        if self.cancel.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }
        let Some(tx) = &self.beats else {
            return Ok(());
        };
        tx.send(Heartbeat { details })
            .await
            .map_err(|_| HeartbeatError::Detached)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the attempt is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// No retry follows if this attempt fails
    pub fn is_last_attempt(&self) -> bool {
        self.max_attempts > 0 && self.attempt >= self.max_attempts
    }
}
