//! Typed activities and how their failures are classified

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;
use crate::reliability::TimeoutType;

/// Error type reserved for cancellation
const CANCELLED_ERROR_TYPE: &str = "Cancelled";

/// Error returned by activity code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Matched against the retry policy's `non_retryable_errors`
    pub error_type: Option<String>,

    /// `false` ends the activity on this attempt regardless of policy
    pub retryable: bool,

    /// Recorded in history alongside the failure
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Transient failure; the retry policy decides what happens next
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Permanent failure
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Report that the activity stopped because it was cancelled
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::non_retryable(message).with_type(CANCELLED_ERROR_TYPE)
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string()).with_type("SerializationError")
    }
}

/// Classified outcome of a failed activity attempt
///
/// This is what workflows see in `on_activity_failed` and what history
/// records for every failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityFailure {
    /// A timeout tier was exceeded
    Timeout {
        /// Which tier
        timeout_type: TimeoutType,
    },

    /// Activity code returned an error
    ApplicationError {
        /// Error type/code
        error_type: Option<String>,
        /// Error message
        message: String,
        /// Whether the activity asked to be retried
        retryable: bool,
        /// Additional details
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    /// Attempt was cancelled
    Cancelled {
        /// Why
        reason: String,
    },
}

impl ActivityFailure {
    /// Build a timeout failure
    pub fn timeout(timeout_type: TimeoutType) -> Self {
        Self::Timeout { timeout_type }
    }

    /// Build a cancellation failure
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Error type consulted by the retry policy
    pub fn error_type(&self) -> Option<&str> {
        match self {
            Self::Timeout { .. } => Some("Timeout"),
            Self::ApplicationError { error_type, .. } => error_type.as_deref(),
            Self::Cancelled { .. } => Some(CANCELLED_ERROR_TYPE),
        }
    }

    /// Whether the retry policy should be consulted at all
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { timeout_type } => !timeout_type.is_terminal(),
            Self::ApplicationError { retryable, .. } => *retryable,
            Self::Cancelled { .. } => false,
        }
    }

    /// Timeout tier, if this is a timeout
    pub fn timeout_type(&self) -> Option<TimeoutType> {
        match self {
            Self::Timeout { timeout_type } => Some(*timeout_type),
            _ => None,
        }
    }
}

impl From<ActivityError> for ActivityFailure {
    fn from(err: ActivityError) -> Self {
        if err.error_type.as_deref() == Some(CANCELLED_ERROR_TYPE) {
            return Self::Cancelled {
                reason: err.message,
            };
        }
        Self::ApplicationError {
            error_type: err.error_type,
            message: err.message,
            retryable: err.retryable,
            details: err.details,
        }
    }
}

impl std::fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { timeout_type } => write!(f, "{timeout_type} timeout"),
            Self::ApplicationError {
                error_type: Some(error_type),
                message,
                ..
            } => write!(f, "{error_type}: {message}"),
            Self::ApplicationError { message, .. } => write!(f, "{message}"),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

/// Side-effecting work run by a worker on behalf of a workflow
///
/// An activity may run more than once: after a worker crash, a timeout or
/// a retryable error the engine dispatches a new attempt. Make the effect
/// idempotent, keyed on `ctx.execution_id` and `ctx.activity_id`.
///
/// ```ignore
/// struct ReserveSeat;
///
/// #[async_trait]
/// impl Activity for ReserveSeat {
///     const TYPE: &'static str = "reserve_seat";
///     type Input = SeatRequest;
///     type Output = Reservation;
///
///     async fn execute(&self, ctx: &ActivityContext, req: SeatRequest) -> Result<Reservation, ActivityError> {
///         let key = format!("{}/{}", ctx.execution_id, ctx.activity_id);
///         booking_api::reserve(&key, req.seat).await.map_err(ActivityError::from)
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Registry key; the `activity_type` workflows schedule
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;

    type Output: Serialize + DeserializeOwned + Send;

    /// Run one attempt
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
