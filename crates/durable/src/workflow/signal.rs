//! Messages sent into running executions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An asynchronous message delivered into a running execution
///
/// Signals are recorded as `SignalReceived` events, so a workflow sees them
/// in log order, interleaved with activity and timer outcomes. Signals from
/// independent senders racing each other have no guaranteed relative order.
///
/// # Example
///
/// ```
/// use keel_durable::WorkflowSignal;
/// use serde_json::json;
///
/// let signal = WorkflowSignal::new("approve", json!({ "by": "ops" }));
/// assert!(signal.is("approve"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    pub name: String,
    pub payload: serde_json::Value,
    /// Client-side send time; ordering comes from the log, not from this
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    /// Stamped with the wall clock
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::at(name, payload, Utc::now())
    }

    pub fn at(name: impl Into<String>, payload: serde_json::Value, sent_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            payload,
            sent_at,
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_payload_as() {
        #[derive(Deserialize)]
        struct Approval {
            by: String,
        }

        let signal = WorkflowSignal::new("approve", json!({ "by": "ops" }));
        let approval: Approval = signal.payload_as().unwrap();
        assert_eq!(approval.by, "ops");
    }

    #[test]
    fn test_payload_of_wrong_shape() {
        let signal = WorkflowSignal::at("approve", json!("ops"), Utc::now());
        assert!(signal.payload_as::<Vec<u8>>().is_err());
        assert!(!signal.is("reject"));
    }
}
