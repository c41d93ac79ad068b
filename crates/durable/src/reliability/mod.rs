//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff with give-up rules
//! - [`TimeoutConfig`] - The activity timeout tiers and their checks

mod retry;
mod timeout;

pub(crate) use retry::duration_millis;
pub use retry::{RetryDecision, RetryPolicy};
pub use timeout::{AttemptTiming, TimeoutConfig, TimeoutType};
