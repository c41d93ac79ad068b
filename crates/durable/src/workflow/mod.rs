//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowContext`] for replay-safe time, randomness and versioning
//! - [`WorkflowAction`] enum for workflow commands
//! - [`WorkflowEvent`] enum for persisted events
//! - [`WorkflowSignal`] for external communication

mod action;
mod context;
mod definition;
mod event;
mod signal;

pub use action::{ActivityOptions, WorkflowAction};
pub use context::{WorkflowContext, DEFAULT_VERSION};
pub use definition::{complete_with, error_codes, Workflow, WorkflowError, WorkflowResult};
pub use event::{HistoryEvent, WorkflowEvent};
pub use signal::WorkflowSignal;
