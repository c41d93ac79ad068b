//! Workflow execution engine
//!
//! The engine module provides the [`Engine`], which records workflow
//! decisions in the event log, replays history to drive workflow state
//! machines, and derives task queues, timers and activity attempts from
//! what has been recorded.
//!
//! A workflow task is split in two: [`Engine::advance`] replays and decides,
//! [`Engine::complete_task`] appends the decision at the tail it was computed
//! against. [`Engine::run_workflow_task`] does both, replaying again when
//! another writer got there first.

mod cache;
mod dispatch;
mod error;
mod executor;
mod notify;
mod registry;
mod replay;
mod step;

pub use cache::ExecutionCache;
pub use error::EngineError;
pub use executor::Engine;
pub use notify::{LifecycleEvent, LifecycleNotifier};
pub use registry::{erase, AnyWorkflow, FallbackFactory, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{replay, ReplayError, ReplayOutcome};
pub use step::{ExecutionOutcome, StartOptions, StepDecision, TaskOutcome, WorkflowStep};
