//! # Keel Durable Execution Core
//!
//! An event-sourced workflow engine: workflow code is replayed against an
//! append-only history so that executions survive worker crashes, and every
//! side effect runs as an activity whose outcome is recorded before the
//! workflow observes it.
//!
//! ## Features
//!
//! - **Event-sourced executions**: one ordered history per run, appended with optimistic concurrency
//! - **Deterministic replay**: workflow decisions are checked against what history recorded
//! - **Long-poll task queues**: leased tasks, redelivered when a worker goes quiet
//! - **Durable timers and retries**: derived from history, rebuilt on recovery
//! - **Signals, queries, cancellation and versioning** for in-flight executions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Engine                                │
//! │  (start/signal/query/cancel, advance + complete tasks)      │
//! └─────────────────────────────────────────────────────────────┘
//!        │ replay            │ enqueue             │ arm
//!        ▼                   ▼                     ▼
//! ┌──────────────┐   ┌────────────────┐   ┌────────────────────┐
//! │ WorkflowReg. │   │  TaskMatcher   │   │   TimerService     │
//! │ + replay()   │   │ (long poll)    │   │ (timers, retries)  │
//! └──────────────┘   └────────────────┘   └────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    EventLogStore                             │
//! │  (PostgreSQL or in-memory: runs and their event histories)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ outcomes
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (polls tasks, runs workflow tasks and activities)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use keel_durable::prelude::*;
//!
//! struct Greeting {
//!     name: String,
//! }
//!
//! impl Workflow for Greeting {
//!     const TYPE: &'static str = "greeting";
//!     type Input = String;
//!     type Output = String;
//!
//!     fn new(input: Self::Input) -> Self {
//!         Self { name: input }
//!     }
//!
//!     fn on_start(&mut self, _ctx: &mut WorkflowContext) -> WorkflowResult {
//!         Ok(vec![WorkflowAction::schedule_activity("greet", "greet", json!(self.name))])
//!     }
//!
//!     fn on_activity_completed(
//!         &mut self,
//!         _ctx: &mut WorkflowContext,
//!         _activity_id: &str,
//!         result: serde_json::Value,
//!     ) -> WorkflowResult {
//!         Ok(vec![WorkflowAction::complete(result)])
//!     }
//! }
//! ```

pub mod activity;
pub mod clock;
pub mod config;
pub mod engine;
pub mod matcher;
pub mod persistence;
pub mod reliability;
pub mod timer;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityFailure, ActivityRegistry};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, EngineError, ExecutionOutcome, StartOptions, WorkflowRegistry};
    pub use crate::persistence::{
        EventLogStore, ExecutionStatus, InMemoryEventLogStore, PostgresEventLogStore, StoreError,
    };
    pub use crate::reliability::{RetryPolicy, TimeoutConfig, TimeoutType};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowError, WorkflowEvent,
        WorkflowResult, WorkflowSignal,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityFailure, ActivityRegistry};
pub use config::EngineConfig;
pub use engine::{Engine, EngineError, ExecutionOutcome, StartOptions, WorkflowRegistry};
pub use persistence::{
    EventLogStore, ExecutionStatus, InMemoryEventLogStore, PostgresEventLogStore, StoreError,
};
pub use reliability::{RetryDecision, RetryPolicy};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, HistoryEvent, Workflow, WorkflowAction, WorkflowError, WorkflowEvent,
    WorkflowSignal,
};
