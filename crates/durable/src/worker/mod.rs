//! Worker pool for task execution
//!
//! [`WorkerPool`] polls an [`Engine`](crate::engine::Engine) for workflow and
//! activity tasks and runs them with bounded concurrency.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │ workflow     │  │ activity     │  │  timer loop       │  │
//! │  │ poll loop    │  │ poll loop    │  │  (timers, sweeps) │  │
//! │  │ (per queue)  │  │ (per queue)  │  └───────────────────┘  │
//! │  └──────┬───────┘  └──────┬───────┘                         │
//! │         ▼                 ▼                                  │
//! │  ┌──────────────┐  ┌──────────────────────────────────┐     │
//! │  │ Semaphore    │  │ Semaphore + ActivityInvoker      │     │
//! │  │ run_workflow │  │ heartbeats flow back to engine   │     │
//! │  │ _task        │  │                                  │     │
//! │  └──────────────┘  └──────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod pool;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
