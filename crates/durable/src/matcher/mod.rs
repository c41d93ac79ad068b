//! Task queue matching
//!
//! Workflow and activity tasks are transient: they are derived from history
//! and handed to long-polling workers here. Delivery is at-least-once; a
//! task that is not acknowledged before its lease runs out is handed out
//! again.

mod queue;
mod task;

pub use queue::TaskMatcher;
pub use task::{ActivityTask, Task, TaskKind};
