//! Activity abstractions
//!
//! Activities are units of work that are executed by workers. They:
//! - May fail and be retried according to the retry policy
//! - Can send heartbeats to indicate liveness
//! - Support cancellation via tokens

mod context;
mod definition;
mod invoker;
mod registry;

pub use context::{ActivityContext, Heartbeat, HeartbeatError};
pub use definition::{Activity, ActivityError, ActivityFailure};
pub use invoker::{
    ActivityInvoker, ActivityOutcome, HeartbeatSink, ACTIVITY_NOT_REGISTERED, ACTIVITY_PANICKED,
};
pub use registry::{ActivityHandler, ActivityRegistry, ActivityResult};
