//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`EventLogStore`] trait: conditional append and ordered read per run
//! - [`InMemoryEventLogStore`] for testing
//! - [`PostgresEventLogStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEventLogStore;
pub use postgres::PostgresEventLogStore;
pub use store::{EventLogStore, ExecutionRecord, ExecutionStatus, NewExecution, StoreError};
