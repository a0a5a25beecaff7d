//! Persistence layer for the task lifecycle
//!
//! This module provides:
//! - [`WorkStore`] trait for task and error persistence
//! - [`PostgresWorkStore`] for production
//! - [`InMemoryWorkStore`] for testing

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkStore;
pub use postgres::{PostgresWorkStore, MIGRATOR};
pub use store::{ErrorRecord, StoreError, TaskId, TaskRecord, TaskStatus, WorkStore};
