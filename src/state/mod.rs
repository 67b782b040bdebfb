//! Durable, lockable, crash-safe persistence for workflows.

mod lock;
pub mod store;

pub use store::{StateStore, WorkflowLock, atomic_write, validate_name};
