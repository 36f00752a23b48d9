//! Task execution for LabMan.
//!
//! Task types are resolved to [`TaskLogic`] through a [`TaskTypeRegistry`];
//! the [`TaskExecutor`] runs them against a [`TaskContext`] exposing only
//! the resources their lock grants.

#![warn(missing_docs)]

pub mod error;
pub mod logic;
pub mod context;
pub mod executor;
pub mod builtin;

pub use error::TaskError;
pub use logic::{TaskFactory, TaskLogic, TaskTypeRegistry};
pub use context::{ResourceGrant, TaskContext};
pub use executor::{TaskEvent, TaskExecutor, TaskOutcome};
pub use builtin::{builtin_task_types, Noop, Sequence, Step};
