//! Execution layer - task graph, selection and the scheduling loop.
//!
//! [`TaskGraph`] owns task records and their status machine,
//! [`Scheduler`] moves eligible tasks through reservation into the executor,
//! and [`Lab`] assembles a whole runtime from a configuration file.

#![warn(missing_docs)]

pub mod graph;
pub mod selector;
pub mod engine;
pub mod lab;

pub use graph::{batch_cycle, find_cycle, CancelOutcome, GraphError, GraphStats, TaskGraph};
pub use selector::TaskSelector;
pub use engine::{CycleResult, IdleTimeout, Scheduler, SchedulerHandle};
pub use lab::{Lab, LabError, LabStatus};
