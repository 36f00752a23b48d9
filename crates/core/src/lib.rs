//! LabMan core data models.
//!
//! This crate defines the records shared by the scheduling core: devices,
//! sample positions, samples, tasks with their resource requests,
//! experiments and the lab configuration.

#![warn(missing_docs)]

// Core identities
mod id;

// Resources
mod device;
mod sample;
mod request;

// Work
mod task;
mod experiment;

// Configuration
pub mod config;

// Re-exports
pub use id::*;

pub use device::{Device, DeviceStatus, PauseStatus};
pub use sample::{ParsePositionError, PositionId, PositionStatus, Sample, SamplePosition};
pub use request::{DeviceRequirement, DeviceSelector, PositionRequirement, ResourceRequest};

pub use task::{InvalidTransition, Task, TaskFilter, TaskPriority, TaskStatus};
pub use experiment::{
    Experiment, ExperimentError, ExperimentSpec, ExperimentStatus, SampleSpec, TaskSpec,
};

pub use config::{ConfigError, LabConfig};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
