//! Registry errors.

use labman_core::{PositionId, SampleId, TaskId};

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors returned by the resource registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Some requested resource is held elsewhere; nothing was claimed.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Destination already holds a sample
    #[error("position {0} is occupied")]
    PositionOccupied(PositionId),

    /// Caller does not hold the position lock
    #[error("position {position} is not locked by task {task}")]
    NotLocked {
        /// Position
        position: PositionId,
        /// Caller
        task: TaskId,
    },

    /// Caller does not own the sample
    #[error("sample {sample} is not owned by task {task}")]
    NotOwner {
        /// Sample
        sample: SampleId,
        /// Caller
        task: TaskId,
    },

    /// Sample is being processed by another task
    #[error("sample {sample} is held by task {owner}")]
    SampleInUse {
        /// Sample
        sample: SampleId,
        /// Current owner
        owner: TaskId,
    },

    /// No device with that name
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// No device of that type
    #[error("unknown device type: {0}")]
    UnknownDeviceType(String),

    /// No position with that id or prefix
    #[error("unknown position: {0}")]
    UnknownPosition(String),

    /// No sample with that id
    #[error("unknown sample: {0}")]
    UnknownSample(SampleId),

    /// More positions requested than exist
    #[error("requested {requested} positions under {prefix} but only {available} exist")]
    InsufficientPositions {
        /// Prefix
        prefix: String,
        /// Requested count
        requested: usize,
        /// Matching positions in the lab
        available: usize,
    },

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Declared twice
    #[error("duplicate declaration: {0}")]
    Duplicate(String),
}

impl RegistryError {
    /// Whether retrying later may succeed.
    pub fn is_would_block(&self) -> bool {
        matches!(self, RegistryError::ResourceUnavailable(_))
    }
}
