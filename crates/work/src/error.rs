//! Errors raised by task logic.

use labman_resources::RegistryError;
use labman_rpc::DeviceError;

/// Why task logic did not return a result.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Parameters or task setup are wrong; the task is not retried
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A device call failed
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A registry operation was refused
    #[error(transparent)]
    Resource(#[from] RegistryError),

    /// The task was cancelled or the lab is shutting down
    #[error("task interrupted")]
    Interrupted,

    /// Anything else
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}
