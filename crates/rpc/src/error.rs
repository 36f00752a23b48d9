//! Gateway and proxy errors.

use std::time::Duration;

/// Transport-level failures of a device call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// No final reply before the deadline
    #[error("call {device}.{method} timed out after {timeout:?}")]
    Timeout {
        /// Device
        device: String,
        /// Method
        method: String,
        /// Deadline that passed
        timeout: Duration,
    },

    /// No request channel is registered for the device
    #[error("device {0} is not available")]
    DeviceUnavailable(String),

    /// The device's request channel closed
    #[error("connection to device {0} lost")]
    ConnectionLost(String),

    /// The call saw no progress for longer than the stale horizon
    #[error("call {device}.{method} went stale after {age:?}")]
    Stale {
        /// Device
        device: String,
        /// Method
        method: String,
        /// Time since last update
        age: Duration,
    },

    /// Gateway was shut down while the call was outstanding
    #[error("device gateway shut down")]
    Shutdown,

    /// A live channel already exists for the device
    #[error("device {0} is already registered")]
    AlreadyRegistered(String),

    /// The reply stream was already claimed by another gateway
    #[error("reply channel of bus {0} already has a listener")]
    ListenerTaken(String),
}

/// Errors seen by task logic calling a device proxy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Method is not declared by the device
    #[error("device {device} has no method {method}")]
    UnknownMethod {
        /// Device
        device: String,
        /// Method
        method: String,
    },

    /// Transport failure reaching the device
    #[error("device connection error: {0}")]
    Connection(RpcError),

    /// Call timed out
    #[error("device {device} timed out calling {method} after {timeout:?}")]
    Timeout {
        /// Device
        device: String,
        /// Method
        method: String,
        /// Deadline
        timeout: Duration,
    },

    /// The device reported a failure
    #[error("device {device} failed {method}: {message}")]
    Remote {
        /// Device
        device: String,
        /// Method
        method: String,
        /// Error payload from the device
        message: String,
    },
}

impl From<RpcError> for DeviceError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout { device, method, timeout } => DeviceError::Timeout { device, method, timeout },
            other => DeviceError::Connection(other),
        }
    }
}
