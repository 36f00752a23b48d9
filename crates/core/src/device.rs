//! Device model - lab equipment tracked by the resource registry.

use serde::{Deserialize, Serialize};
use crate::id::TaskId;
use crate::sample::PositionId;
use crate::Time;

/// A physical device declared at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Unique device name
    pub name: String,

    /// Declared type (capability tag) used for by-type requests
    pub device_type: String,

    /// Human readable description
    pub description: String,

    /// Methods the device-control process accepts
    pub methods: Vec<String>,

    /// Sample positions hosted on this device
    pub positions: Vec<PositionId>,

    /// Occupancy status
    pub status: DeviceStatus,

    /// Task currently holding the device
    pub owner: Option<TaskId>,

    /// Operator-facing message
    pub message: String,

    /// Pause control state
    pub pause: PauseStatus,

    /// Free-form attributes set by operators or task logic
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,

    /// Last mutation timestamp
    pub last_updated: Time,
}

impl Device {
    /// Create an idle, unowned device.
    pub fn new(name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_type: device_type.into(),
            description: String::new(),
            methods: Vec::new(),
            positions: Vec::new(),
            status: DeviceStatus::Idle,
            owner: None,
            message: String::new(),
            pause: PauseStatus::Released,
            attributes: serde_json::Map::new(),
            last_updated: chrono::Utc::now(),
        }
    }

    /// Whether `task` may be granted this device right now.
    ///
    /// A device the task already owns stays grantable so nested requests
    /// from the same task succeed.
    pub fn is_available_for(&self, task: TaskId) -> bool {
        if self.owner == Some(task) {
            return true;
        }
        self.owner.is_none() && self.status == DeviceStatus::Idle && self.pause == PauseStatus::Released
    }
}

/// Occupancy status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    /// Free to be reserved
    Idle,
    /// Held by a task
    Occupied,
    /// Faulted; refuses reservations until an operator clears it
    Error,
    /// State not known (e.g. controller never reported)
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Idle => write!(f, "IDLE"),
            DeviceStatus::Occupied => write!(f, "OCCUPIED"),
            DeviceStatus::Error => write!(f, "ERROR"),
            DeviceStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Pause control state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseStatus {
    /// Not paused
    Released,
    /// Pause requested; takes effect when the current owner releases
    Requested,
    /// Paused; refuses new reservations
    Paused,
}

impl std::fmt::Display for PauseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseStatus::Released => write!(f, "RELEASED"),
            PauseStatus::Requested => write!(f, "REQUESTED"),
            PauseStatus::Paused => write!(f, "PAUSED"),
        }
    }
}
