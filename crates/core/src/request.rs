//! Resource request specs declared by task types.

use serde::{Deserialize, Serialize};

/// Which device a requirement refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelector {
    /// A specific device by name
    Name(String),
    /// Any device of the given type
    Type(String),
}

impl DeviceSelector {
    /// Key under which the granted device is reported in a lock.
    pub fn key(&self) -> String {
        match self {
            DeviceSelector::Name(name) => name.clone(),
            DeviceSelector::Type(ty) => format!("type:{}", ty),
        }
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Name(name) => write!(f, "device {}", name),
            DeviceSelector::Type(ty) => write!(f, "any {}", ty),
        }
    }
}

/// A number of positions under a name prefix.
///
/// A prefix that already names a slot (`tray/2`) with count 1 requests
/// that exact position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionRequirement {
    /// Name prefix; relative to the device for device requirements
    pub prefix: String,
    /// How many positions to lock
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    1
}

impl PositionRequirement {
    /// Require `count` positions under `prefix`.
    pub fn new(prefix: impl Into<String>, count: usize) -> Self {
        Self { prefix: prefix.into(), count }
    }
}

/// A device plus positions on that device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequirement {
    /// Device to reserve
    pub selector: DeviceSelector,
    /// Positions on the granted device
    #[serde(default)]
    pub positions: Vec<PositionRequirement>,
}

/// Everything a task must hold before it may run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Device requirements
    #[serde(default)]
    pub devices: Vec<DeviceRequirement>,
    /// Standalone position requirements
    #[serde(default)]
    pub positions: Vec<PositionRequirement>,
}

impl ResourceRequest {
    /// Empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a device by name.
    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.devices.push(DeviceRequirement {
            selector: DeviceSelector::Name(name.into()),
            positions: Vec::new(),
        });
        self
    }

    /// Require any device of a type.
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.devices.push(DeviceRequirement {
            selector: DeviceSelector::Type(device_type.into()),
            positions: Vec::new(),
        });
        self
    }

    /// Require positions on the most recently added device.
    pub fn with_device_positions(mut self, prefix: impl Into<String>, count: usize) -> Self {
        if let Some(last) = self.devices.last_mut() {
            last.positions.push(PositionRequirement::new(prefix, count));
        }
        self
    }

    /// Require standalone positions.
    pub fn with_positions(mut self, prefix: impl Into<String>, count: usize) -> Self {
        self.positions.push(PositionRequirement::new(prefix, count));
        self
    }

    /// Whether nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.positions.is_empty()
    }
}
