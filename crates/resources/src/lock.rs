//! Resource locks handed to running tasks.

use std::collections::BTreeMap;
use labman_core::{LockId, PositionId, TaskId, Time};

/// A device granted under a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedDevice {
    /// Device name
    pub name: String,
    /// False when the task already held the device through an outer lock
    pub newly_claimed: bool,
}

/// Exact devices and positions granted by one successful reservation.
///
/// Never persisted. Release it through the registry that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLock {
    /// Lock identity
    pub id: LockId,
    /// Holder
    pub task_id: TaskId,
    /// Devices keyed by requirement key
    pub devices: BTreeMap<String, GrantedDevice>,
    /// Positions keyed by requirement key
    pub positions: BTreeMap<String, Vec<PositionId>>,
    /// Grant time
    pub granted_at: Time,
}

impl ResourceLock {
    pub(crate) fn new(task_id: TaskId) -> Self {
        Self {
            id: LockId::new(),
            task_id,
            devices: BTreeMap::new(),
            positions: BTreeMap::new(),
            granted_at: chrono::Utc::now(),
        }
    }

    /// Device granted for a requirement key.
    pub fn device(&self, key: &str) -> Option<&str> {
        self.devices.get(key).map(|d| d.name.as_str())
    }

    /// Positions granted for a requirement key.
    pub fn positions(&self, key: &str) -> &[PositionId] {
        self.positions.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every granted device name.
    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.values().map(|d| d.name.as_str())
    }

    /// Every granted position.
    pub fn all_positions(&self) -> impl Iterator<Item = &PositionId> {
        self.positions.values().flatten()
    }

    /// Whether the lock grants `position`.
    pub fn holds_position(&self, position: &PositionId) -> bool {
        self.all_positions().any(|p| p == position)
    }

    /// Whether nothing was granted.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.positions.is_empty()
    }
}
