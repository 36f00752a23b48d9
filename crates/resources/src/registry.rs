//! Registry state, declarations, operator controls and queries.

use std::collections::{BTreeMap, HashMap};
use labman_core::config::PositionConfig;
use labman_core::{
    Device, DeviceStatus, LabConfig, LockId, PauseStatus, PositionId, Sample, SampleId,
    SamplePosition, TaskId,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::lock::ResourceLock;

/// Single source of truth for device and position occupancy.
///
/// Every operation takes the one registry mutex, so a reservation evaluates
/// and claims a whole request against a consistent view.
#[derive(Default)]
pub struct ResourceRegistry {
    pub(crate) state: Mutex<RegistryState>,
}

#[derive(Default)]
pub(crate) struct RegistryState {
    pub(crate) devices: BTreeMap<String, Device>,
    pub(crate) positions: BTreeMap<PositionId, SamplePosition>,
    pub(crate) samples: HashMap<SampleId, Sample>,
    pub(crate) locks: HashMap<LockId, ResourceLock>,
    /// Lock that claimed each device; only that lock may free it.
    pub(crate) device_claims: HashMap<String, LockId>,
    pub(crate) position_claims: HashMap<PositionId, LockId>,
}

impl RegistryState {
    pub(crate) fn device_mut(&mut self, name: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_string()))
    }

    pub(crate) fn position_mut(&mut self, id: &PositionId) -> Result<&mut SamplePosition> {
        self.positions
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownPosition(id.to_string()))
    }

    pub(crate) fn sample_mut(&mut self, id: SampleId) -> Result<&mut Sample> {
        self.samples.get_mut(&id).ok_or(RegistryError::UnknownSample(id))
    }

    pub(crate) fn samples_on_device(&self, name: &str) -> usize {
        self.positions
            .values()
            .filter(|p| p.device.as_deref() == Some(name) && p.sample.is_some())
            .count()
    }
}

/// Point-in-time copy of everything the registry tracks.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    /// Devices by name
    pub devices: Vec<Device>,
    /// Positions in id order
    pub positions: Vec<SamplePosition>,
    /// Samples
    pub samples: Vec<Sample>,
    /// Locks not yet released
    pub active_locks: usize,
}

impl ResourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare every device and position named in the lab config.
    pub fn from_config(config: &LabConfig) -> Result<Self> {
        let registry = Self::new();
        for dc in &config.devices {
            let mut device = Device::new(&dc.name, &dc.device_type);
            device.description = dc.description.clone();
            device.methods = dc.methods.clone();
            let positions = dc
                .positions
                .iter()
                .flat_map(|pc| expand_slots(&format!("{}/{}", dc.name, pc.name), Some(&dc.name), pc))
                .collect();
            registry.declare_device(device, positions)?;
        }
        let standalone = config
            .positions
            .iter()
            .flat_map(|pc| expand_slots(&pc.name, None, pc))
            .collect();
        registry.declare_positions(standalone)?;
        {
            let state = registry.state.lock();
            info!(
                "Registry declared {} devices, {} positions",
                state.devices.len(),
                state.positions.len()
            );
        }
        Ok(registry)
    }

    /// Declare a device together with the positions it hosts.
    pub fn declare_device(&self, mut device: Device, positions: Vec<SamplePosition>) -> Result<()> {
        let mut state = self.state.lock();
        if state.devices.contains_key(&device.name) {
            return Err(RegistryError::Duplicate(device.name));
        }
        if let Some(dup) = positions.iter().find(|p| state.positions.contains_key(&p.id)) {
            return Err(RegistryError::Duplicate(dup.id.to_string()));
        }
        device.positions = positions.iter().map(|p| p.id.clone()).collect();
        for mut pos in positions {
            pos.device = Some(device.name.clone());
            state.positions.insert(pos.id.clone(), pos);
        }
        debug!("Declared device {} ({})", device.name, device.device_type);
        state.devices.insert(device.name.clone(), device);
        Ok(())
    }

    /// Declare standalone positions.
    pub fn declare_positions(&self, positions: Vec<SamplePosition>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(dup) = positions.iter().find(|p| state.positions.contains_key(&p.id)) {
            return Err(RegistryError::Duplicate(dup.id.to_string()));
        }
        for pos in positions {
            state.positions.insert(pos.id.clone(), pos);
        }
        Ok(())
    }

    // === Pause control ===

    /// Ask a device to pause. Idle devices pause at once; busy ones pause
    /// when their current holder releases them.
    pub fn pause_request(&self, name: &str) -> Result<PauseStatus> {
        let mut state = self.state.lock();
        let device = state.device_mut(name)?;
        device.pause = if device.owner.is_none() {
            PauseStatus::Paused
        } else {
            PauseStatus::Requested
        };
        device.last_updated = chrono::Utc::now();
        info!("Pause requested for {}: {}", name, device.pause);
        Ok(device.pause)
    }

    /// Lift a pause or pending pause request.
    pub fn pause_release(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let device = state.device_mut(name)?;
        device.pause = PauseStatus::Released;
        device.last_updated = chrono::Utc::now();
        info!("Pause released for {}", name);
        Ok(())
    }

    /// Request a pause on every device.
    pub fn pause_all(&self) -> Vec<(String, PauseStatus)> {
        let names: Vec<String> = self.state.lock().devices.keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|n| self.pause_request(&n).ok().map(|s| (n, s)))
            .collect()
    }

    /// Release every pause.
    pub fn release_all_pauses(&self) {
        let mut state = self.state.lock();
        let now = chrono::Utc::now();
        for device in state.devices.values_mut() {
            device.pause = PauseStatus::Released;
            device.last_updated = now;
        }
    }

    // === Operator device controls ===

    /// Set a device status by hand. `Occupied` is reserved for grants, and
    /// an owned device cannot be forced back to `Idle`.
    pub fn set_device_status(&self, name: &str, status: DeviceStatus) -> Result<()> {
        let mut state = self.state.lock();
        let device = state.device_mut(name)?;
        match status {
            DeviceStatus::Occupied => {
                return Err(RegistryError::InvalidRequest(
                    "devices become occupied only through reservation".to_string(),
                ))
            }
            DeviceStatus::Idle if device.owner.is_some() => {
                return Err(RegistryError::InvalidRequest(format!(
                    "{} is held by a task",
                    name
                )))
            }
            _ => {}
        }
        device.status = status;
        device.last_updated = chrono::Utc::now();
        info!("Device {} set to {}", name, status);
        Ok(())
    }

    /// Set the operator-facing message of a device.
    pub fn set_device_message(&self, name: &str, message: impl Into<String>) -> Result<()> {
        let mut state = self.state.lock();
        let device = state.device_mut(name)?;
        device.message = message.into();
        device.last_updated = chrono::Utc::now();
        Ok(())
    }

    /// Set one device attribute.
    pub fn set_device_attribute(
        &self,
        name: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let device = state.device_mut(name)?;
        device.attributes.insert(key.into(), value);
        device.last_updated = chrono::Utc::now();
        Ok(())
    }

    // === Queries ===

    /// Device by name.
    pub fn device(&self, name: &str) -> Option<Device> {
        self.state.lock().devices.get(name).cloned()
    }

    /// All devices in name order.
    pub fn devices(&self) -> Vec<Device> {
        self.state.lock().devices.values().cloned().collect()
    }

    /// Devices of a type.
    pub fn devices_of_type(&self, device_type: &str) -> Vec<Device> {
        self.state
            .lock()
            .devices
            .values()
            .filter(|d| d.device_type == device_type)
            .cloned()
            .collect()
    }

    /// Position by id.
    pub fn position(&self, id: &PositionId) -> Option<SamplePosition> {
        self.state.lock().positions.get(id).cloned()
    }

    /// Positions under a name prefix.
    pub fn positions_with_prefix(&self, prefix: &str) -> Vec<SamplePosition> {
        self.state
            .lock()
            .positions
            .values()
            .filter(|p| p.id.matches(prefix))
            .cloned()
            .collect()
    }

    /// Names of devices held by a task.
    pub fn devices_owned_by(&self, task: TaskId) -> Vec<String> {
        self.state
            .lock()
            .devices
            .values()
            .filter(|d| d.owner == Some(task))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Positions locked by a task.
    pub fn positions_locked_by(&self, task: TaskId) -> Vec<PositionId> {
        self.state
            .lock()
            .positions
            .values()
            .filter(|p| p.locked_by == Some(task))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Positions holding a sample (at most one).
    pub fn positions_holding(&self, sample: SampleId) -> Vec<PositionId> {
        self.state
            .lock()
            .positions
            .values()
            .filter(|p| p.sample == Some(sample))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Number of samples sitting on a device's positions.
    pub fn samples_on_device(&self, name: &str) -> usize {
        self.state.lock().samples_on_device(name)
    }

    /// Whether `lock` has been granted and not released.
    pub fn is_active(&self, lock: LockId) -> bool {
        self.state.lock().locks.contains_key(&lock)
    }

    /// Number of locks not yet released.
    pub fn active_locks(&self) -> usize {
        self.state.lock().locks.len()
    }

    /// Copy of everything tracked.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        RegistrySnapshot {
            devices: state.devices.values().cloned().collect(),
            positions: state.positions.values().cloned().collect(),
            samples: state.samples.values().cloned().collect(),
            active_locks: state.locks.len(),
        }
    }
}

fn expand_slots(prefix: &str, device: Option<&str>, pc: &PositionConfig) -> Vec<SamplePosition> {
    (1..=pc.slots)
        .map(|slot| {
            let mut pos = SamplePosition::new(PositionId::new(prefix, slot), device.map(str::to_string));
            pos.description = pc.description.clone();
            pos
        })
        .collect()
}
