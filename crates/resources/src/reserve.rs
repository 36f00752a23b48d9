//! All-or-nothing reservation and release.

use std::collections::HashSet;
use labman_core::{
    Device, DeviceSelector, DeviceStatus, LockId, PauseStatus, PositionId, ResourceRequest,
    SampleId, SamplePosition, TaskId,
};
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::lock::{GrantedDevice, ResourceLock};
use crate::registry::{RegistryState, ResourceRegistry};

/// What a reservation would claim, computed before anything is mutated.
#[derive(Default)]
struct Plan {
    devices: Vec<(String, String)>,
    positions: Vec<(String, Vec<PositionId>)>,
}

/// Who is asking: the task and the samples it is about to process.
#[derive(Clone, Copy)]
struct Claimant<'a> {
    task: TaskId,
    samples: &'a [SampleId],
}

impl ResourceRegistry {
    /// Reserve every resource in `request` for `task`, or nothing.
    ///
    /// Returns [`RegistryError::ResourceUnavailable`] when something is busy
    /// right now. Requests that could never be satisfied (unknown devices,
    /// more positions than exist, repeated requirements) fail with their own
    /// errors and should not be retried.
    pub fn reserve(&self, request: &ResourceRequest, task: TaskId) -> Result<ResourceLock> {
        self.reserve_for(request, task, &[])
    }

    /// Like [`reserve`](Self::reserve), but positions holding one of
    /// `samples` also count as free while those samples are unowned.
    ///
    /// Any other occupied position is only free to the task that owns its
    /// sample. Empty positions are preferred.
    pub fn reserve_for(
        &self,
        request: &ResourceRequest,
        task: TaskId,
        samples: &[SampleId],
    ) -> Result<ResourceLock> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        validate(state, request)?;
        let plan = plan(state, request, Claimant { task, samples })?;
        let lock = commit(state, plan, task);

        debug!(
            "Task {} reserved {} devices, {} positions (lock {})",
            task,
            lock.devices.len(),
            lock.all_positions().count(),
            lock.id
        );
        Ok(lock)
    }

    /// Release a lock. Returns false if it was already released.
    ///
    /// Only resources claimed by this lock are freed; anything the task held
    /// through an outer lock, or that was granted to a later lock, is left
    /// alone.
    pub fn release(&self, lock: &ResourceLock) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.locks.remove(&lock.id).is_none() {
            debug!("Lock {} already released", lock.id);
            return false;
        }
        free_claims(state, lock.id);
        debug!("Released lock {} of task {}", lock.id, lock.task_id);
        true
    }

    /// Force-release every lock held by `task`. Returns how many were freed.
    pub fn release_task(&self, task: TaskId) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ids: Vec<LockId> = state
            .locks
            .values()
            .filter(|l| l.task_id == task)
            .map(|l| l.id)
            .collect();
        for id in &ids {
            state.locks.remove(id);
            free_claims(state, *id);
        }
        if !ids.is_empty() {
            debug!("Force-released {} locks of task {}", ids.len(), task);
        }
        ids.len()
    }
}

fn candidates<'a>(state: &'a RegistryState, selector: &DeviceSelector) -> Result<Vec<&'a Device>> {
    match selector {
        DeviceSelector::Name(name) => state
            .devices
            .get(name)
            .map(|d| vec![d])
            .ok_or_else(|| RegistryError::UnknownDevice(name.clone())),
        DeviceSelector::Type(ty) => {
            let found: Vec<&Device> = state.devices.values().filter(|d| &d.device_type == ty).collect();
            if found.is_empty() {
                Err(RegistryError::UnknownDeviceType(ty.clone()))
            } else {
                Ok(found)
            }
        }
    }
}

fn device_prefix(device: &str, prefix: &str) -> String {
    format!("{}/{}", device, prefix.trim_matches('/'))
}

fn count_matching(state: &RegistryState, prefix: &str) -> usize {
    state.positions.keys().filter(|id| id.matches(prefix)).count()
}

/// Reject requests that no amount of waiting would satisfy.
fn validate(state: &RegistryState, request: &ResourceRequest) -> Result<()> {
    let mut keys = HashSet::new();

    for req in &request.devices {
        if !keys.insert(req.selector.key()) {
            return Err(RegistryError::InvalidRequest(format!("{} requested twice", req.selector)));
        }
        let devices = candidates(state, &req.selector)?;
        for pr in &req.positions {
            if pr.count == 0 {
                return Err(RegistryError::InvalidRequest(format!("zero positions of {}", pr.prefix)));
            }
            if !keys.insert(format!("{}/{}", req.selector.key(), pr.prefix)) {
                return Err(RegistryError::InvalidRequest(format!("{} requested twice", pr.prefix)));
            }
            let available = devices
                .iter()
                .map(|d| count_matching(state, &device_prefix(&d.name, &pr.prefix)))
                .max()
                .unwrap_or(0);
            if available < pr.count {
                return Err(RegistryError::InsufficientPositions {
                    prefix: pr.prefix.clone(),
                    requested: pr.count,
                    available,
                });
            }
        }
    }

    for pr in &request.positions {
        if pr.count == 0 {
            return Err(RegistryError::InvalidRequest(format!("zero positions of {}", pr.prefix)));
        }
        if !keys.insert(pr.prefix.clone()) {
            return Err(RegistryError::InvalidRequest(format!("{} requested twice", pr.prefix)));
        }
        let available = count_matching(state, &pr.prefix);
        if available == 0 {
            return Err(RegistryError::UnknownPosition(pr.prefix.clone()));
        }
        if available < pr.count {
            return Err(RegistryError::InsufficientPositions {
                prefix: pr.prefix.clone(),
                requested: pr.count,
                available,
            });
        }
    }
    Ok(())
}

fn position_available(state: &RegistryState, pos: &SamplePosition, who: Claimant) -> bool {
    if pos.locked_by.is_some_and(|t| t != who.task) {
        return false;
    }
    let Some(sample) = pos.sample else {
        return true;
    };
    match state.samples.get(&sample).map(|s| s.owner) {
        Some(Some(owner)) => owner == who.task,
        Some(None) => who.samples.contains(&sample),
        None => false,
    }
}

fn pick_positions(
    state: &RegistryState,
    prefix: &str,
    count: usize,
    who: Claimant,
    taken: &HashSet<PositionId>,
) -> Option<Vec<PositionId>> {
    let mut free: Vec<&SamplePosition> = state
        .positions
        .values()
        .filter(|p| p.id.matches(prefix) && !taken.contains(&p.id) && position_available(state, p, who))
        .collect();
    if free.len() < count {
        return None;
    }
    // Positions the task already holds, then empty ones; otherwise id order.
    free.sort_by_key(|p| (p.locked_by != Some(who.task), p.sample.is_some()));
    Some(free.into_iter().take(count).map(|p| p.id.clone()).collect())
}

fn plan(state: &RegistryState, request: &ResourceRequest, who: Claimant) -> Result<Plan> {
    let task = who.task;
    let mut plan = Plan::default();
    let mut taken_devices: HashSet<String> = HashSet::new();
    let mut taken_positions: HashSet<PositionId> = HashSet::new();

    for req in &request.devices {
        let mut devices = candidates(state, &req.selector)?;
        if matches!(req.selector, DeviceSelector::Type(_)) {
            devices.sort_by_key(|d| {
                (d.owner != Some(task), state.samples_on_device(&d.name), d.name.clone())
            });
        }

        let mut chosen = None;
        for device in devices {
            if taken_devices.contains(&device.name) || !device.is_available_for(task) {
                continue;
            }
            let mut taken = taken_positions.clone();
            let mut picks = Vec::new();
            let mut fits = true;
            for pr in &req.positions {
                match pick_positions(state, &device_prefix(&device.name, &pr.prefix), pr.count, who, &taken) {
                    Some(ids) => {
                        taken.extend(ids.iter().cloned());
                        picks.push((format!("{}/{}", req.selector.key(), pr.prefix), ids));
                    }
                    None => {
                        fits = false;
                        break;
                    }
                }
            }
            if fits {
                chosen = Some((device.name.clone(), picks, taken));
                break;
            }
        }

        let Some((name, picks, taken)) = chosen else {
            return Err(RegistryError::ResourceUnavailable(req.selector.to_string()));
        };
        taken_devices.insert(name.clone());
        taken_positions = taken;
        plan.devices.push((req.selector.key(), name));
        plan.positions.extend(picks);
    }

    for pr in &request.positions {
        let ids = pick_positions(state, &pr.prefix, pr.count, who, &taken_positions)
            .ok_or_else(|| RegistryError::ResourceUnavailable(format!("positions {}", pr.prefix)))?;
        taken_positions.extend(ids.iter().cloned());
        plan.positions.push((pr.prefix.clone(), ids));
    }
    Ok(plan)
}

fn commit(state: &mut RegistryState, plan: Plan, task: TaskId) -> ResourceLock {
    let now = chrono::Utc::now();
    let mut lock = ResourceLock::new(task);

    for (key, name) in plan.devices {
        let mut newly_claimed = false;
        if let Some(device) = state.devices.get_mut(&name) {
            if device.owner != Some(task) {
                device.owner = Some(task);
                device.status = DeviceStatus::Occupied;
                device.last_updated = now;
                state.device_claims.insert(name.clone(), lock.id);
                newly_claimed = true;
            }
        }
        lock.devices.insert(key, GrantedDevice { name, newly_claimed });
    }

    for (key, ids) in plan.positions {
        for id in &ids {
            if let Some(pos) = state.positions.get_mut(id) {
                if pos.locked_by != Some(task) {
                    pos.locked_by = Some(task);
                    state.position_claims.insert(id.clone(), lock.id);
                }
            }
        }
        lock.positions.insert(key, ids);
    }

    state.locks.insert(lock.id, lock.clone());
    lock
}

fn free_claims(state: &mut RegistryState, lock_id: LockId) {
    let now = chrono::Utc::now();

    let devices: Vec<String> = state
        .device_claims
        .iter()
        .filter(|(_, l)| **l == lock_id)
        .map(|(name, _)| name.clone())
        .collect();
    for name in devices {
        state.device_claims.remove(&name);
        if let Some(device) = state.devices.get_mut(&name) {
            device.owner = None;
            if device.status == DeviceStatus::Occupied {
                device.status = DeviceStatus::Idle;
            }
            if device.pause == PauseStatus::Requested {
                device.pause = PauseStatus::Paused;
            }
            device.last_updated = now;
        }
    }

    let positions: Vec<PositionId> = state
        .position_claims
        .iter()
        .filter(|(_, l)| **l == lock_id)
        .map(|(id, _)| id.clone())
        .collect();
    for id in positions {
        state.position_claims.remove(&id);
        if let Some(pos) = state.positions.get_mut(&id) {
            pos.locked_by = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use labman_core::PositionStatus;
    use crate::registry::tests::test_registry;

    #[test]
    fn test_reserve_and_release() {
        let registry = test_registry();
        let task = TaskId::new();
        let request = ResourceRequest::new()
            .with_device("furnace_1")
            .with_device_positions("tray", 2)
            .with_positions("rack", 1);

        let lock = registry.reserve(&request, task).unwrap();
        assert_eq!(lock.device("furnace_1"), Some("furnace_1"));
        assert_eq!(lock.positions("furnace_1/tray").len(), 2);
        assert_eq!(lock.positions("rack"), &[PositionId::new("rack", 1)]);

        let furnace = registry.device("furnace_1").unwrap();
        assert_eq!(furnace.status, DeviceStatus::Occupied);
        assert_eq!(furnace.owner, Some(task));
        assert_eq!(
            registry.position(&PositionId::new("rack", 1)).unwrap().status(),
            PositionStatus::Locked
        );

        assert!(registry.release(&lock));
        let furnace = registry.device("furnace_1").unwrap();
        assert_eq!(furnace.status, DeviceStatus::Idle);
        assert_eq!(furnace.owner, None);
        assert!(registry.positions_locked_by(task).is_empty());
        assert_eq!(registry.active_locks(), 0);
    }

    #[test]
    fn test_all_or_nothing() {
        let registry = test_registry();
        let a = TaskId::new();
        let b = TaskId::new();

        let _lock = registry
            .reserve(&ResourceRequest::new().with_device("xrd").with_positions("rack/1", 1), a)
            .unwrap();

        let err = registry
            .reserve(&ResourceRequest::new().with_device("xrd").with_positions("rack/2", 1), b)
            .unwrap_err();
        assert!(err.is_would_block());
        // b holds nothing, not even the free position
        assert!(registry.positions_locked_by(b).is_empty());
        assert!(registry.devices_owned_by(b).is_empty());
        assert_eq!(registry.position(&PositionId::new("rack", 2)).unwrap().locked_by, None);
    }

    #[test]
    fn test_by_type_skips_busy_devices() {
        let registry = test_registry();
        let a = TaskId::new();
        let b = TaskId::new();
        let request = ResourceRequest::new().with_device_type("furnace");

        let first = registry.reserve(&request, a).unwrap();
        let second = registry.reserve(&request, b).unwrap();
        assert_ne!(first.device("type:furnace"), second.device("type:furnace"));

        let c = TaskId::new();
        assert!(registry.reserve(&request, c).unwrap_err().is_would_block());
    }

    #[test]
    fn test_by_type_prefers_fewest_samples() {
        let registry = test_registry();
        registry
            .create_sample("s1", Some(PositionId::new("furnace_1/tray", 1)), None)
            .unwrap();

        let lock = registry
            .reserve(&ResourceRequest::new().with_device_type("furnace"), TaskId::new())
            .unwrap();
        assert_eq!(lock.device("type:furnace"), Some("furnace_2"));
    }

    #[test]
    fn test_parked_sample_blocks_count_request() {
        let registry = test_registry();
        let task = TaskId::new();
        let parked = registry.create_sample("parked", Some(PositionId::new("rack", 1)), None).unwrap();
        let mine = registry.create_sample("mine", None, None).unwrap();

        let lock = registry
            .reserve_for(&ResourceRequest::new().with_positions("rack", 1), task, &[mine.id])
            .unwrap();
        assert_eq!(lock.positions("rack"), &[PositionId::new("rack", 2)]);
        registry.release(&lock);

        // The parked slot never counts toward a foreign request
        let err = registry
            .reserve_for(&ResourceRequest::new().with_positions("rack", 4), task, &[mine.id])
            .unwrap_err();
        assert!(err.is_would_block());
        let err = registry
            .reserve_for(&ResourceRequest::new().with_positions("rack/1", 1), task, &[mine.id])
            .unwrap_err();
        assert!(err.is_would_block());

        // Its own sample does not block the task
        let lock = registry
            .reserve_for(&ResourceRequest::new().with_positions("rack/1", 1), task, &[parked.id])
            .unwrap();
        assert_eq!(lock.positions("rack/1"), &[PositionId::new("rack", 1)]);
    }

    #[test]
    fn test_empty_slots_preferred() {
        let registry = test_registry();
        let task = TaskId::new();
        let s = registry.create_sample("s", Some(PositionId::new("rack", 1)), None).unwrap();

        let lock = registry
            .reserve_for(&ResourceRequest::new().with_positions("rack", 4), task, &[s.id])
            .unwrap();
        assert_eq!(lock.positions("rack").last(), Some(&PositionId::new("rack", 1)));
    }

    #[test]
    fn test_explicit_slot() {
        let registry = test_registry();
        let lock = registry
            .reserve(&ResourceRequest::new().with_positions("rack/3", 1), TaskId::new())
            .unwrap();
        assert_eq!(lock.positions("rack/3"), &[PositionId::new("rack", 3)]);
    }

    #[test]
    fn test_unsatisfiable_requests_are_errors() {
        let registry = test_registry();
        let task = TaskId::new();

        let err = registry
            .reserve(&ResourceRequest::new().with_positions("rack", 5), task)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::InsufficientPositions { prefix: "rack".into(), requested: 5, available: 4 }
        );
        assert!(!err.is_would_block());

        let err = registry
            .reserve(&ResourceRequest::new().with_device("nope"), task)
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownDevice("nope".into()));

        let err = registry
            .reserve(&ResourceRequest::new().with_device_type("furnace").with_device_type("furnace"), task)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidRequest(_)));

        let err = registry
            .reserve(&ResourceRequest::new().with_device("xrd").with_device_positions("holder", 2), task)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InsufficientPositions { .. }));
        assert_eq!(registry.active_locks(), 0);
    }

    #[test]
    fn test_double_release_keeps_later_grant() {
        let registry = test_registry();
        let a = TaskId::new();
        let b = TaskId::new();
        let request = ResourceRequest::new().with_device("xrd");

        let first = registry.reserve(&request, a).unwrap();
        assert!(registry.release(&first));

        let second = registry.reserve(&request, b).unwrap();
        assert!(!registry.release(&first));
        assert_eq!(registry.device("xrd").unwrap().owner, Some(b));

        assert!(registry.release(&second));
        assert_eq!(registry.device("xrd").unwrap().owner, None);
    }

    #[test]
    fn test_nested_lock_does_not_free_outer() {
        let registry = test_registry();
        let task = TaskId::new();

        let outer = registry
            .reserve(&ResourceRequest::new().with_device("xrd").with_positions("rack/1", 1), task)
            .unwrap();
        let inner = registry
            .reserve(&ResourceRequest::new().with_device("xrd"), task)
            .unwrap();
        assert!(!inner.devices["xrd"].newly_claimed);

        registry.release(&inner);
        assert_eq!(registry.device("xrd").unwrap().owner, Some(task));

        registry.release(&outer);
        assert_eq!(registry.device("xrd").unwrap().owner, None);
    }

    #[test]
    fn test_pause_takes_effect_on_release() {
        let registry = test_registry();
        let task = TaskId::new();
        let lock = registry.reserve(&ResourceRequest::new().with_device("xrd"), task).unwrap();

        assert_eq!(registry.pause_request("xrd").unwrap(), PauseStatus::Requested);
        registry.release(&lock);
        assert_eq!(registry.device("xrd").unwrap().pause, PauseStatus::Paused);

        let err = registry
            .reserve(&ResourceRequest::new().with_device("xrd"), TaskId::new())
            .unwrap_err();
        assert!(err.is_would_block());

        registry.pause_release("xrd").unwrap();
        registry.reserve(&ResourceRequest::new().with_device("xrd"), TaskId::new()).unwrap();
    }

    #[test]
    fn test_error_device_is_not_granted() {
        let registry = test_registry();
        registry.set_device_status("xrd", DeviceStatus::Error).unwrap();
        let err = registry
            .reserve(&ResourceRequest::new().with_device("xrd"), TaskId::new())
            .unwrap_err();
        assert!(err.is_would_block());
    }

    #[test]
    fn test_release_task() {
        let registry = test_registry();
        let task = TaskId::new();
        registry.reserve(&ResourceRequest::new().with_device("xrd"), task).unwrap();
        registry.reserve(&ResourceRequest::new().with_positions("rack", 2), task).unwrap();

        assert_eq!(registry.release_task(task), 2);
        assert!(registry.devices_owned_by(task).is_empty());
        assert!(registry.positions_locked_by(task).is_empty());
        assert_eq!(registry.release_task(task), 0);
    }

    #[test]
    fn test_concurrent_reservations_single_owner() {
        let registry = Arc::new(test_registry());
        let request = ResourceRequest::new().with_device("xrd").with_positions("rack", 1);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let request = request.clone();
                std::thread::spawn(move || registry.reserve(&request, TaskId::new()).ok())
            })
            .collect();
        let granted: Vec<ResourceLock> =
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect();

        assert_eq!(granted.len(), 1);
        assert_eq!(registry.positions_locked_by(granted[0].task_id).len(), 1);
    }
}
