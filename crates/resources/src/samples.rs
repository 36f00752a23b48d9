//! Sample placement and custody.

use labman_core::{ExperimentId, PositionId, Sample, SampleId, TaskId};
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::registry::ResourceRegistry;

impl ResourceRegistry {
    /// Register a new sample, optionally placing it in an empty position.
    pub fn create_sample(
        &self,
        name: impl Into<String>,
        position: Option<PositionId>,
        experiment: Option<ExperimentId>,
    ) -> Result<Sample> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut sample = Sample::new(name);
        sample.experiment = experiment;

        if let Some(id) = &position {
            let pos = state.position_mut(id)?;
            if pos.sample.is_some() {
                return Err(RegistryError::PositionOccupied(id.clone()));
            }
            pos.sample = Some(sample.id);
            sample.position = Some(id.clone());
        }

        debug!("Created sample {} ({})", sample.name, sample.id);
        state.samples.insert(sample.id, sample.clone());
        Ok(sample)
    }

    /// Move a sample between two positions the task holds.
    pub fn move_sample(&self, sample_id: SampleId, destination: &PositionId, task: TaskId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let sample = state.samples.get(&sample_id).ok_or(RegistryError::UnknownSample(sample_id))?;
        if sample.owner != Some(task) {
            return Err(RegistryError::NotOwner { sample: sample_id, task });
        }
        let source = sample.position.clone();
        if source.as_ref() == Some(destination) {
            return Ok(());
        }

        let dest = state
            .positions
            .get(destination)
            .ok_or_else(|| RegistryError::UnknownPosition(destination.to_string()))?;
        if dest.locked_by != Some(task) {
            return Err(RegistryError::NotLocked { position: destination.clone(), task });
        }
        if dest.sample.is_some() {
            return Err(RegistryError::PositionOccupied(destination.clone()));
        }

        if let Some(src) = &source {
            let pos = state
                .positions
                .get(src)
                .ok_or_else(|| RegistryError::UnknownPosition(src.to_string()))?;
            if pos.locked_by != Some(task) {
                return Err(RegistryError::NotLocked { position: src.clone(), task });
            }
        }

        if let Some(src) = &source {
            state.position_mut(src)?.sample = None;
        }
        state.position_mut(destination)?.sample = Some(sample_id);
        state.sample_mut(sample_id)?.position = Some(destination.clone());

        debug!(
            "Task {} moved sample {} from {} to {}",
            task,
            sample_id,
            source.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            destination
        );
        Ok(())
    }

    /// Set or clear the task processing a sample.
    pub fn set_sample_owner(&self, sample: SampleId, owner: Option<TaskId>) -> Result<()> {
        self.state.lock().sample_mut(sample)?.owner = owner;
        Ok(())
    }

    /// Make `task` the owner of `sample` unless another task holds it.
    pub fn claim_sample(&self, sample: SampleId, task: TaskId) -> Result<()> {
        let mut guard = self.state.lock();
        let entry = guard.sample_mut(sample)?;
        match entry.owner {
            Some(owner) if owner != task => Err(RegistryError::SampleInUse { sample, owner }),
            _ => {
                entry.owner = Some(task);
                Ok(())
            }
        }
    }

    /// Record one metadata entry on a sample.
    pub fn update_sample_metadata(
        &self,
        sample: SampleId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        self.state.lock().sample_mut(sample)?.metadata.insert(key.into(), value);
        Ok(())
    }

    /// Sample by id.
    pub fn sample(&self, id: SampleId) -> Option<Sample> {
        self.state.lock().samples.get(&id).cloned()
    }

    /// All samples.
    pub fn samples(&self) -> Vec<Sample> {
        self.state.lock().samples.values().cloned().collect()
    }

    /// Whether `task` owns `sample`.
    pub fn is_owner(&self, sample: SampleId, task: TaskId) -> bool {
        self.state
            .lock()
            .samples
            .get(&sample)
            .is_some_and(|s| s.owner == Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labman_core::ResourceRequest;
    use crate::registry::tests::test_registry;

    #[test]
    fn test_create_sample_occupies_position() {
        let registry = test_registry();
        let rack1 = PositionId::new("rack", 1);
        let sample = registry.create_sample("s1", Some(rack1.clone()), None).unwrap();
        assert_eq!(registry.positions_holding(sample.id), vec![rack1.clone()]);

        let err = registry.create_sample("s2", Some(rack1.clone()), None).unwrap_err();
        assert_eq!(err, RegistryError::PositionOccupied(rack1));
    }

    #[test]
    fn test_move_sample_requires_locks_and_ownership() {
        let registry = test_registry();
        let task = TaskId::new();
        let rack1 = PositionId::new("rack", 1);
        let tray = PositionId::new("furnace_1/tray", 1);
        let sample = registry.create_sample("s1", Some(rack1.clone()), None).unwrap();

        // Not owner yet
        let err = registry.move_sample(sample.id, &tray, task).unwrap_err();
        assert!(matches!(err, RegistryError::NotOwner { .. }));

        registry.set_sample_owner(sample.id, Some(task)).unwrap();
        assert!(registry.is_owner(sample.id, task));

        // Destination not locked
        let err = registry.move_sample(sample.id, &tray, task).unwrap_err();
        assert!(matches!(err, RegistryError::NotLocked { .. }));

        // Lock destination only: source still unlocked
        let dest_lock = registry
            .reserve(&ResourceRequest::new().with_device("furnace_1").with_device_positions("tray/1", 1), task)
            .unwrap();
        let err = registry.move_sample(sample.id, &tray, task).unwrap_err();
        assert_eq!(err, RegistryError::NotLocked { position: rack1.clone(), task });

        let src_lock = registry
            .reserve(&ResourceRequest::new().with_positions("rack/1", 1), task)
            .unwrap();
        registry.move_sample(sample.id, &tray, task).unwrap();
        assert_eq!(registry.sample(sample.id).unwrap().position, Some(tray.clone()));
        assert_eq!(registry.positions_holding(sample.id), vec![tray.clone()]);
        assert_eq!(registry.position(&rack1).unwrap().sample, None);

        registry.release(&src_lock);
        registry.release(&dest_lock);
    }

    #[test]
    fn test_move_into_occupied_position() {
        let registry = test_registry();
        let task = TaskId::new();
        let a = registry.create_sample("a", Some(PositionId::new("rack", 1)), None).unwrap();
        let b = registry.create_sample("b", Some(PositionId::new("rack", 2)), None).unwrap();
        registry.set_sample_owner(a.id, Some(task)).unwrap();
        registry.set_sample_owner(b.id, Some(task)).unwrap();

        registry
            .reserve(&ResourceRequest::new().with_positions("rack/1", 1).with_positions("rack/2", 1), task)
            .unwrap();
        let err = registry.move_sample(a.id, &PositionId::new("rack", 2), task).unwrap_err();
        assert_eq!(err, RegistryError::PositionOccupied(PositionId::new("rack", 2)));
    }

    #[test]
    fn test_foreign_sample_blocks_position() {
        let registry = test_registry();
        let owner = TaskId::new();
        let other = TaskId::new();
        let s = registry.create_sample("s", Some(PositionId::new("rack", 1)), None).unwrap();
        registry.set_sample_owner(s.id, Some(owner)).unwrap();

        let err = registry
            .reserve(&ResourceRequest::new().with_positions("rack/1", 1), other)
            .unwrap_err();
        assert!(err.is_would_block());
        registry
            .reserve(&ResourceRequest::new().with_positions("rack/1", 1), owner)
            .unwrap();
    }

    #[test]
    fn test_claim_sample_refuses_other_owner() {
        let registry = test_registry();
        let first = TaskId::new();
        let second = TaskId::new();
        let s = registry.create_sample("s", None, None).unwrap();

        registry.claim_sample(s.id, first).unwrap();
        registry.claim_sample(s.id, first).unwrap();
        assert_eq!(
            registry.claim_sample(s.id, second).unwrap_err(),
            RegistryError::SampleInUse { sample: s.id, owner: first }
        );
        assert!(registry.is_owner(s.id, first));

        registry.set_sample_owner(s.id, None).unwrap();
        registry.claim_sample(s.id, second).unwrap();
    }

    #[test]
    fn test_metadata() {
        let registry = test_registry();
        let s = registry.create_sample("s", None, None).unwrap();
        registry.update_sample_metadata(s.id, "mass_mg", serde_json::json!(12.5)).unwrap();
        assert_eq!(registry.sample(s.id).unwrap().metadata["mass_mg"], serde_json::json!(12.5));
        assert!(registry.set_sample_owner(SampleId::new(), None).is_err());
    }
}
