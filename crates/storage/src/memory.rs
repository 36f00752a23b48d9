//! In-memory storage for dry runs and tests.

use std::collections::HashMap;
use labman_core::{Device, Experiment, ExperimentId, Sample, SampleId, Task, TaskFilter, TaskId};
use super::{Result, Storage};

/// Keeps every record in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tasks: HashMap<TaskId, Task>,
    samples: HashMap<SampleId, Sample>,
    devices: HashMap<String, Device>,
    experiments: HashMap<ExperimentId, Experiment>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn save_task(&mut self, task: &Task) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        tasks.sort_by_key(|t| (t.seq, t.created_at));
        Ok(tasks)
    }

    async fn save_sample(&mut self, sample: &Sample) -> Result<()> {
        self.samples.insert(sample.id, sample.clone());
        Ok(())
    }

    async fn load_sample(&self, id: SampleId) -> Result<Option<Sample>> {
        Ok(self.samples.get(&id).cloned())
    }

    async fn list_samples(&self) -> Result<Vec<Sample>> {
        Ok(self.samples.values().cloned().collect())
    }

    async fn save_device(&mut self, device: &Device) -> Result<()> {
        self.devices.insert(device.name.clone(), device.clone());
        Ok(())
    }

    async fn load_device(&self, name: &str) -> Result<Option<Device>> {
        Ok(self.devices.get(name).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    async fn save_experiment(&mut self, experiment: &Experiment) -> Result<()> {
        self.experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn load_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        Ok(self.experiments.get(&id).cloned())
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self.experiments.values().cloned().collect();
        experiments.sort_by_key(|e| e.created_at);
        Ok(experiments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared;

    #[tokio::test]
    async fn test_shared_memory_storage() {
        let storage = shared(MemoryStorage::new());
        let sample = Sample::new("s1");
        storage.lock().await.save_sample(&sample).await.unwrap();

        let loaded = storage.lock().await.load_sample(sample.id).await.unwrap();
        assert_eq!(loaded.map(|s| s.name), Some("s1".to_string()));
        assert_eq!(storage.lock().await.list_samples().await.unwrap().len(), 1);
    }
}
