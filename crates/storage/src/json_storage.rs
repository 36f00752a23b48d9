//! JSON file storage implementation.
//!
//! One pretty-printed JSON file per record, grouped by record kind:
//! `tasks/<id>.json`, `samples/<id>.json`, `devices/<name>.json`,
//! `experiments/<id>.json`.

use std::path::{Path, PathBuf};
use labman_core::{Device, Experiment, ExperimentId, Sample, SampleId, Task, TaskFilter, TaskId};
use super::{Result, Storage};
use tokio::fs;
use tracing::debug;

/// File-based JSON storage backend.
pub struct JsonStorage {
    root: PathBuf,
}

impl JsonStorage {
    /// Create storage under `root`, creating the per-kind directories.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("tasks")).await?;
        fs::create_dir_all(root.join("samples")).await?;
        fs::create_dir_all(root.join("devices")).await?;
        fs::create_dir_all(root.join("experiments")).await?;

        debug!("Opened JSON storage at {}", root.display());
        Ok(Self { root })
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", id))
    }
    fn sample_path(&self, id: SampleId) -> PathBuf {
        self.root.join("samples").join(format!("{}.json", id))
    }
    fn device_path(&self, name: &str) -> PathBuf {
        self.root.join("devices").join(format!("{}.json", name))
    }
    fn experiment_path(&self, id: ExperimentId) -> PathBuf {
        self.root.join("experiments").join(format!("{}.json", id))
    }
}

#[async_trait::async_trait]
impl Storage for JsonStorage {
    async fn save_task(&mut self, task: &Task) -> Result<()> {
        write_json(&self.task_path(task.id), task).await
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        read_json(&self.task_path(id)).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = list_dir(&self.root.join("tasks")).await?;
        tasks.retain(|t| filter.matches(t));
        tasks.sort_by_key(|t| (t.seq, t.created_at));
        Ok(tasks)
    }

    async fn save_sample(&mut self, sample: &Sample) -> Result<()> {
        write_json(&self.sample_path(sample.id), sample).await
    }

    async fn load_sample(&self, id: SampleId) -> Result<Option<Sample>> {
        read_json(&self.sample_path(id)).await
    }

    async fn list_samples(&self) -> Result<Vec<Sample>> {
        list_dir(&self.root.join("samples")).await
    }

    async fn save_device(&mut self, device: &Device) -> Result<()> {
        write_json(&self.device_path(&device.name), device).await
    }

    async fn load_device(&self, name: &str) -> Result<Option<Device>> {
        read_json(&self.device_path(name)).await
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = list_dir(&self.root.join("devices")).await?;
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    async fn save_experiment(&mut self, experiment: &Experiment) -> Result<()> {
        write_json(&self.experiment_path(experiment.id), experiment).await
    }

    async fn load_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>> {
        read_json(&self.experiment_path(id)).await
    }

    async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = list_dir(&self.root.join("experiments")).await?;
        experiments.sort_by_key(|e| e.created_at);
        Ok(experiments)
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    // Write-then-rename so readers never see a torn record.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes()).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        if let Ok(Some(item)) = read_json(&entry.path()).await {
            items.push(item);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use labman_core::{TaskStatus, Device};

    #[tokio::test]
    async fn test_task_round_trip_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonStorage::new(dir.path()).await.unwrap();

        let mut first = Task::new("heating");
        first.seq = 1;
        let mut second = Task::new("xrd");
        second.seq = 2;
        second.status = TaskStatus::Ready;

        storage.save_task(&second).await.unwrap();
        storage.save_task(&first).await.unwrap();

        let loaded = storage.load_task(first.id).await.unwrap().unwrap();
        assert_eq!(loaded.task_type, "heating");

        let all = storage.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), vec![first.id, second.id]);

        let ready = storage
            .list_tasks(&TaskFilter { status: Some(vec![TaskStatus::Ready]), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, second.id);
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonStorage::new(dir.path()).await.unwrap();
        assert!(storage.load_task(TaskId::new()).await.unwrap().is_none());
        assert!(storage.load_device("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_device_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonStorage::new(dir.path()).await.unwrap();

        let mut device = Device::new("furnace_1", "furnace");
        storage.save_device(&device).await.unwrap();
        device.message = "heating".to_string();
        storage.save_device(&device).await.unwrap();

        let devices = storage.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].message, "heating");
    }
}
