//! Storage trait abstraction.

use std::sync::Arc;
use async_trait::async_trait;
use labman_core::{Device, Experiment, ExperimentId, Sample, SampleId, Task, TaskFilter, TaskId};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Durable record of the lab's data model.
///
/// The scheduling core writes through this trait after every state change;
/// it never reads back from it while running.
#[async_trait]
pub trait Storage: Send + Sync {
    // === Task operations ===

    /// Save a task (create or update).
    async fn save_task(&mut self, task: &Task) -> Result<()>;

    /// Load a task by ID.
    async fn load_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// List tasks matching the filter, in admission order.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    // === Sample operations ===

    /// Save a sample.
    async fn save_sample(&mut self, sample: &Sample) -> Result<()>;

    /// Load a sample by ID.
    async fn load_sample(&self, id: SampleId) -> Result<Option<Sample>>;

    /// List all samples.
    async fn list_samples(&self) -> Result<Vec<Sample>>;

    // === Device operations ===

    /// Save a device snapshot.
    async fn save_device(&mut self, device: &Device) -> Result<()>;

    /// Load a device by name.
    async fn load_device(&self, name: &str) -> Result<Option<Device>>;

    /// List all devices.
    async fn list_devices(&self) -> Result<Vec<Device>>;

    // === Experiment operations ===

    /// Save an experiment record.
    async fn save_experiment(&mut self, experiment: &Experiment) -> Result<()>;

    /// Load an experiment by ID.
    async fn load_experiment(&self, id: ExperimentId) -> Result<Option<Experiment>>;

    /// List all experiments.
    async fn list_experiments(&self) -> Result<Vec<Experiment>>;
}

/// Storage shared between the scheduler and the lab front end.
pub type SharedStorage = Arc<tokio::sync::Mutex<dyn Storage>>;

/// Wrap a backend for sharing.
pub fn shared<S: Storage + 'static>(storage: S) -> SharedStorage {
    Arc::new(tokio::sync::Mutex::new(storage))
}
