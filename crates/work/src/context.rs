//! The handle task logic runs against.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use labman_core::{PositionId, ResourceRequest, Sample, SampleId, Task, TaskId};
use labman_resources::{RegistryError, ResourceLock, ResourceRegistry};
use labman_rpc::{DeviceGateway, DeviceProxy};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TaskError;
use crate::executor::TaskEvent;

/// How often a nested reservation retries while its resources are busy.
const RESOURCE_POLL: Duration = Duration::from_millis(50);

/// Resources reserved by running logic on top of the task's own lock.
///
/// Hand it back through [`TaskContext::release_resources`]; anything still
/// held when the task ends is released with the task.
pub struct ResourceGrant {
    lock: ResourceLock,
    devices: BTreeMap<String, DeviceProxy>,
}

impl ResourceGrant {
    /// Proxy for a device granted under a requirement key.
    pub fn device(&self, key: &str) -> Result<&DeviceProxy, TaskError> {
        self.devices
            .get(key)
            .ok_or_else(|| TaskError::InvalidParameter(format!("no device granted for {}", key)))
    }

    /// Positions granted under a requirement key.
    pub fn positions(&self, key: &str) -> &[PositionId] {
        self.lock.positions(key)
    }

    /// The underlying lock.
    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }
}

/// Everything a running task may touch: its granted devices and positions,
/// a message sink, and the interrupt and pause signals.
pub struct TaskContext {
    task: Task,
    lock: ResourceLock,
    devices: BTreeMap<String, DeviceProxy>,
    nested: Mutex<Vec<ResourceLock>>,
    registry: Arc<ResourceRegistry>,
    gateway: DeviceGateway,
    events: mpsc::UnboundedSender<TaskEvent>,
    cancel: CancellationToken,
    stop: CancellationToken,
    pause: watch::Receiver<bool>,
    result: Mutex<serde_json::Map<String, serde_json::Value>>,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task: Task,
        lock: ResourceLock,
        registry: Arc<ResourceRegistry>,
        gateway: DeviceGateway,
        events: mpsc::UnboundedSender<TaskEvent>,
        cancel: CancellationToken,
        stop: CancellationToken,
        pause: watch::Receiver<bool>,
    ) -> Self {
        let devices = grant_proxies(&registry, &gateway, &lock);
        Self {
            task,
            lock,
            devices,
            nested: Mutex::new(Vec::new()),
            registry,
            gateway,
            events,
            cancel,
            stop,
            pause,
            result: Mutex::new(serde_json::Map::new()),
        }
    }

    /// Running task id.
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// The task record as submitted.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Task parameters.
    pub fn parameters(&self) -> &serde_json::Value {
        &self.task.parameters
    }

    /// Samples the task processes.
    pub fn samples(&self) -> &[SampleId] {
        &self.task.samples
    }

    /// Proxy for the device granted under a requirement key (device name,
    /// or `type:<type>` for by-type requests).
    pub fn device(&self, key: &str) -> Result<&DeviceProxy, TaskError> {
        self.devices
            .get(key)
            .ok_or_else(|| TaskError::InvalidParameter(format!("no device granted for {}", key)))
    }

    /// All granted devices by requirement key.
    pub fn devices(&self) -> &BTreeMap<String, DeviceProxy> {
        &self.devices
    }

    /// Positions granted under a requirement key.
    pub fn positions(&self, key: &str) -> &[PositionId] {
        self.lock.positions(key)
    }

    /// Lock backing this run.
    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }

    /// Reserve more resources while running, waiting until they are free.
    ///
    /// Resources the task already holds are granted again without being
    /// claimed twice. Fails at once on requests that can never be met, and
    /// with [`TaskError::Interrupted`] if the task is cancelled meanwhile.
    pub async fn request_resources(&self, request: &ResourceRequest) -> Result<ResourceGrant, TaskError> {
        loop {
            self.checkpoint().await?;
            match self.registry.reserve_for(request, self.task.id, &self.task.samples) {
                Ok(lock) => {
                    if self.is_interrupted() {
                        self.registry.release(&lock);
                        return Err(TaskError::Interrupted);
                    }
                    debug!("Task {} took nested lock {}", self.task.id, lock.id);
                    self.nested.lock().push(lock.clone());
                    let devices = grant_proxies(&self.registry, &self.gateway, &lock);
                    return Ok(ResourceGrant { lock, devices });
                }
                Err(e) if e.is_would_block() => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(TaskError::Interrupted),
                        _ = self.stop.cancelled() => return Err(TaskError::Interrupted),
                        _ = tokio::time::sleep(RESOURCE_POLL) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Return a nested grant early. Returns false if it was already released.
    pub fn release_resources(&self, grant: ResourceGrant) -> bool {
        self.nested.lock().retain(|l| l.id != grant.lock.id);
        self.registry.release(&grant.lock)
    }

    fn holds_position(&self, position: &PositionId) -> bool {
        self.lock.holds_position(position) || self.nested.lock().iter().any(|l| l.holds_position(position))
    }

    /// Publish a progress message.
    pub fn report(&self, message: impl Into<String>) {
        let event = TaskEvent::Message { task: self.task.id, message: message.into() };
        if self.events.send(event).is_err() {
            debug!("Task {}: scheduler gone, message dropped", self.task.id);
        }
    }

    /// Record one entry of the result payload. Entries are merged into the
    /// value the logic returns.
    pub fn update_result(&self, key: impl Into<String>, value: serde_json::Value) {
        self.result.lock().insert(key.into(), value);
    }

    pub(crate) fn partial_result(&self) -> serde_json::Map<String, serde_json::Value> {
        self.result.lock().clone()
    }

    /// Move a sample into one of this task's granted positions.
    pub fn move_sample(&self, sample: SampleId, destination: &PositionId) -> Result<(), TaskError> {
        if !self.holds_position(destination) {
            return Err(RegistryError::NotLocked { position: destination.clone(), task: self.task.id }.into());
        }
        self.registry.move_sample(sample, destination, self.task.id)?;
        Ok(())
    }

    fn own_sample(&self, sample: SampleId) -> Result<(), TaskError> {
        if self.task.samples.contains(&sample) {
            Ok(())
        } else {
            Err(RegistryError::NotOwner { sample, task: self.task.id }.into())
        }
    }

    /// Current record of one of the task's samples.
    pub fn sample(&self, sample: SampleId) -> Result<Sample, TaskError> {
        self.own_sample(sample)?;
        self.registry
            .sample(sample)
            .ok_or_else(|| RegistryError::UnknownSample(sample).into())
    }

    /// Record a metadata entry on one of the task's samples.
    pub fn update_sample_metadata(
        &self,
        sample: SampleId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), TaskError> {
        self.own_sample(sample)?;
        self.registry.update_sample_metadata(sample, key, value)?;
        Ok(())
    }

    /// Whether the task has been cancelled or the lab is stopping.
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled() || self.stop.is_cancelled()
    }

    /// Cooperative yield point: waits while paused, fails once interrupted.
    pub async fn checkpoint(&self) -> Result<(), TaskError> {
        let mut pause = self.pause.clone();
        loop {
            if self.is_interrupted() {
                return Err(TaskError::Interrupted);
            }
            if !*pause.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TaskError::Interrupted),
                _ = self.stop.cancelled() => return Err(TaskError::Interrupted),
                changed = pause.changed() => {
                    if changed.is_err() {
                        return Err(TaskError::Interrupted);
                    }
                }
            }
        }
    }
}

fn grant_proxies(
    registry: &ResourceRegistry,
    gateway: &DeviceGateway,
    lock: &ResourceLock,
) -> BTreeMap<String, DeviceProxy> {
    lock.devices
        .iter()
        .map(|(key, granted)| {
            let methods = registry.device(&granted.name).map(|d| d.methods).unwrap_or_default();
            let proxy = gateway.proxy(granted.name.clone(), methods).for_task(lock.task_id);
            (key.clone(), proxy)
        })
        .collect()
}
