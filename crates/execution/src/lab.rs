//! Lab runtime: wires the registry, device bus, gateway, executor and
//! scheduler together from a [`LabConfig`], and exposes the operator
//! surface.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use labman_core::{
    ConfigError, Device, DeviceStatus, Experiment, ExperimentError, ExperimentId, ExperimentSpec,
    ExperimentStatus, LabConfig, PauseStatus, Task, TaskFilter, TaskId,
};
use labman_resources::{RegistryError, RegistrySnapshot, ResourceRegistry};
use labman_rpc::{
    AccessPolicy, DeviceBus, DeviceDriver, DeviceGateway, DeviceHost, PendingCallInfo, RpcError,
    SimulatedDevice,
};
use labman_storage::{shared, JsonStorage, SharedStorage, StorageError};
use labman_work::{TaskExecutor, TaskTypeRegistry};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{Scheduler, SchedulerHandle};
use crate::graph::{batch_cycle, GraphError, GraphStats};

/// Errors from lab setup and operator actions.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    /// Bad configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registry refused the action
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Device bus or gateway failure
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Graph edit rejected
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Malformed experiment
    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    /// No factory for a task type
    #[error("task {task} has unknown type {task_type}")]
    UnknownTaskType {
        /// Task key
        task: String,
        /// Type tag
        task_type: String,
    },
}

/// Point-in-time view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct LabStatus {
    /// Lab name
    pub name: String,
    /// Task counts
    pub tasks: GraphStats,
    /// Devices
    pub devices: Vec<Device>,
    /// Experiments
    pub experiments: Vec<Experiment>,
    /// Device calls in flight
    pub pending_calls: usize,
}

/// Lets a task operate only the devices it holds. Calls without a task are
/// maintenance calls and pass.
struct RegistryAccess {
    registry: Arc<ResourceRegistry>,
}

impl AccessPolicy for RegistryAccess {
    fn check(&self, device: &str, task: Option<TaskId>) -> Result<(), String> {
        let Some(task) = task else { return Ok(()) };
        match self.registry.device(device) {
            Some(d) if d.owner == Some(task) => Ok(()),
            Some(_) => Err(format!("device {} is not held by task {}", device, task)),
            None => Err(format!("unknown device {}", device)),
        }
    }
}

/// A running lab.
pub struct Lab {
    config: LabConfig,
    registry: Arc<ResourceRegistry>,
    bus: DeviceBus,
    gateway: DeviceGateway,
    scheduler: SchedulerHandle,
    storage: Option<SharedStorage>,
    shutdown: CancellationToken,
    hosts: Mutex<Vec<JoinHandle<()>>>,
    scheduler_task: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl Lab {
    /// Build a lab from `config`, opening the JSON store when
    /// `storage.root` is set. The returned scheduler is not running yet;
    /// pass it to [`Lab::start`] or drive it directly.
    pub async fn new(
        config: LabConfig,
        task_types: TaskTypeRegistry,
    ) -> Result<(Self, Scheduler), LabError> {
        let storage = match &config.storage.root {
            Some(root) => Some(shared(JsonStorage::new(root).await?)),
            None => None,
        };
        Self::with_storage(config, task_types, storage)
    }

    /// Build a lab over an explicit store.
    pub fn with_storage(
        config: LabConfig,
        task_types: TaskTypeRegistry,
        storage: Option<SharedStorage>,
    ) -> Result<(Self, Scheduler), LabError> {
        config.validate()?;
        let registry = Arc::new(ResourceRegistry::from_config(&config)?);
        let bus = DeviceBus::new(config.channel_name(), config.rpc.channel_capacity);
        let gateway = DeviceGateway::start(bus.clone(), config.rpc.clone())?;
        let (executor, events) = TaskExecutor::new(registry.clone(), gateway.clone());

        let mut scheduler =
            Scheduler::new(registry.clone(), executor, events, task_types, config.scheduler.clone());
        if let Some(storage) = &storage {
            scheduler = scheduler.with_storage(storage.clone());
        }

        let lab = Self {
            scheduler: scheduler.handle(),
            config,
            registry,
            bus,
            gateway,
            storage,
            shutdown: CancellationToken::new(),
            hosts: Mutex::new(Vec::new()),
            scheduler_task: Mutex::new(None),
        };

        if lab.config.general.sim_mode {
            let devices: Vec<(String, Vec<String>)> =
                lab.config.devices.iter().map(|d| (d.name.clone(), d.methods.clone())).collect();
            for (name, methods) in devices {
                lab.host_device(Arc::new(SimulatedDevice::new(name, methods)))?;
            }
        }

        info!(
            "Lab {} ready: {} devices on {}",
            lab.config.general.name,
            lab.config.devices.len(),
            lab.bus.name()
        );
        Ok((lab, scheduler))
    }

    /// Serve a device driver on the lab's bus. Calls are only accepted from
    /// the task currently holding the device.
    pub fn host_device(&self, driver: Arc<dyn DeviceDriver>) -> Result<(), LabError> {
        let name = driver.name().to_string();
        if self.registry.device(&name).is_none() {
            return Err(RegistryError::UnknownDevice(name).into());
        }
        let endpoint = self.bus.register(&name)?;
        let policy = Arc::new(RegistryAccess { registry: self.registry.clone() });
        let handle = DeviceHost::new(endpoint, driver)
            .with_policy(policy)
            .spawn(self.shutdown.child_token());
        self.hosts.lock().push(handle);
        Ok(())
    }

    /// Run the scheduling loop in the background until [`Lab::shutdown`].
    pub fn start(&self, scheduler: Scheduler) {
        let handle = tokio::spawn(scheduler.run(self.shutdown.clone()));
        *self.scheduler_task.lock() = Some(handle);
    }

    /// Stop the loop (running tasks end `STOPPED`), then the gateway and
    /// device hosts.
    pub async fn shutdown(&self) {
        info!("Lab {} shutting down", self.config.general.name);
        self.shutdown.cancel();

        let scheduler_task = self.scheduler_task.lock().take();
        if let Some(task) = scheduler_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Scheduler ended with error: {}", e),
                Err(e) => warn!("Scheduler task failed: {}", e),
            }
        }

        self.gateway.shutdown();
        let hosts: Vec<JoinHandle<()>> = std::mem::take(&mut *self.hosts.lock());
        for host in hosts {
            let _ = host.await;
        }
    }

    /// Admit an experiment: create its samples and tasks.
    ///
    /// Everything is checked first (structure, task types, cycles, sample
    /// positions); nothing is created when any check fails.
    pub async fn admit_experiment(&self, spec: ExperimentSpec) -> Result<ExperimentId, LabError> {
        spec.validate()?;
        for task in &spec.tasks {
            if !self.scheduler.knows_type(&task.task_type) {
                return Err(LabError::UnknownTaskType {
                    task: task.key.clone(),
                    task_type: task.task_type.clone(),
                });
            }
        }

        let experiment_id = ExperimentId::new();
        let ids: HashMap<&str, TaskId> =
            spec.tasks.iter().map(|t| (t.key.as_str(), TaskId::new())).collect();

        let mut tasks = Vec::with_capacity(spec.tasks.len());
        for ts in &spec.tasks {
            let mut task = Task::new(ts.task_type.clone())
                .with_priority(ts.priority)
                .with_parameters(ts.parameters.clone())
                .with_resources(ts.resources.clone())
                .after(ts.after.iter().filter_map(|k| ids.get(k.as_str()).copied()));
            task.id = ids[ts.key.as_str()];
            task.experiment = Some(experiment_id);
            tasks.push(task);
        }
        if let Some(cycle) = batch_cycle(&tasks) {
            return Err(GraphError::CycleDetected(cycle).into());
        }

        let mut placed = HashSet::new();
        for sample in &spec.samples {
            let Some(id) = &sample.position else { continue };
            let position = self
                .registry
                .position(id)
                .ok_or_else(|| RegistryError::UnknownPosition(id.to_string()))?;
            if position.sample.is_some() || !placed.insert(id.clone()) {
                return Err(RegistryError::PositionOccupied(id.clone()).into());
            }
        }

        let mut samples = HashMap::new();
        for sample in &spec.samples {
            let created =
                self.registry.create_sample(sample.name.clone(), sample.position.clone(), Some(experiment_id))?;
            samples.insert(sample.name.as_str(), created);
        }
        for (ts, task) in spec.tasks.iter().zip(tasks.iter_mut()) {
            task.samples = ts.samples.iter().filter_map(|s| samples.get(s.as_str()).map(|s| s.id)).collect();
        }

        let experiment = Experiment {
            id: experiment_id,
            name: spec.name.clone(),
            status: ExperimentStatus::Running,
            tasks: tasks.iter().map(|t| t.id).collect(),
            samples: samples.values().map(|s| s.id).collect(),
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        self.scheduler.admit_experiment(experiment.clone(), tasks)?;

        if let Some(storage) = &self.storage {
            let mut store = storage.lock().await;
            for sample in samples.values() {
                store.save_sample(sample).await?;
            }
            store.save_experiment(&experiment).await?;
        }

        info!(
            "Admitted experiment {} ({}): {} tasks, {} samples",
            spec.name,
            experiment_id,
            experiment.tasks.len(),
            experiment.samples.len()
        );
        Ok(experiment_id)
    }

    // === Tasks ===

    /// Cancel a task.
    pub fn cancel_task(&self, task: TaskId) -> Result<(), LabError> {
        Ok(self.scheduler.cancel(task)?)
    }

    /// Pause a running task.
    pub fn pause_task(&self, task: TaskId) -> Result<(), LabError> {
        Ok(self.scheduler.pause(task)?)
    }

    /// Resume a paused task.
    pub fn resume_task(&self, task: TaskId) -> Result<(), LabError> {
        Ok(self.scheduler.resume(task)?)
    }

    /// Replace a task's edges.
    pub fn update_dependency(
        &self,
        task: TaskId,
        predecessors: Vec<TaskId>,
        successors: Vec<TaskId>,
    ) -> Result<(), LabError> {
        Ok(self.scheduler.update_dependency(task, predecessors, successors)?)
    }

    /// Insert a task after `after`, taking over its pending successors.
    pub fn reroute(&self, after: TaskId, task: Task) -> Result<TaskId, LabError> {
        if !self.scheduler.knows_type(&task.task_type) {
            return Err(LabError::UnknownTaskType {
                task: task.id.to_string(),
                task_type: task.task_type.clone(),
            });
        }
        Ok(self.scheduler.reroute(after, task)?)
    }

    /// Task record.
    pub fn task(&self, task: TaskId) -> Option<Task> {
        self.scheduler.task(task)
    }

    /// Tasks matching `filter`.
    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.scheduler.tasks(filter)
    }

    /// Experiment record.
    pub fn experiment(&self, id: ExperimentId) -> Option<Experiment> {
        self.scheduler.experiment(id)
    }

    // === Devices ===

    /// Ask a device to pause. Returns `PAUSED` when it was free, otherwise
    /// `REQUESTED` until its holder releases it.
    pub fn pause_device(&self, name: &str) -> Result<PauseStatus, LabError> {
        Ok(self.registry.pause_request(name)?)
    }

    /// Clear a device's pause.
    pub fn release_device(&self, name: &str) -> Result<(), LabError> {
        Ok(self.registry.pause_release(name)?)
    }

    /// Pause every device for maintenance.
    pub fn pause_all_devices(&self) -> Vec<(String, PauseStatus)> {
        self.registry.pause_all()
    }

    /// Clear every pause.
    pub fn release_all_devices(&self) {
        self.registry.release_all_pauses()
    }

    /// Mark a device `ERROR` or `UNKNOWN`, or back to `IDLE`.
    pub fn set_device_status(&self, name: &str, status: DeviceStatus) -> Result<(), LabError> {
        Ok(self.registry.set_device_status(name, status)?)
    }

    // === Views ===

    /// Configuration the lab was built from.
    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Resource registry.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Device gateway.
    pub fn gateway(&self) -> &DeviceGateway {
        &self.gateway
    }

    /// Scheduler handle.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Device calls in flight.
    pub fn pending_calls(&self) -> Vec<PendingCallInfo> {
        self.gateway.pending_calls()
    }

    /// Devices, positions and samples.
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Summary for operators.
    pub fn status(&self) -> LabStatus {
        LabStatus {
            name: self.config.general.name.clone(),
            tasks: self.scheduler.stats(),
            devices: self.registry.devices(),
            experiments: self.scheduler.experiments(),
            pending_calls: self.gateway.pending_calls().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use labman_core::{PositionId, TaskStatus};
    use labman_storage::{MemoryStorage, Storage};
    use labman_work::builtin_task_types;

    const LAB: &str = r#"
        [general]
        name = "unit"
        sim_mode = true

        [[devices]]
        name = "furnace_1"
        type = "furnace"
        methods = ["heat"]
        [[devices.positions]]
        name = "tray"

        [[positions]]
        name = "rack"
        slots = 2

        [scheduler]
        tick_ms = 5
    "#;

    fn spec(json: serde_json::Value) -> ExperimentSpec {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn test_sim_experiment_runs() {
        let storage = shared(MemoryStorage::new());
        let config = LabConfig::from_toml(LAB).unwrap();
        let (lab, mut scheduler) =
            Lab::with_storage(config, builtin_task_types(), Some(storage.clone())).unwrap();
        assert_eq!(lab.bus.name(), "unit_sim.device_rpc");

        let id = lab
            .admit_experiment(spec(serde_json::json!({
                "name": "anneal",
                "samples": [{"name": "s1", "position": "rack/1"}],
                "tasks": [{
                    "key": "heat",
                    "task_type": "sequence",
                    "samples": ["s1"],
                    "resources": {
                        "devices": [{"selector": {"type": "furnace"}, "positions": [{"prefix": "tray"}]}],
                        "positions": [{"prefix": "rack/1"}]
                    },
                    "parameters": {"steps": [
                        {"op": "move", "to": "type:furnace/tray"},
                        {"op": "call", "device": "type:furnace", "method": "heat", "args": {"t": 600}}
                    ]}
                }]
            })))
            .await
            .unwrap();

        scheduler.run_until_idle(Duration::from_secs(5)).await.unwrap();

        let experiment = lab.experiment(id).unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Completed);
        let task = lab.task(experiment.tasks[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_ref().unwrap()["step_1"]["device"], "furnace_1");

        let sample = lab.registry().sample(experiment.samples[0]).unwrap();
        assert_eq!(sample.position, Some("furnace_1/tray/1".parse::<PositionId>().unwrap()));
        assert!(sample.owner.is_none());

        let stored = storage.lock().await.load_experiment(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExperimentStatus::Completed);
        lab.shutdown().await;
    }

    #[tokio::test]
    async fn test_admission_checks_before_creating() {
        let config = LabConfig::from_toml(LAB).unwrap();
        let (lab, _scheduler) = Lab::with_storage(config, builtin_task_types(), None).unwrap();

        let unknown_type = lab
            .admit_experiment(spec(serde_json::json!({
                "name": "x",
                "samples": [{"name": "s1", "position": "rack/1"}],
                "tasks": [{"key": "a", "task_type": "centrifuge"}]
            })))
            .await;
        assert!(matches!(unknown_type, Err(LabError::UnknownTaskType { .. })));

        let cyclic = lab
            .admit_experiment(spec(serde_json::json!({
                "name": "x",
                "samples": [{"name": "s1", "position": "rack/1"}],
                "tasks": [
                    {"key": "a", "task_type": "noop", "after": ["b"]},
                    {"key": "b", "task_type": "noop", "after": ["a"]}
                ]
            })))
            .await;
        assert!(matches!(cyclic, Err(LabError::Graph(GraphError::CycleDetected(_)))));

        let crowded = lab
            .admit_experiment(spec(serde_json::json!({
                "name": "x",
                "samples": [
                    {"name": "s1", "position": "rack/1"},
                    {"name": "s2", "position": "rack/1"}
                ],
                "tasks": [{"key": "a", "task_type": "noop"}]
            })))
            .await;
        assert!(matches!(crowded, Err(LabError::Registry(RegistryError::PositionOccupied(_)))));

        assert!(lab.registry().samples().is_empty());
        assert_eq!(lab.status().tasks.total, 0);
    }

    #[tokio::test]
    async fn test_device_pause_and_access() {
        let config = LabConfig::from_toml(LAB).unwrap();
        let (lab, _scheduler) = Lab::with_storage(config, builtin_task_types(), None).unwrap();

        assert_eq!(lab.pause_device("furnace_1").unwrap(), PauseStatus::Paused);
        lab.release_device("furnace_1").unwrap();
        assert!(lab.pause_device("nowhere").is_err());

        // a task that does not hold the device is refused by the host
        let outsider = TaskId::new();
        let reply = lab
            .gateway()
            .call("furnace_1", "heat", serde_json::json!({}), lab.gateway().default_timeout(), Some(outsider))
            .await
            .unwrap();
        assert!(!reply.is_success());

        // maintenance calls without a task pass
        let reply = lab
            .gateway()
            .call("furnace_1", "heat", serde_json::json!({}), lab.gateway().default_timeout(), None)
            .await
            .unwrap();
        assert!(reply.is_success());
        lab.shutdown().await;
    }
}
