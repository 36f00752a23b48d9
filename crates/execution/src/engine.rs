//! The scheduling loop.
//!
//! Each tick:
//! ```text
//! Drain executor events → Promote READY → Retry reservations → Persist
//! ```
//! Operators act through a cloneable [`SchedulerHandle`] that shares the
//! loop's state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use labman_core::config::SchedulerConfig;
use labman_core::{
    Experiment, ExperimentId, ExperimentStatus, Task, TaskFilter, TaskId, TaskStatus,
};
use labman_resources::ResourceRegistry;
use labman_storage::SharedStorage;
use labman_work::{TaskEvent, TaskExecutor, TaskLogic, TaskOutcome, TaskTypeRegistry};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::graph::{CancelOutcome, GraphError, GraphStats, TaskGraph};
use crate::selector::TaskSelector;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleResult {
    /// Tasks moved to `REQUESTING_RESOURCES`
    pub promoted: usize,
    /// Tasks granted their resources and started
    pub started: usize,
    /// Tasks still waiting on a reservation
    pub blocked: usize,
    /// Terminal outcomes received from the executor
    pub finished: usize,
}

/// [`Scheduler::run_until_idle`] gave up.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{pending} tasks still pending after {waited:?}")]
pub struct IdleTimeout {
    /// Non-terminal tasks left
    pub pending: usize,
    /// Time waited
    pub waited: Duration,
}

struct SchedulerState {
    graph: TaskGraph,
    selector: TaskSelector,
    logics: HashMap<TaskId, Box<dyn TaskLogic>>,
    experiments: HashMap<ExperimentId, Experiment>,
    dirty_experiments: Vec<ExperimentId>,
    resources_changed: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    registry: Arc<ResourceRegistry>,
    executor: TaskExecutor,
    task_types: TaskTypeRegistry,
    storage: Option<SharedStorage>,
    wake: Notify,
}

/// Owns the scheduling loop. Created once per lab; see [`Scheduler::run`].
pub struct Scheduler {
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    config: SchedulerConfig,
    cycles_run: u64,
}

impl Scheduler {
    /// Create a scheduler over `registry`, executing through `executor`.
    pub fn new(
        registry: Arc<ResourceRegistry>,
        executor: TaskExecutor,
        events: mpsc::UnboundedReceiver<TaskEvent>,
        task_types: TaskTypeRegistry,
        config: SchedulerConfig,
    ) -> Self {
        let state = SchedulerState {
            graph: TaskGraph::new(),
            selector: TaskSelector::new(config.aging_ticks),
            logics: HashMap::new(),
            experiments: HashMap::new(),
            dirty_experiments: Vec::new(),
            resources_changed: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                registry,
                executor,
                task_types,
                storage: None,
                wake: Notify::new(),
            }),
            events,
            config,
            cycles_run: 0,
        }
    }

    /// Write every state change through to `storage`.
    ///
    /// Must be called before any handle is taken.
    pub fn with_storage(mut self, storage: SharedStorage) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.storage = Some(storage);
        } else {
            warn!("Storage attached after handles were taken; ignoring");
        }
        self
    }

    /// Operator handle sharing this scheduler's state.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { shared: self.shared.clone() }
    }

    /// Ticks run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles_run
    }

    /// Run one scheduling pass.
    pub async fn tick(&mut self) -> CycleResult {
        let mut result = CycleResult::default();

        while let Ok(event) = self.events.try_recv() {
            if self.shared.handle_event(event) {
                result.finished += 1;
            }
        }

        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            result.promoted = self.shared.promote(state);
            let (started, blocked) = self.shared.acquire(state);
            result.started = started;
            result.blocked = blocked;
            self.shared.refresh_experiments(state);
        }

        self.shared.persist().await;
        self.cycles_run += 1;

        if result != CycleResult::default() {
            debug!("Cycle {}: {:?}", self.cycles_run, result);
        }
        result
    }

    /// Tick on every interval and executor event until `shutdown` fires, then
    /// stop running tasks.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Scheduler running (tick {}ms)", self.config.tick_ms);
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.shared.wake.notified() => {}
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.shared.handle_event(event);
                    }
                    None => break,
                },
            }
            self.tick().await;
        }

        self.stop().await;
        Ok(())
    }

    /// Tick until every admitted task is terminal.
    pub async fn run_until_idle(&mut self, timeout: Duration) -> Result<GraphStats, IdleTimeout> {
        let started = Instant::now();
        let deadline = started + timeout;
        let poll = Duration::from_millis(self.config.tick_ms.clamp(1, 50));

        loop {
            self.tick().await;
            let stats = self.shared.state.lock().graph.stats();
            if stats.pending() == 0 {
                return Ok(stats);
            }
            if Instant::now() >= deadline {
                return Err(IdleTimeout { pending: stats.pending(), waited: started.elapsed() });
            }

            tokio::select! {
                event = self.events.recv() => {
                    if let Some(event) = event {
                        self.shared.handle_event(event);
                    }
                }
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Interrupt running tasks and wait up to the grace period for them to
    /// report. Tasks still waiting on a reservation end `STOPPED`; tasks that
    /// never became eligible keep their status.
    pub async fn stop(&mut self) {
        info!("Scheduler stopping");
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            for task in state.graph.requesting_tasks().iter().map(|t| t.id).collect::<Vec<_>>() {
                state.logics.remove(&task);
                if let Err(e) = state.graph.finish(task, TaskStatus::Stopped, None, Some("lab stopped".into())) {
                    error!("Cannot stop task {}: {}", task, e);
                }
            }
        }
        self.shared.executor.shutdown();

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        let deadline = Instant::now() + grace;
        while !self.shared.state.lock().graph.active_tasks().is_empty() {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => {
                    self.shared.handle_event(event);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Tasks still running after {:?}; forcing STOPPED", grace);
                    break;
                }
            }
        }

        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            for task in state.graph.active_tasks() {
                let released = self.shared.registry.release_task(task);
                debug!("Force-released {} locks of task {}", released, task);
                if let Err(e) = state.graph.finish(task, TaskStatus::Stopped, None, Some("lab stopped".into())) {
                    error!("Cannot stop task {}: {}", task, e);
                }
            }
            state.resources_changed = true;
            self.shared.refresh_experiments(state);
        }
        self.shared.persist().await;
        info!("Scheduler stopped after {} cycles", self.cycles_run);
    }
}

impl Shared {
    /// Apply one executor event. Returns true for a terminal outcome.
    fn handle_event(&self, event: TaskEvent) -> bool {
        let mut state = self.state.lock();
        match event {
            TaskEvent::Message { task, message } => {
                debug!("Task {}: {}", task, message);
                if let Err(e) = state.graph.set_message(task, message) {
                    warn!("Message for unknown task: {}", e);
                }
                false
            }
            TaskEvent::Finished { task, outcome } => {
                let status = outcome.status();
                if status != TaskStatus::Completed {
                    let released = self.registry.release_task(task);
                    if released > 0 {
                        warn!("Task {} ended {} still holding {} locks", task, status, released);
                    }
                }
                let (result, message) = match outcome {
                    TaskOutcome::Completed(value) => (Some(value), None),
                    TaskOutcome::Error(message) => (None, Some(message)),
                    TaskOutcome::Cancelled => (None, Some("cancelled".to_string())),
                    TaskOutcome::Stopped => (None, Some("lab stopped".to_string())),
                };
                if let Err(e) = state.graph.finish(task, status, result, message) {
                    error!("Cannot record outcome of task {}: {}", task, e);
                }
                state.resources_changed = true;
                true
            }
        }
    }

    /// `READY` → `REQUESTING_RESOURCES`, building each task's logic on the
    /// way. A task whose logic cannot be built fails here.
    fn promote(&self, state: &mut SchedulerState) -> usize {
        let mut promoted = 0;
        for id in state.graph.ready_tasks() {
            let Some(task) = state.graph.get(id) else { continue };
            match self.task_types.create(task) {
                Ok(logic) => {
                    if let Err(e) = state.graph.begin_acquire(id) {
                        error!("Cannot promote task {}: {}", id, e);
                        continue;
                    }
                    state.logics.insert(id, logic);
                    promoted += 1;
                }
                Err(e) => {
                    error!("Task {} cannot be built: {}", id, e);
                    if let Err(e) = state.graph.finish(id, TaskStatus::Error, None, Some(e.to_string())) {
                        error!("Cannot fail task {}: {}", id, e);
                    }
                }
            }
        }
        promoted
    }

    /// Try to reserve for every requesting task. Returns (started, blocked).
    fn acquire(&self, state: &mut SchedulerState) -> (usize, usize) {
        let order = {
            let requesting = state.graph.requesting_tasks();
            state.selector.order(&requesting)
        };

        let (mut started, mut blocked) = (0, 0);
        for id in order {
            let Some(task) = state.graph.get(id).cloned() else { continue };

            match self.registry.reserve_for(&task.resources, id, &task.samples) {
                Ok(lock) => {
                    state.selector.clear(id);
                    let Some(logic) = state.logics.remove(&id) else {
                        self.registry.release(&lock);
                        error!("Task {} has no logic", id);
                        let _ = state.graph.finish(id, TaskStatus::Error, None, Some("no logic".into()));
                        continue;
                    };
                    if let Err(e) = state.graph.mark_running(id) {
                        self.registry.release(&lock);
                        error!("Cannot start task {}: {}", id, e);
                        continue;
                    }
                    let running = state.graph.get(id).cloned().unwrap_or(task);
                    self.executor.submit(running, lock, logic);
                    state.resources_changed = true;
                    started += 1;
                }
                Err(e) if e.is_would_block() => {
                    state.selector.record_blocked(&task);
                    debug!("Task {} waiting for resources: {}", id, e);
                    blocked += 1;
                }
                Err(e) => {
                    error!("Task {} can never be satisfied: {}", id, e);
                    state.selector.clear(id);
                    state.logics.remove(&id);
                    if let Err(e) = state.graph.finish(id, TaskStatus::Error, None, Some(e.to_string())) {
                        error!("Cannot fail task {}: {}", id, e);
                    }
                }
            }
        }
        (started, blocked)
    }

    /// Close experiments whose tasks are all terminal.
    fn refresh_experiments(&self, state: &mut SchedulerState) {
        let SchedulerState { graph, experiments, dirty_experiments, .. } = state;
        for experiment in experiments.values_mut() {
            if experiment.status != ExperimentStatus::Running {
                continue;
            }
            let tasks = graph.experiment_tasks(experiment.id);
            if !tasks.iter().all(|t| t.status.is_terminal()) {
                continue;
            }
            experiment.status = if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
                ExperimentStatus::Completed
            } else {
                ExperimentStatus::Error
            };
            experiment.completed_at = Some(chrono::Utc::now());
            info!("Experiment {} finished: {}", experiment.name, experiment.status);
            dirty_experiments.push(experiment.id);
        }
    }

    /// Write changed records to storage, if any is attached.
    async fn persist(&self) {
        let (tasks, experiments, devices, samples) = {
            let mut state = self.state.lock();
            let dirty = state.graph.take_dirty();
            let tasks: Vec<Task> = dirty.iter().filter_map(|id| state.graph.get(*id).cloned()).collect();
            let experiments: Vec<Experiment> = std::mem::take(&mut state.dirty_experiments)
                .iter()
                .filter_map(|id| state.experiments.get(id).cloned())
                .collect();
            let changed = std::mem::take(&mut state.resources_changed);
            let (devices, samples) = if changed {
                (self.registry.devices(), self.registry.samples())
            } else {
                (Vec::new(), Vec::new())
            };
            (tasks, experiments, devices, samples)
        };

        let Some(storage) = &self.storage else { return };
        let mut store = storage.lock().await;
        for task in &tasks {
            if let Err(e) = store.save_task(task).await {
                warn!("Failed to save task {}: {}", task.id, e);
            }
        }
        for experiment in &experiments {
            if let Err(e) = store.save_experiment(experiment).await {
                warn!("Failed to save experiment {}: {}", experiment.id, e);
            }
        }
        for device in &devices {
            if let Err(e) = store.save_device(device).await {
                warn!("Failed to save device {}: {}", device.name, e);
            }
        }
        for sample in &samples {
            if let Err(e) = store.save_sample(sample).await {
                warn!("Failed to save sample {}: {}", sample.id, e);
            }
        }
    }
}

/// Cloneable operator access to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Admit a batch of tasks. See [`TaskGraph::admit`].
    pub fn admit(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>, GraphError> {
        let ids = self.shared.state.lock().graph.admit(tasks)?;
        self.shared.wake.notify_one();
        Ok(ids)
    }

    /// Admit an experiment's tasks and track its completion.
    pub fn admit_experiment(&self, experiment: Experiment, tasks: Vec<Task>) -> Result<(), GraphError> {
        let mut state = self.shared.state.lock();
        state.graph.admit(tasks)?;
        state.dirty_experiments.push(experiment.id);
        state.experiments.insert(experiment.id, experiment);
        drop(state);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Cancel a task. Tasks that have not started end `CANCELLED` at once
    /// and are never granted resources; running tasks are interrupted and
    /// their lock released immediately.
    pub fn cancel(&self, task: TaskId) -> Result<(), GraphError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        match state.graph.cancel(task)? {
            CancelOutcome::Cancelled => {
                state.logics.remove(&task);
                state.selector.clear(task);
            }
            CancelOutcome::Interrupt => {
                if self.shared.executor.cancel(task) {
                    state.resources_changed = true;
                }
            }
        }
        drop(guard);
        info!("Cancelled task {}", task);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Hold a running task at its next checkpoint.
    pub fn pause(&self, task: TaskId) -> Result<(), GraphError> {
        self.shared.state.lock().graph.pause(task)?;
        self.shared.executor.pause(task);
        Ok(())
    }

    /// Let a paused task continue.
    pub fn resume(&self, task: TaskId) -> Result<(), GraphError> {
        self.shared.state.lock().graph.resume(task)?;
        self.shared.executor.resume(task);
        Ok(())
    }

    /// Replace a task's edges. See [`TaskGraph::update_dependency`].
    pub fn update_dependency(
        &self,
        task: TaskId,
        predecessors: Vec<TaskId>,
        successors: Vec<TaskId>,
    ) -> Result<(), GraphError> {
        self.shared.state.lock().graph.update_dependency(task, predecessors, successors)?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Insert a task after `after`. See [`TaskGraph::reroute`].
    pub fn reroute(&self, after: TaskId, task: Task) -> Result<TaskId, GraphError> {
        let id = self.shared.state.lock().graph.reroute(after, task)?;
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Task record.
    pub fn task(&self, task: TaskId) -> Option<Task> {
        self.shared.state.lock().graph.get(task).cloned()
    }

    /// Tasks matching `filter`, in admission order.
    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.shared.state.lock().graph.list(filter)
    }

    /// Experiment record.
    pub fn experiment(&self, id: ExperimentId) -> Option<Experiment> {
        self.shared.state.lock().experiments.get(&id).cloned()
    }

    /// All experiments.
    pub fn experiments(&self) -> Vec<Experiment> {
        let mut experiments: Vec<Experiment> =
            self.shared.state.lock().experiments.values().cloned().collect();
        experiments.sort_by_key(|e| e.created_at);
        experiments
    }

    /// Counts per status.
    pub fn stats(&self) -> GraphStats {
        self.shared.state.lock().graph.stats()
    }

    /// Whether a task type is known.
    pub fn knows_type(&self, task_type: &str) -> bool {
        self.shared.task_types.contains(task_type)
    }
}
