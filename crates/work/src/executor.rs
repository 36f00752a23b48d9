//! Task execution.
//!
//! Each submitted task runs its logic as its own tokio task. The executor
//! watches for completion, cancellation and shutdown, and always returns the
//! task's locks to the registry before reporting the terminal outcome.

use std::collections::HashMap;
use std::sync::Arc;
use labman_core::{Task, TaskId, TaskStatus};
use labman_resources::{ResourceLock, ResourceRegistry};
use labman_rpc::DeviceGateway;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::logic::TaskLogic;

/// How a task run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Logic returned a result
    Completed(serde_json::Value),
    /// Logic failed, was invalid, or panicked
    Error(String),
    /// Cancelled by an operator
    Cancelled,
    /// Interrupted by shutdown
    Stopped,
}

impl TaskOutcome {
    /// Terminal task status for this outcome.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed(_) => TaskStatus::Completed,
            TaskOutcome::Error(_) => TaskStatus::Error,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
            TaskOutcome::Stopped => TaskStatus::Stopped,
        }
    }
}

/// Notifications from running tasks to the scheduling loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Progress message from task logic
    Message {
        /// Task
        task: TaskId,
        /// Message
        message: String,
    },
    /// The task ended and its lock has been released
    Finished {
        /// Task
        task: TaskId,
        /// Outcome
        outcome: TaskOutcome,
    },
}

struct RunningTask {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

/// Runs task logic off the scheduling loop.
#[derive(Clone)]
pub struct TaskExecutor {
    registry: Arc<ResourceRegistry>,
    gateway: DeviceGateway,
    events: mpsc::UnboundedSender<TaskEvent>,
    running: Arc<Mutex<HashMap<TaskId, RunningTask>>>,
    shutdown: CancellationToken,
}

impl TaskExecutor {
    /// Create an executor and the event stream it reports on.
    pub fn new(
        registry: Arc<ResourceRegistry>,
        gateway: DeviceGateway,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let executor = Self {
            registry,
            gateway,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        };
        (executor, rx)
    }

    /// Start `logic` for `task` holding `lock`.
    ///
    /// The task must already be `RUNNING`; the outcome arrives as a
    /// [`TaskEvent::Finished`].
    pub fn submit(&self, task: Task, lock: ResourceLock, logic: Box<dyn TaskLogic>) {
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);

        self.running
            .lock()
            .insert(task.id, RunningTask { cancel: cancel.clone(), pause: pause_tx });

        let ctx = Arc::new(TaskContext::new(
            task,
            lock,
            self.registry.clone(),
            self.gateway.clone(),
            self.events.clone(),
            cancel.clone(),
            self.shutdown.clone(),
            pause_rx,
        ));

        info!("Starting task {} ({})", ctx.task_id(), ctx.task().task_type);
        tokio::spawn(drive(self.clone(), ctx, logic, cancel));
    }

    /// Interrupt a running task and release its locks at once. The
    /// `Cancelled` outcome still arrives through the event stream.
    pub fn cancel(&self, task: TaskId) -> bool {
        let running = self.running.lock();
        let Some(entry) = running.get(&task) else {
            return false;
        };
        entry.cancel.cancel();
        self.registry.release_task(task);
        info!("Cancelled task {}", task);
        true
    }

    /// Hold a running task at its next checkpoint.
    pub fn pause(&self, task: TaskId) -> bool {
        self.set_paused(task, true)
    }

    /// Let a paused task continue.
    pub fn resume(&self, task: TaskId) -> bool {
        self.set_paused(task, false)
    }

    fn set_paused(&self, task: TaskId, paused: bool) -> bool {
        match self.running.lock().get(&task) {
            Some(entry) => {
                entry.pause.send_replace(paused);
                debug!("Task {} paused={}", task, paused);
                true
            }
            None => false,
        }
    }

    /// Interrupt every running task; they finish as `Stopped`.
    pub fn shutdown(&self) {
        info!("Stopping {} running tasks", self.running.lock().len());
        self.shutdown.cancel();
    }

    /// Whether a task is currently executing.
    pub fn is_running(&self, task: TaskId) -> bool {
        self.running.lock().contains_key(&task)
    }

    /// Tasks currently executing.
    pub fn running(&self) -> Vec<TaskId> {
        self.running.lock().keys().copied().collect()
    }
}

async fn drive(
    executor: TaskExecutor,
    ctx: Arc<TaskContext>,
    logic: Box<dyn TaskLogic>,
    cancel: CancellationToken,
) {
    let task_id = ctx.task_id();
    let registry = executor.registry.clone();

    let outcome = match claim_samples(&registry, &ctx).and_then(|()| logic.validate()) {
        Err(e) => {
            error!("Task {} rejected: {}", task_id, e);
            TaskOutcome::Error(e.to_string())
        }
        Ok(()) => {
            let run_ctx = ctx.clone();
            let mut handle = tokio::spawn(async move { logic.run(&run_ctx).await });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    handle.abort();
                    TaskOutcome::Cancelled
                }
                _ = executor.shutdown.cancelled() => {
                    handle.abort();
                    TaskOutcome::Stopped
                }
                joined = &mut handle => match joined {
                    Ok(Ok(value)) => TaskOutcome::Completed(merge_result(value, ctx.partial_result())),
                    Ok(Err(TaskError::Interrupted)) => {
                        if executor.shutdown.is_cancelled() {
                            TaskOutcome::Stopped
                        } else {
                            TaskOutcome::Cancelled
                        }
                    }
                    Ok(Err(e)) => {
                        error!("Task {} failed: {}", task_id, e);
                        TaskOutcome::Error(e.to_string())
                    }
                    Err(join) if join.is_panic() => {
                        error!("Task {} panicked", task_id);
                        TaskOutcome::Error("task logic panicked".to_string())
                    }
                    Err(_) => TaskOutcome::Cancelled,
                }
            }
        }
    };

    // Resources go back before anyone hears about the outcome.
    registry.release_task(task_id);
    for sample in ctx.samples() {
        if registry.is_owner(*sample, task_id) {
            if let Err(e) = registry.set_sample_owner(*sample, None) {
                debug!("Task {}: sample {} not returned: {}", task_id, sample, e);
            }
        }
    }
    executor.running.lock().remove(&task_id);

    info!("Task {} finished: {}", task_id, outcome.status());
    if executor.events.send(TaskEvent::Finished { task: task_id, outcome }).is_err() {
        debug!("Task {}: scheduler gone, outcome dropped", task_id);
    }
}

/// Take every sample of the task, refusing ones another task is processing.
fn claim_samples(registry: &ResourceRegistry, ctx: &TaskContext) -> Result<(), TaskError> {
    for sample in ctx.samples() {
        if let Err(e) = registry.claim_sample(*sample, ctx.task_id()) {
            warn!("Task {}: cannot take sample {}: {}", ctx.task_id(), sample, e);
            return Err(e.into());
        }
    }
    Ok(())
}

fn merge_result(
    value: serde_json::Value,
    partial: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Value {
    if partial.is_empty() {
        return value;
    }
    match value {
        serde_json::Value::Null => serde_json::Value::Object(partial),
        serde_json::Value::Object(mut map) => {
            for (k, v) in partial {
                map.entry(k).or_insert(v);
            }
            serde_json::Value::Object(map)
        }
        other => {
            let mut map = partial;
            map.insert("value".to_string(), other);
            serde_json::Value::Object(map)
        }
    }
}
