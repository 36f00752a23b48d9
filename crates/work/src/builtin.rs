//! Built-in task types.

use std::time::Duration;
use async_trait::async_trait;
use labman_core::Task;
use serde::Deserialize;

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::logic::{TaskLogic, TaskTypeRegistry};

/// One step of a [`Sequence`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Call a method on a granted device
    Call {
        /// Requirement key of the device
        device: String,
        /// Method
        method: String,
        /// Arguments
        #[serde(default)]
        args: serde_json::Value,
        /// Override the proxy timeout
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Move one of the task's samples into a granted position
    Move {
        /// Index into the task's samples
        #[serde(default)]
        sample: usize,
        /// Requirement key of the destination positions
        to: String,
        /// Which of the granted positions
        #[serde(default)]
        slot: usize,
    },
    /// Wait
    Sleep {
        /// Milliseconds
        ms: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct SequenceParams {
    steps: Vec<Step>,
}

/// Runs a list of device calls, sample moves and waits in order, checking
/// for pause and cancellation between steps. Each call's return value is
/// recorded under `step_<n>` in the result.
pub struct Sequence {
    steps: Vec<Step>,
}

impl Sequence {
    /// Task-type tag.
    pub const TYPE: &'static str = "sequence";

    /// Parse steps from task parameters.
    pub fn from_task(task: &Task) -> Result<Self, TaskError> {
        let params: SequenceParams = serde_json::from_value(task.parameters.clone())
            .map_err(|e| TaskError::InvalidParameter(format!("sequence steps: {}", e)))?;
        Ok(Self { steps: params.steps })
    }
}

#[async_trait]
impl TaskLogic for Sequence {
    fn validate(&self) -> Result<(), TaskError> {
        if self.steps.is_empty() {
            return Err(TaskError::InvalidParameter("sequence has no steps".to_string()));
        }
        Ok(())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
        for (n, step) in self.steps.iter().enumerate() {
            ctx.checkpoint().await?;
            match step {
                Step::Call { device, method, args, timeout_ms } => {
                    let proxy = ctx.device(device)?;
                    ctx.report(format!("{}.{}", proxy.name(), method));
                    let value = match timeout_ms {
                        Some(ms) => {
                            proxy
                                .call_with_timeout(method, args.clone(), Duration::from_millis(*ms))
                                .await?
                        }
                        None => proxy.call(method, args.clone()).await?,
                    };
                    ctx.update_result(format!("step_{}", n), value);
                }
                Step::Move { sample, to, slot } => {
                    let sample_id = *ctx.samples().get(*sample).ok_or_else(|| {
                        TaskError::InvalidParameter(format!("task has no sample #{}", sample))
                    })?;
                    let destination = ctx.positions(to).get(*slot).cloned().ok_or_else(|| {
                        TaskError::InvalidParameter(format!("no granted position {}[{}]", to, slot))
                    })?;
                    ctx.move_sample(sample_id, &destination)?;
                    ctx.report(format!("moved sample to {}", destination));
                }
                Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            }
        }
        Ok(serde_json::json!({ "steps": self.steps.len() }))
    }
}

/// Does nothing; useful for graph-only dry runs.
pub struct Noop;

impl Noop {
    /// Task-type tag.
    pub const TYPE: &'static str = "noop";
}

#[async_trait]
impl TaskLogic for Noop {
    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
        ctx.checkpoint().await?;
        Ok(serde_json::Value::Null)
    }
}

/// Registry with the built-in task types.
pub fn builtin_task_types() -> TaskTypeRegistry {
    TaskTypeRegistry::new()
        .with(Sequence::TYPE, |task| Ok(Box::new(Sequence::from_task(task)?)))
        .with(Noop::TYPE, |_| Ok(Box::new(Noop)))
}
