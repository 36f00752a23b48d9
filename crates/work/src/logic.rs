//! Task logic trait and the task-type registry.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use labman_core::Task;

use crate::context::TaskContext;
use crate::error::TaskError;

/// User-supplied behaviour of one task type.
#[async_trait]
pub trait TaskLogic: Send + Sync {
    /// Check parameters before anything runs. A failure ends the task in
    /// `ERROR` without calling [`TaskLogic::run`].
    fn validate(&self) -> Result<(), TaskError> {
        Ok(())
    }

    /// Do the work. The returned value becomes the task result.
    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError>;
}

/// Builds the logic for a task record.
pub type TaskFactory = Arc<dyn Fn(&Task) -> Result<Box<dyn TaskLogic>, TaskError> + Send + Sync>;

/// Maps task-type tags to factories. Filled once at startup.
#[derive(Clone, Default)]
pub struct TaskTypeRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl TaskTypeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a type tag, replacing any previous one.
    pub fn register<F>(&mut self, task_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Task) -> Result<Box<dyn TaskLogic>, TaskError> + Send + Sync + 'static,
    {
        self.factories.insert(task_type.into(), Arc::new(factory));
        self
    }

    /// Builder form of [`TaskTypeRegistry::register`].
    pub fn with<F>(mut self, task_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Task) -> Result<Box<dyn TaskLogic>, TaskError> + Send + Sync + 'static,
    {
        self.register(task_type, factory);
        self
    }

    /// Whether a type tag is known.
    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build the logic for `task`.
    pub fn create(&self, task: &Task) -> Result<Box<dyn TaskLogic>, TaskError> {
        let factory = self
            .factories
            .get(&task.task_type)
            .ok_or_else(|| TaskError::InvalidParameter(format!("unknown task type {}", task.task_type)))?;
        factory(task)
    }
}
