//! Task model - one node of an experiment's task graph.

use serde::{Deserialize, Serialize};
use crate::id::{ExperimentId, SampleId, TaskId};
use crate::request::ResourceRequest;
use crate::Time;

/// A unit of experiment work with declared resource needs and dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Owning experiment
    pub experiment: Option<ExperimentId>,

    /// Task type tag, resolved to logic through the task-type registry
    pub task_type: String,

    /// Declared priority
    pub priority: TaskPriority,

    /// Current status
    pub status: TaskStatus,

    /// Tasks that must complete first
    pub predecessors: Vec<TaskId>,

    /// Tasks waiting on this one
    pub successors: Vec<TaskId>,

    /// Resources to reserve before running
    pub resources: ResourceRequest,

    /// Samples this task processes
    pub samples: Vec<SampleId>,

    /// Parameters handed to the task logic
    pub parameters: serde_json::Value,

    /// Result payload on completion
    pub result: Option<serde_json::Value>,

    /// Last diagnostic or progress message
    pub message: String,

    /// Admission order, used as FIFO tie-break
    pub seq: u64,

    /// Creation timestamp
    pub created_at: Time,

    /// Set when the task starts running
    pub started_at: Option<Time>,

    /// Set when the task reaches a terminal status
    pub completed_at: Option<Time>,

    /// Last update timestamp
    pub updated_at: Time,
}

impl Task {
    /// Create a waiting task of the given type.
    pub fn new(task_type: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: TaskId::new(),
            experiment: None,
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Waiting,
            predecessors: Vec::new(),
            successors: Vec::new(),
            resources: ResourceRequest::default(),
            samples: Vec::new(),
            parameters: serde_json::Value::Null,
            result: None,
            message: String::new(),
            seq: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set resource request.
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Set parameters.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Add predecessors.
    pub fn after(mut self, predecessors: impl IntoIterator<Item = TaskId>) -> Self {
        for id in predecessors {
            if !self.predecessors.contains(&id) {
                self.predecessors.push(id);
            }
        }
        self
    }

    /// Move to `next`, stamping timestamps. Fails on an illegal transition.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { task: self.id, from: self.status, to: next });
        }
        let now = chrono::Utc::now();
        if next == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task}: illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Task
    pub task: TaskId,
    /// Current status
    pub from: TaskStatus,
    /// Requested status
    pub to: TaskStatus,
}

/// Task priority. Numeric values order scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work
    Low = 10,
    /// Default
    Normal = 20,
    /// Ahead of normal work
    High = 30,
    /// Ahead of everything but system work
    Urgent = 100,
    /// Reserved for lab maintenance
    System = 900,
}

impl TaskPriority {
    /// Numeric scheduling weight.
    pub fn value(self) -> u32 {
        self as u32
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Urgent => write!(f, "urgent"),
            TaskPriority::System => write!(f, "system"),
        }
    }
}

/// Task status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Some predecessor has not completed
    Waiting,
    /// All predecessors completed
    Ready,
    /// Waiting for a reservation to succeed
    RequestingResources,
    /// Logic executing
    Running,
    /// Running task held by an operator
    Paused,
    /// Finished successfully
    Completed,
    /// Failed, or a predecessor failed
    Error,
    /// Interrupted by lab shutdown
    Stopped,
    /// Cancelled explicitly, or a predecessor was cancelled
    Cancelled,
}

impl TaskStatus {
    /// No further transitions possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Stopped | TaskStatus::Cancelled
        )
    }

    /// Logic has started and may hold resources.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Paused)
    }

    /// Legal edges of the state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Waiting, Ready) | (Waiting, Error) | (Waiting, Cancelled) => true,
            (Ready, RequestingResources) | (Ready, Waiting) | (Ready, Error) | (Ready, Cancelled) => true,
            (RequestingResources, Running)
            | (RequestingResources, Error)
            | (RequestingResources, Cancelled)
            | (RequestingResources, Stopped) => true,
            (Running, Paused)
            | (Running, Completed)
            | (Running, Error)
            | (Running, Stopped)
            | (Running, Cancelled) => true,
            (Paused, Running)
            | (Paused, Completed)
            | (Paused, Error)
            | (Paused, Stopped)
            | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Ready => "READY",
            TaskStatus::RequestingResources => "REQUESTING_RESOURCES",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Stopped => "STOPPED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Filter for querying tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Filter by status
    pub status: Option<Vec<TaskStatus>>,

    /// Filter by experiment
    pub experiment: Option<ExperimentId>,

    /// Filter by minimum priority
    pub min_priority: Option<TaskPriority>,
}

impl TaskFilter {
    /// Whether `task` passes the filter.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(experiment) = self.experiment {
            if task.experiment != Some(experiment) {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::Urgent < TaskPriority::System);
        assert_eq!(TaskPriority::Urgent.value(), 100);
    }

    #[test]
    fn test_transitions() {
        let mut task = Task::new("heating");
        assert!(task.transition(TaskStatus::Running).is_err());
        task.transition(TaskStatus::Ready).unwrap();
        task.transition(TaskStatus::RequestingResources).unwrap();
        task.transition(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        task.transition(TaskStatus::Paused).unwrap();
        task.transition(TaskStatus::Running).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        assert!(task.completed_at.is_some());

        let err = task.transition(TaskStatus::Cancelled).unwrap_err();
        assert_eq!(err.from, TaskStatus::Completed);
    }

    #[test]
    fn test_filter() {
        let task = Task::new("heating").with_priority(TaskPriority::High);
        let filter = TaskFilter {
            status: Some(vec![TaskStatus::Waiting]),
            min_priority: Some(TaskPriority::Normal),
            ..Default::default()
        };
        assert!(filter.matches(&task));

        let filter = TaskFilter {
            min_priority: Some(TaskPriority::Urgent),
            ..Default::default()
        };
        assert!(!filter.matches(&task));
    }
}
