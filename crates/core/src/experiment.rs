//! Experiment documents and records.

use std::collections::HashSet;
use serde::{Deserialize, Serialize};
use crate::id::{ExperimentId, SampleId, TaskId};
use crate::request::ResourceRequest;
use crate::sample::PositionId;
use crate::task::TaskPriority;
use crate::Time;

/// Structured experiment submission: samples plus a task graph whose edges
/// refer to task keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Experiment name
    pub name: String,

    /// Samples created on admission
    #[serde(default)]
    pub samples: Vec<SampleSpec>,

    /// Tasks, in any order
    pub tasks: Vec<TaskSpec>,
}

/// A sample to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSpec {
    /// Name, unique within the experiment
    pub name: String,

    /// Initial position
    #[serde(default)]
    pub position: Option<PositionId>,
}

/// A task node keyed for edge references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Key, unique within the experiment
    pub key: String,

    /// Task type tag
    pub task_type: String,

    /// Priority
    #[serde(default)]
    pub priority: TaskPriority,

    /// Logic parameters
    #[serde(default)]
    pub parameters: serde_json::Value,

    /// Resources to reserve
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Names of samples the task processes
    #[serde(default)]
    pub samples: Vec<String>,

    /// Keys of predecessor tasks
    #[serde(default)]
    pub after: Vec<String>,
}

/// Structural problems in an experiment document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExperimentError {
    /// Experiment has no tasks
    #[error("experiment {0} has no tasks")]
    Empty(String),

    /// Two tasks share a key
    #[error("duplicate task key: {0}")]
    DuplicateTask(String),

    /// Two samples share a name
    #[error("duplicate sample name: {0}")]
    DuplicateSample(String),

    /// Edge to a task key that does not exist
    #[error("task {task} depends on unknown task {missing}")]
    UnknownTask {
        /// Referencing task
        task: String,
        /// Missing key
        missing: String,
    },

    /// Task refers to a sample that does not exist
    #[error("task {task} refers to unknown sample {missing}")]
    UnknownSample {
        /// Referencing task
        task: String,
        /// Missing sample name
        missing: String,
    },
}

impl ExperimentSpec {
    /// Check key uniqueness and references. Cycles are checked by the graph.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.tasks.is_empty() {
            return Err(ExperimentError::Empty(self.name.clone()));
        }

        let mut samples = HashSet::new();
        for sample in &self.samples {
            if !samples.insert(sample.name.as_str()) {
                return Err(ExperimentError::DuplicateSample(sample.name.clone()));
            }
        }

        let mut keys = HashSet::new();
        for task in &self.tasks {
            if !keys.insert(task.key.as_str()) {
                return Err(ExperimentError::DuplicateTask(task.key.clone()));
            }
        }

        for task in &self.tasks {
            if let Some(missing) = task.after.iter().find(|k| !keys.contains(k.as_str())) {
                return Err(ExperimentError::UnknownTask {
                    task: task.key.clone(),
                    missing: missing.clone(),
                });
            }
            if let Some(missing) = task.samples.iter().find(|s| !samples.contains(s.as_str())) {
                return Err(ExperimentError::UnknownSample {
                    task: task.key.clone(),
                    missing: missing.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Stored record of an admitted experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    /// Unique identifier
    pub id: ExperimentId,

    /// Name from the submission
    pub name: String,

    /// Overall status
    pub status: ExperimentStatus,

    /// Admitted tasks
    pub tasks: Vec<TaskId>,

    /// Created samples
    pub samples: Vec<SampleId>,

    /// Admission timestamp
    pub created_at: Time,

    /// Set once every task is terminal
    pub completed_at: Option<Time>,
}

/// Overall experiment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    /// Some task is not terminal
    Running,
    /// Every task completed
    Completed,
    /// Every task is terminal and at least one did not complete
    Error,
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentStatus::Running => write!(f, "RUNNING"),
            ExperimentStatus::Completed => write!(f, "COMPLETED"),
            ExperimentStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> ExperimentSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_validate_ok() {
        let exp = spec(
            r#"{
                "name": "synthesis",
                "samples": [{"name": "s1", "position": "rack/1"}],
                "tasks": [
                    {"key": "heat", "task_type": "heating", "samples": ["s1"]},
                    {"key": "xrd", "task_type": "diffraction", "after": ["heat"], "priority": "high"}
                ]
            }"#,
        );
        exp.validate().unwrap();
        assert_eq!(exp.tasks[1].priority, TaskPriority::High);
        assert_eq!(exp.samples[0].position, Some(PositionId::new("rack", 1)));
    }

    #[test]
    fn test_validate_unknown_edge() {
        let exp = spec(
            r#"{"name": "x", "tasks": [{"key": "a", "task_type": "t", "after": ["b"]}]}"#,
        );
        assert_eq!(
            exp.validate(),
            Err(ExperimentError::UnknownTask { task: "a".into(), missing: "b".into() })
        );
    }

    #[test]
    fn test_validate_duplicates() {
        let exp = spec(
            r#"{"name": "x", "tasks": [{"key": "a", "task_type": "t"}, {"key": "a", "task_type": "t"}]}"#,
        );
        assert_eq!(exp.validate(), Err(ExperimentError::DuplicateTask("a".into())));
    }
}
