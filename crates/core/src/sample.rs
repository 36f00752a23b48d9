//! Samples and the positions that hold them.

use serde::{Deserialize, Serialize};
use crate::id::{ExperimentId, SampleId, TaskId};

/// Identity of a sample position: `prefix/slot`.
///
/// Device-hosted positions use `device/name` as prefix, standalone ones use
/// just `name`. Slots are numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PositionId {
    /// Everything before the slot number
    pub prefix: String,
    /// 1-based slot number
    pub slot: u32,
}

impl PositionId {
    /// Build a position id.
    pub fn new(prefix: impl Into<String>, slot: u32) -> Self {
        Self { prefix: prefix.into(), slot }
    }

    /// Path-segment aware prefix match: `rack/1` matches `rack/1` and
    /// `rack/1/2` but never `rack/10`.
    pub fn matches(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return false;
        }
        let full = self.to_string();
        full == prefix
            || full
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Device segment when the prefix has one (`device/name`).
    pub fn device(&self) -> Option<&str> {
        self.prefix.split_once('/').map(|(device, _)| device)
    }
}

impl std::fmt::Display for PositionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.prefix, self.slot)
    }
}

/// Error parsing a [`PositionId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid position id: {0}")]
pub struct ParsePositionError(pub String);

impl std::str::FromStr for PositionId {
    type Err = ParsePositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, slot) = s
            .rsplit_once('/')
            .ok_or_else(|| ParsePositionError(s.to_string()))?;
        let slot: u32 = slot.parse().map_err(|_| ParsePositionError(s.to_string()))?;
        if prefix.is_empty() || slot == 0 {
            return Err(ParsePositionError(s.to_string()));
        }
        Ok(Self::new(prefix, slot))
    }
}

impl From<PositionId> for String {
    fn from(id: PositionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PositionId {
    type Error = ParsePositionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Derived status of a sample position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// No sample, no lock
    Empty,
    /// Reserved by a task, no sample
    Locked,
    /// Holds a sample
    Occupied,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Empty => write!(f, "EMPTY"),
            PositionStatus::Locked => write!(f, "LOCKED"),
            PositionStatus::Occupied => write!(f, "OCCUPIED"),
        }
    }
}

/// A slot that can hold one sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplePosition {
    /// Identity
    pub id: PositionId,

    /// Hosting device; `None` for standalone positions
    pub device: Option<String>,

    /// Human readable description
    pub description: String,

    /// Task holding the lock
    pub locked_by: Option<TaskId>,

    /// Sample currently in the slot
    pub sample: Option<SampleId>,
}

impl SamplePosition {
    /// Create an empty position.
    pub fn new(id: PositionId, device: Option<String>) -> Self {
        Self {
            id,
            device,
            description: String::new(),
            locked_by: None,
            sample: None,
        }
    }

    /// Status derived from sample and lock.
    pub fn status(&self) -> PositionStatus {
        if self.sample.is_some() {
            PositionStatus::Occupied
        } else if self.locked_by.is_some() {
            PositionStatus::Locked
        } else {
            PositionStatus::Empty
        }
    }
}

/// A physical sample moving through the lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Unique identifier
    pub id: SampleId,

    /// Display name, unique within its experiment
    pub name: String,

    /// Experiment that created the sample
    pub experiment: Option<ExperimentId>,

    /// Current position
    pub position: Option<PositionId>,

    /// Task currently processing the sample
    pub owner: Option<TaskId>,

    /// Free-form metadata recorded by task logic
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Sample {
    /// Create an unplaced sample.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: SampleId::new(),
            name: name.into(),
            experiment: None,
            position: None,
            owner: None,
            metadata: serde_json::Map::new(),
        }
    }
}
