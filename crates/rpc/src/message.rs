//! Wire contract between the gateway and device-control processes.

use labman_core::{CorrelationId, TaskId};
use serde::{Deserialize, Serialize};

/// A method invocation sent to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    /// Target device
    pub device_name: String,
    /// Method to invoke
    pub method_name: String,
    /// Arguments, passed through untouched
    pub args: serde_json::Value,
    /// Matches the reply to this request
    pub correlation_id: CorrelationId,
    /// Calling task, used by the device side for ownership checks
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

/// Reply status reported by the device side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Request accepted; a final reply follows
    InProgress,
    /// Method returned
    Success,
    /// Method raised or was refused
    Failure,
}

/// A reply from a device-control process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReply {
    /// Request being answered
    pub correlation_id: CorrelationId,
    /// Outcome
    pub status: ReplyStatus,
    /// Return value on success
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error payload on failure
    #[serde(default)]
    pub error: Option<String>,
}

impl CallReply {
    /// Acknowledge a request.
    pub fn in_progress(correlation_id: CorrelationId) -> Self {
        Self { correlation_id, status: ReplyStatus::InProgress, result: None, error: None }
    }

    /// Successful return.
    pub fn success(correlation_id: CorrelationId, result: serde_json::Value) -> Self {
        Self { correlation_id, status: ReplyStatus::Success, result: Some(result), error: None }
    }

    /// Device-side failure.
    pub fn failure(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self { correlation_id, status: ReplyStatus::Failure, result: None, error: Some(error.into()) }
    }
}

/// Tracking status of an outstanding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// Sent, not yet acknowledged
    Pending,
    /// Acknowledged by the device
    InProgress,
    /// Finished successfully
    Success,
    /// Finished with a failure
    Failure,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallStatus::Pending => write!(f, "PENDING"),
            CallStatus::InProgress => write!(f, "IN_PROGRESS"),
            CallStatus::Success => write!(f, "SUCCESS"),
            CallStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Final result of a call that reached the device.
///
/// A device-side failure is data here, not a transport error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    /// Request this answers
    pub correlation_id: CorrelationId,
    /// `Success` or `Failure`
    pub status: CallStatus,
    /// Return value
    pub result: Option<serde_json::Value>,
    /// Error payload
    pub error: Option<String>,
}

impl CallResult {
    /// Whether the device reported success.
    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Success
    }

    /// Value on success, error payload on failure.
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        if self.is_success() {
            Ok(self.result.unwrap_or(serde_json::Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| "device reported failure".to_string()))
        }
    }
}

impl From<CallReply> for CallResult {
    fn from(reply: CallReply) -> Self {
        let status = match reply.status {
            ReplyStatus::Success => CallStatus::Success,
            ReplyStatus::Failure | ReplyStatus::InProgress => CallStatus::Failure,
        };
        Self { correlation_id: reply.correlation_id, status, result: reply.result, error: reply.error }
    }
}
