//! Thin per-device handle used by task logic.

use std::time::Duration;
use labman_core::TaskId;

use crate::error::DeviceError;
use crate::gateway::DeviceGateway;

/// A device as seen by task logic: its declared methods and nothing else.
#[derive(Clone)]
pub struct DeviceProxy {
    gateway: DeviceGateway,
    device: String,
    methods: Vec<String>,
    timeout: Duration,
    task_id: Option<TaskId>,
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProxy")
            .field("device", &self.device)
            .field("methods", &self.methods)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DeviceProxy {
    pub(crate) fn new(gateway: DeviceGateway, device: String, methods: Vec<String>, timeout: Duration) -> Self {
        Self { gateway, device, methods, timeout, task_id: None }
    }

    /// Tag calls with the calling task.
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Override the default timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.device
    }

    /// Declared methods.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Call a declared method with the default timeout.
    pub async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value, DeviceError> {
        self.call_with_timeout(method, args, self.timeout).await
    }

    /// Call a declared method with an explicit timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, DeviceError> {
        if !self.methods.iter().any(|m| m == method) {
            return Err(DeviceError::UnknownMethod {
                device: self.device.clone(),
                method: method.to_string(),
            });
        }
        let result = self
            .gateway
            .call(&self.device, method, args, timeout, self.task_id)
            .await?;
        result.into_result().map_err(|message| DeviceError::Remote {
            device: self.device.clone(),
            method: method.to_string(),
            message,
        })
    }
}
