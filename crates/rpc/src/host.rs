//! Device-control side: drivers served over a bus endpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use labman_core::TaskId;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::DeviceEndpoint;
use crate::message::{CallReply, CallRequest};

/// A device driver running in a device-control process.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Device name.
    fn name(&self) -> &str;

    /// Methods the driver accepts.
    fn methods(&self) -> Vec<String>;

    /// Run one method.
    async fn invoke(&self, method: &str, args: &serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// Decides whether a task may operate a device.
pub trait AccessPolicy: Send + Sync {
    /// `Err` carries the refusal reason sent back as a failure.
    fn check(&self, device: &str, task: Option<TaskId>) -> Result<(), String>;
}

/// Serves one driver on one endpoint, a request at a time.
pub struct DeviceHost {
    endpoint: DeviceEndpoint,
    driver: Arc<dyn DeviceDriver>,
    policy: Option<Arc<dyn AccessPolicy>>,
}

impl DeviceHost {
    /// Create a host.
    pub fn new(endpoint: DeviceEndpoint, driver: Arc<dyn DeviceDriver>) -> Self {
        Self { endpoint, driver, policy: None }
    }

    /// Refuse calls the policy rejects.
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Spawn [`DeviceHost::serve`] on the runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.serve(shutdown))
    }

    /// Answer requests until the bus closes or `shutdown` fires.
    pub async fn serve(mut self, shutdown: CancellationToken) {
        info!("Device host for {} started", self.endpoint.device());
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = self.endpoint.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let reply = tokio::select! {
                _ = shutdown.cancelled() => break,
                reply = self.handle(request) => reply,
            };
            if self.endpoint.reply(reply).is_err() {
                warn!("Gateway for {} went away", self.endpoint.device());
                break;
            }
        }
        info!("Device host for {} stopped", self.endpoint.device());
    }

    async fn handle(&self, request: CallRequest) -> CallReply {
        let id = request.correlation_id;
        let _ = self.endpoint.reply(CallReply::in_progress(id));

        if let Some(policy) = &self.policy {
            if let Err(reason) = policy.check(&request.device_name, request.task_id) {
                return CallReply::failure(id, reason);
            }
        }
        if !self.driver.methods().iter().any(|m| *m == request.method_name) {
            return CallReply::failure(
                id,
                format!("{} has no method {}", request.device_name, request.method_name),
            );
        }

        debug!("{} running {}", request.device_name, request.method_name);
        match self.driver.invoke(&request.method_name, &request.args).await {
            Ok(value) => CallReply::success(id, value),
            Err(err) => CallReply::failure(id, format!("{:#}", err)),
        }
    }
}

/// A driver that answers without hardware, for dry runs and tests.
///
/// Every method echoes its arguments after an optional delay. Methods can be
/// marked as failing or as never returning.
pub struct SimulatedDevice {
    name: String,
    methods: Vec<String>,
    delay: Duration,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl SimulatedDevice {
    /// Simulate `name` with the given methods.
    pub fn new(name: impl Into<String>, methods: Vec<String>) -> Self {
        Self {
            name: name.into(),
            methods,
            delay: Duration::ZERO,
            failing: HashSet::new(),
            hanging: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Wait this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `method` always fails.
    pub fn failing(mut self, method: impl Into<String>) -> Self {
        self.failing.insert(method.into());
        self
    }

    /// `method` never returns.
    pub fn hanging(mut self, method: impl Into<String>) -> Self {
        self.hanging.insert(method.into());
        self
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> Vec<String> {
        self.methods.clone()
    }

    async fn invoke(&self, method: &str, args: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.calls.lock().push((method.to_string(), args.clone()));
        if self.hanging.contains(method) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(method) {
            anyhow::bail!("simulated failure of {}.{}", self.name, method);
        }
        Ok(serde_json::json!({ "device": self.name, "method": method, "args": args }))
    }
}
