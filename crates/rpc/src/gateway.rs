//! Device RPC gateway: correlation-id futures over the device bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use labman_core::config::RpcConfig;
use labman_core::{CorrelationId, TaskId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::DeviceBus;
use crate::error::RpcError;
use crate::message::{CallReply, CallRequest, CallResult, CallStatus, ReplyStatus};
use crate::proxy::DeviceProxy;

type Responder = oneshot::Sender<Result<CallResult, RpcError>>;

struct PendingCall {
    device: String,
    method: String,
    status: CallStatus,
    created: Instant,
    last_updated: Instant,
    responder: Responder,
}

/// Drops the pending entry however the calling future ends.
struct PendingGuard<'a> {
    inner: &'a GatewayInner,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(call) = self.inner.pending.lock().remove(&self.correlation_id) {
            debug!("Abandoned call {}.{} ({})", call.device, call.method, self.correlation_id);
        }
    }
}

/// Snapshot of one outstanding call.
#[derive(Debug, Clone)]
pub struct PendingCallInfo {
    /// Correlation id
    pub correlation_id: CorrelationId,
    /// Device
    pub device: String,
    /// Method
    pub method: String,
    /// Pending or in progress
    pub status: CallStatus,
    /// Time since the call was sent
    pub age: Duration,
}

/// Relays method calls to device-control processes.
///
/// Cheap to clone; all clones share the pending-call table and the
/// background reply listener and stale sweeper.
#[derive(Clone)]
pub struct DeviceGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    bus: DeviceBus,
    config: RpcConfig,
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
    shutdown: CancellationToken,
}

impl DeviceGateway {
    /// Claim the bus's reply stream and start the listener and sweeper.
    /// Must be called inside a tokio runtime.
    pub fn start(bus: DeviceBus, config: RpcConfig) -> Result<Self, RpcError> {
        let replies = bus
            .take_replies()
            .ok_or_else(|| RpcError::ListenerTaken(bus.name().to_string()))?;

        let gateway = Self {
            inner: Arc::new(GatewayInner {
                bus,
                config,
                pending: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        };

        tokio::spawn(listen(gateway.inner.clone(), replies));
        tokio::spawn(sweep(gateway.inner.clone()));
        info!("Device gateway started on {}", gateway.inner.bus.name());
        Ok(gateway)
    }

    /// The bus this gateway sends on.
    pub fn bus(&self) -> &DeviceBus {
        &self.inner.bus
    }

    /// Timeout used by proxies unless overridden.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.default_timeout_ms)
    }

    /// Invoke `method` on `device` and wait for its final reply.
    pub async fn call(
        &self,
        device: &str,
        method: &str,
        args: serde_json::Value,
        timeout: Duration,
        task_id: Option<TaskId>,
    ) -> Result<CallResult, RpcError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::Shutdown);
        }
        let sender = self
            .inner
            .bus
            .sender(device)
            .ok_or_else(|| RpcError::DeviceUnavailable(device.to_string()))?;

        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.inner.pending.lock().insert(
            correlation_id,
            PendingCall {
                device: device.to_string(),
                method: method.to_string(),
                status: CallStatus::Pending,
                created: now,
                last_updated: now,
                responder: tx,
            },
        );
        let _guard = PendingGuard { inner: &self.inner, correlation_id };

        let request = CallRequest {
            device_name: device.to_string(),
            method_name: method.to_string(),
            args,
            correlation_id,
            task_id,
        };
        debug!("Calling {}.{} ({})", device, method, correlation_id);

        let exchange = async {
            sender
                .send(request)
                .await
                .map_err(|_| RpcError::ConnectionLost(device.to_string()))?;
            rx.await.map_err(|_| RpcError::Shutdown)?
        };

        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                device: device.to_string(),
                method: method.to_string(),
                timeout,
            }),
        };

        if let Err(err) = &outcome {
            warn!("Call {}.{} failed: {}", device, method, err);
        }
        outcome
    }

    /// Proxy for one device exposing its declared methods.
    pub fn proxy(&self, device: impl Into<String>, methods: Vec<String>) -> DeviceProxy {
        DeviceProxy::new(self.clone(), device.into(), methods, self.default_timeout())
    }

    /// Outstanding calls.
    pub fn pending_calls(&self) -> Vec<PendingCallInfo> {
        let now = Instant::now();
        self.inner
            .pending
            .lock()
            .iter()
            .map(|(id, call)| PendingCallInfo {
                correlation_id: *id,
                device: call.device.clone(),
                method: call.method.clone(),
                status: call.status,
                age: now.duration_since(call.created),
            })
            .collect()
    }

    /// Stop background tasks and fail every outstanding call.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<PendingCall> = self.inner.pending.lock().drain().map(|(_, c)| c).collect();
        for call in drained {
            let _ = call.responder.send(Err(RpcError::Shutdown));
        }
        info!("Device gateway shut down");
    }
}

async fn listen(inner: Arc<GatewayInner>, mut replies: mpsc::UnboundedReceiver<CallReply>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                debug!("Reply listener shutting down");
                break;
            }
            reply = replies.recv() => match reply {
                Some(reply) => handle_reply(&inner, reply),
                None => break,
            }
        }
    }
}

fn handle_reply(inner: &GatewayInner, reply: CallReply) {
    let mut pending = inner.pending.lock();
    match reply.status {
        ReplyStatus::InProgress => match pending.get_mut(&reply.correlation_id) {
            Some(call) => {
                call.status = CallStatus::InProgress;
                call.last_updated = Instant::now();
            }
            None => warn!("Dropping progress reply for unknown call {}", reply.correlation_id),
        },
        ReplyStatus::Success | ReplyStatus::Failure => match pending.remove(&reply.correlation_id) {
            Some(call) => {
                debug!("Call {}.{} finished: {:?}", call.device, call.method, reply.status);
                let _ = call.responder.send(Ok(reply.into()));
            }
            None => warn!("Dropping reply for unknown call {}", reply.correlation_id),
        },
    }
}

async fn sweep(inner: Arc<GatewayInner>) {
    let interval = Duration::from_millis(inner.config.sweep_interval_ms.max(1));
    let horizon = Duration::from_millis(inner.config.stale_after_ms);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                debug!("Stale-call sweeper shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let now = Instant::now();
                let stale: Vec<(CorrelationId, PendingCall)> = {
                    let mut pending = inner.pending.lock();
                    // Acknowledged calls are bounded by the caller's own timeout.
                    let ids: Vec<CorrelationId> = pending
                        .iter()
                        .filter(|(_, c)| {
                            c.status == CallStatus::Pending && now.duration_since(c.last_updated) > horizon
                        })
                        .map(|(id, _)| *id)
                        .collect();
                    ids.into_iter().filter_map(|id| pending.remove(&id).map(|c| (id, c))).collect()
                };
                for (id, call) in stale {
                    let age = now.duration_since(call.last_updated);
                    warn!("Call {}.{} ({}) stale after {:?}", call.device, call.method, id, age);
                    let _ = call.responder.send(Err(RpcError::Stale {
                        device: call.device,
                        method: call.method,
                        age,
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RpcConfig {
        RpcConfig {
            default_timeout_ms: 200,
            stale_after_ms: 60_000,
            sweep_interval_ms: 10,
            channel_capacity: 8,
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let bus = DeviceBus::new("test.device_rpc", 8);
        let mut endpoint = bus.register("furnace_1").unwrap();
        let gateway = DeviceGateway::start(bus, config()).unwrap();

        tokio::spawn(async move {
            while let Some(req) = endpoint.recv().await {
                endpoint.reply(CallReply::in_progress(req.correlation_id)).unwrap();
                endpoint
                    .reply(CallReply::success(req.correlation_id, req.args.clone()))
                    .unwrap();
            }
        });

        let result = gateway
            .call("furnace_1", "heat", serde_json::json!({"t": 600}), Duration::from_secs(1), None)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.result, Some(serde_json::json!({"t": 600})));
        assert!(gateway.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_device_failure_is_a_result() {
        let bus = DeviceBus::new("test.device_rpc", 8);
        let mut endpoint = bus.register("xrd").unwrap();
        let gateway = DeviceGateway::start(bus, config()).unwrap();

        tokio::spawn(async move {
            if let Some(req) = endpoint.recv().await {
                endpoint.reply(CallReply::failure(req.correlation_id, "shutter stuck")).unwrap();
            }
        });

        let result = gateway
            .call("xrd", "scan", serde_json::Value::Null, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(result.status, CallStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("shutter stuck"));
    }

    #[tokio::test]
    async fn test_unregistered_device() {
        let gateway = DeviceGateway::start(DeviceBus::new("test", 8), config()).unwrap();
        let err = gateway
            .call("ghost", "ping", serde_json::Value::Null, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::DeviceUnavailable("ghost".into()));
    }

    #[tokio::test]
    async fn test_timeout_when_device_never_replies() {
        let bus = DeviceBus::new("test", 8);
        let _endpoint = bus.register("slow").unwrap();
        let gateway = DeviceGateway::start(bus, config()).unwrap();

        let started = std::time::Instant::now();
        let err = gateway
            .call("slow", "heat", serde_json::Value::Null, Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(gateway.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_connection_lost() {
        let bus = DeviceBus::new("test", 8);
        let endpoint = bus.register("gone").unwrap();
        let gateway = DeviceGateway::start(bus, config()).unwrap();
        drop(endpoint);

        let err = gateway
            .call("gone", "ping", serde_json::Value::Null, Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::ConnectionLost("gone".into()));
    }

    #[tokio::test]
    async fn test_stale_call_is_failed() {
        let bus = DeviceBus::new("test", 8);
        let _endpoint = bus.register("quiet").unwrap();
        let gateway = DeviceGateway::start(
            bus,
            RpcConfig { stale_after_ms: 30, ..config() },
        )
        .unwrap();

        let err = gateway
            .call("quiet", "ping", serde_json::Value::Null, Duration::from_secs(5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Stale { .. }));
    }

    #[tokio::test]
    async fn test_acknowledged_call_is_not_stale() {
        let bus = DeviceBus::new("test", 8);
        let mut endpoint = bus.register("furnace").unwrap();
        let gateway = DeviceGateway::start(
            bus,
            RpcConfig { stale_after_ms: 50, ..config() },
        )
        .unwrap();

        tokio::spawn(async move {
            if let Some(req) = endpoint.recv().await {
                endpoint.reply(CallReply::in_progress(req.correlation_id)).unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
                endpoint.reply(CallReply::success(req.correlation_id, serde_json::json!("hot"))).unwrap();
            }
        });

        let result = gateway
            .call("furnace", "heat", serde_json::Value::Null, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(result.result, Some(serde_json::json!("hot")));
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_entry() {
        let bus = DeviceBus::new("test", 8);
        let _endpoint = bus.register("d").unwrap();
        let gateway = DeviceGateway::start(bus, config()).unwrap();

        let caller = gateway.clone();
        let call = tokio::spawn(async move {
            caller
                .call("d", "ping", serde_json::Value::Null, Duration::from_secs(5), None)
                .await
        });
        while gateway.pending_calls().is_empty() {
            tokio::task::yield_now().await;
        }
        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert!(gateway.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_fails_outstanding_calls() {
        let bus = DeviceBus::new("test", 8);
        let _endpoint = bus.register("d").unwrap();
        let gateway = DeviceGateway::start(bus, config()).unwrap();

        let caller = gateway.clone();
        let call = tokio::spawn(async move {
            caller
                .call("d", "ping", serde_json::Value::Null, Duration::from_secs(5), None)
                .await
        });
        while gateway.pending_calls().is_empty() {
            tokio::task::yield_now().await;
        }
        gateway.shutdown();
        assert_eq!(call.await.unwrap().unwrap_err(), RpcError::Shutdown);
    }

    #[tokio::test]
    async fn test_second_gateway_on_bus_is_rejected() {
        let bus = DeviceBus::new("test", 8);
        let _first = DeviceGateway::start(bus.clone(), config()).unwrap();
        assert!(matches!(
            DeviceGateway::start(bus, config()),
            Err(RpcError::ListenerTaken(_))
        ));
    }
}
