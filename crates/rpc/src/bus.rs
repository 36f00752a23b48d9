//! Named request channels per device plus one shared reply channel.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RpcError;
use crate::message::{CallReply, CallRequest};

/// Message bus connecting the gateway to device-control processes.
#[derive(Clone)]
pub struct DeviceBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    name: String,
    capacity: usize,
    devices: RwLock<HashMap<String, mpsc::Sender<CallRequest>>>,
    reply_tx: mpsc::UnboundedSender<CallReply>,
    reply_rx: Mutex<Option<mpsc::UnboundedReceiver<CallReply>>>,
}

impl DeviceBus {
    /// Create a bus. `capacity` bounds each device's request queue.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                capacity: capacity.max(1),
                devices: RwLock::new(HashMap::new()),
                reply_tx,
                reply_rx: Mutex::new(Some(reply_rx)),
            }),
        }
    }

    /// Bus name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Open the request channel of a device. A channel whose endpoint was
    /// dropped may be re-registered.
    pub fn register(&self, device: &str) -> Result<DeviceEndpoint, RpcError> {
        let mut devices = self.inner.devices.write();
        if devices.get(device).is_some_and(|tx| !tx.is_closed()) {
            return Err(RpcError::AlreadyRegistered(device.to_string()));
        }
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        devices.insert(device.to_string(), tx);
        debug!("Registered device {} on bus {}", device, self.inner.name);
        Ok(DeviceEndpoint {
            device: device.to_string(),
            requests: rx,
            replies: self.inner.reply_tx.clone(),
        })
    }

    /// Remove a device's request channel.
    pub fn unregister(&self, device: &str) -> bool {
        self.inner.devices.write().remove(device).is_some()
    }

    /// Whether a live channel exists for the device.
    pub fn is_registered(&self, device: &str) -> bool {
        self.inner
            .devices
            .read()
            .get(device)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub(crate) fn sender(&self, device: &str) -> Option<mpsc::Sender<CallRequest>> {
        self.inner.devices.read().get(device).cloned()
    }

    pub(crate) fn take_replies(&self) -> Option<mpsc::UnboundedReceiver<CallReply>> {
        self.inner.reply_rx.lock().take()
    }
}

/// The device side of a registered channel.
pub struct DeviceEndpoint {
    device: String,
    requests: mpsc::Receiver<CallRequest>,
    replies: mpsc::UnboundedSender<CallReply>,
}

impl DeviceEndpoint {
    /// Device served by this endpoint.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Next request, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<CallRequest> {
        self.requests.recv().await
    }

    /// Send a reply to the gateway.
    pub fn reply(&self, reply: CallReply) -> Result<(), RpcError> {
        self.replies
            .send(reply)
            .map_err(|_| RpcError::ConnectionLost(self.device.clone()))
    }
}
