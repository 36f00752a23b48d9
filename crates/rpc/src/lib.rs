//! Device RPC gateway for LabMan.
//!
//! Task logic never talks to hardware directly. Calls travel as
//! [`CallRequest`] messages on a per-device channel of a [`DeviceBus`];
//! device-control processes answer with [`CallReply`] messages on a shared
//! reply channel, matched back to the waiting caller by correlation id.

#![warn(missing_docs)]

pub mod message;
pub mod error;
pub mod bus;
pub mod gateway;
pub mod proxy;
pub mod host;

pub use message::{CallReply, CallRequest, CallResult, CallStatus, ReplyStatus};
pub use error::{DeviceError, RpcError};
pub use bus::{DeviceBus, DeviceEndpoint};
pub use gateway::{DeviceGateway, PendingCallInfo};
pub use proxy::DeviceProxy;
pub use host::{AccessPolicy, DeviceDriver, DeviceHost, SimulatedDevice};
