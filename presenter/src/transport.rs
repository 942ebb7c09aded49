//! The HID transport contract.
//!
//! This module defines only the narrow surface the presentation pipeline
//! consumes. Actually writing bytes to a USB endpoint, enumerating devices,
//! and encoding image payloads are out of scope and live in whatever
//! implements [`Transport`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::broadcast;

/// Opaque device identifier. The transport owns the enumeration scheme; the
/// core only ever treats this as an equality key.
pub type DeviceId = u32;

/// Fan-out result of a transport call: one success flag per device that was
/// addressed.
pub type DeviceResultMap = HashMap<DeviceId, bool>;

/// Events the transport may emit outside of a direct call's return value.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected(DeviceId),
    Disconnected(DeviceId),
    /// `reason` is the transport's own error message; the core never
    /// downcasts or inspects it beyond logging and forwarding.
    Error(DeviceId, String),
}

/// The HID transport, consumed by the presentation pipeline.
///
/// Implementations MUST tolerate `transfer_data` being invoked concurrently
/// with device connect/disconnect/error events: the core does not serialize
/// transport calls against the device event stream, only against itself (at
/// most one in-flight `transfer_data`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fan-out write of `bytes` tagged with `transfer_id` to every known
    /// device. `transfer_id` is always in `[1, 59]`.
    async fn transfer_data(&self, bytes: &[u8], transfer_id: u8) -> DeviceResultMap;

    /// Toggle the device-side "accept a continuous stream of framebuffer
    /// updates" mode.
    async fn set_realtime_mode(&self, enable: bool) -> DeviceResultMap;

    /// Number of devices this transport currently knows about. Used only to
    /// populate `BufferStatusChanged`/`RealtimeModeChanged` event payloads;
    /// the core never branches on this count itself.
    fn device_count(&self) -> usize;

    /// Out-of-band device connect/disconnect/error notifications, forwarded
    /// onto the presenter's own event bus as
    /// `DeviceConnected`/`DeviceDisconnected`/`DeviceError`. Transports with
    /// nothing to report can rely on the default, which yields a channel
    /// that is already closed.
    fn subscribe_device_events(&self) -> broadcast::Receiver<DeviceEvent> {
        let (_tx, rx) = broadcast::channel(1);
        rx
    }
}

/// At least one `true` in the map counts as a sent frame: success on any
/// single device is enough for the core to count a frame as sent.
pub fn any_device_succeeded(results: &DeviceResultMap) -> bool {
    results.values().any(|&ok| ok)
}

/// Count of devices that acknowledged, used for `RealtimeModeChanged`'s
/// `(success_count, total_devices)` payload.
pub fn success_count(results: &DeviceResultMap) -> usize {
    results.values().filter(|&&ok| ok).count()
}

/// Invokes a transport future, catching panics and mapping them to "every
/// device failed" so a misbehaving implementation can't take the
/// dispatcher down with it.
pub async fn call_guarded<F>(fut: F) -> DeviceResultMap
where
    F: std::future::Future<Output = DeviceResultMap>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(results) => results,
        Err(_) => DeviceResultMap::new(),
    }
}
