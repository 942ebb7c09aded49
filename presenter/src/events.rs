//! The event surface: a tagged-variant type delivered over a multi-consumer
//! broadcast channel.

use std::time::Instant;

use tokio::sync::broadcast;

use crate::transport::DeviceId;

/// Default capacity of the broadcast channel's internal ring buffer. A slow
/// or absent listener simply starts missing the oldest events
/// (`broadcast::error::RecvError::Lagged`); the core never blocks on
/// delivery. Events are always fired outside any lock held by the publisher.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum PresenterEvent {
    FramePresented {
        buffer_index: usize,
        transfer_id: u8,
        metadata: Option<String>,
    },
    FrameDropped {
        buffer_index: Option<usize>,
        reason: String,
        metadata: Option<String>,
    },
    SwapChainError {
        reason: String,
        context: String,
    },
    BufferStatusChanged {
        total: usize,
        available: usize,
        devices: usize,
    },
    VsyncOccurred {
        timestamp: Instant,
        refresh_hz: u32,
    },
    RealtimeModeChanged {
        enabled: bool,
        success_count: usize,
        total: usize,
    },
    QueueStatusChanged {
        current_size: usize,
        max_size: usize,
    },
    QueueMonitorUpdate {
        size: usize,
        has_data: bool,
        realtime_on: bool,
        processing_on: bool,
        idle_duration_ms: u64,
    },
    TransmissionError {
        reason: String,
        context: String,
    },
    DeviceConnected(DeviceId),
    DeviceDisconnected(DeviceId),
    DeviceError(DeviceId, String),
}

/// Thin wrapper around a [`broadcast::Sender`] so call sites don't need to
/// think about the "send fails when there are no receivers" case, which is
/// not an error from the publisher's point of view.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PresenterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenterEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Must be called outside of any lock held by the
    /// caller.
    pub fn publish(&self, event: PresenterEvent) {
        // A `SendError` here only means nobody is listening right now.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
