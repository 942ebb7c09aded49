//! The frame buffer pool and swap chain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::buffer::{BufferState, FrameBuffer};
use crate::error::PresenterError;
use crate::events::{EventBus, PresenterEvent};
use crate::stats::StatsAggregator;
use crate::transfer_id::TransferIdAllocator;
use crate::transport::{any_device_succeeded, call_guarded, success_count, Transport};

/// Disposal's best-effort `set_realtime_mode(false)` is never allowed to
/// block teardown past this ceiling.
const DISPOSAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Selects both the overflow policy for [`SwapChain::acquire_back_buffer`]
/// and (informationally, for `FlipDiscard`) the presentation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapChainMode {
    Discard,
    Sequential,
    FlipDiscard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentMode {
    Immediate,
    VSync,
    Adaptive,
}

#[derive(Debug, Clone)]
pub struct SwapChainConfig {
    pub buffer_count: u32,
    pub mode: SwapChainMode,
    pub present_mode: PresentMode,
    pub refresh_hz: u32,
}

impl Default for SwapChainConfig {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            mode: SwapChainMode::Discard,
            present_mode: PresentMode::Immediate,
            refresh_hz: 60,
        }
    }
}

impl SwapChainConfig {
    value_builder! { buffer_count, u32 }
    value_builder! { mode, SwapChainMode }
    value_builder! { present_mode, PresentMode }
    value_builder! { refresh_hz, u32 }

    pub fn validate(&self) -> Result<(), PresenterError> {
        if !(2..=4).contains(&self.buffer_count) {
            return Err(PresenterError::InvalidBufferCount(self.buffer_count));
        }
        if !(1..=120).contains(&self.refresh_hz) {
            return Err(PresenterError::InvalidRefreshRate(self.refresh_hz));
        }
        Ok(())
    }

    pub fn present_period(&self) -> Duration {
        Duration::from_millis(1000 / self.refresh_hz.max(1) as u64)
    }
}

/// A reference to a [`PresentRequest`]'s buffer in `PendingPresent`. At most
/// one exists per buffer at any time, enforced by construction:
/// [`SwapChain::present`] is the only way to create one, and it requires
/// exclusive ownership of a [`BackBuffer`].
#[derive(Debug, Clone)]
pub struct PresentRequest {
    pub buffer_index: usize,
    pub priority: i32,
    pub transfer_id: u8,
    pub request_time: Instant,
}

/// A frame buffer currently owned by the calling producer for writing.
/// Holding one is the type-level expression of the invariant that exactly
/// one buffer at a time may be in `Rendering` owned by any single producer
/// slot — the pool's copy of the payload is taken out for the duration, so
/// there is nothing left to race against.
pub struct BackBuffer {
    index: usize,
    payload: Vec<u8>,
    metadata: Option<String>,
}

impl BackBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.payload.clear();
        self.payload.extend_from_slice(bytes);
    }

    pub fn set_metadata(&mut self, metadata: impl Into<String>) {
        self.metadata = Some(metadata.into());
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

struct Inner {
    buffers: Vec<FrameBuffer>,
    present_queue: VecDeque<PresentRequest>,
    current_back_index: usize,
}

/// Buffer-state histogram plus the live statistics snapshot, returned by
/// [`SwapChain::get_statistics`].
#[derive(Debug, Clone)]
pub struct SwapChainStatistics {
    pub stats: crate::stats::StatsSnapshot,
    pub total: usize,
    pub available: usize,
    pub rendering: usize,
    pub pending_present: usize,
    pub presented: usize,
}

pub struct SwapChain {
    inner: Mutex<Inner>,
    available_cond: Condvar,

    transport: Arc<dyn Transport>,
    transfer_ids: TransferIdAllocator,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    config: SwapChainConfig,

    /// Single-permit semaphore serializing `present_immediate` against
    /// itself and, indirectly via [`Self::transport`], against the pacer's
    /// own at-most-one-in-flight rule.
    immediate_semaphore: Semaphore,

    stopping: Arc<AtomicBool>,
    disposed: AtomicBool,
}

impl SwapChain {
    pub fn new(
        config: SwapChainConfig,
        transport: Arc<dyn Transport>,
        events: EventBus,
        stats: Arc<StatsAggregator>,
    ) -> Result<Arc<Self>, PresenterError> {
        config.validate()?;

        let buffers = (0..config.buffer_count as usize).map(FrameBuffer::new).collect();

        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                buffers,
                present_queue: VecDeque::new(),
                current_back_index: 0,
            }),
            available_cond: Condvar::new(),
            transport,
            transfer_ids: TransferIdAllocator::default(),
            stats,
            events,
            config,
            immediate_semaphore: Semaphore::new(1),
            stopping: Arc::new(AtomicBool::new(false)),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SwapChainConfig {
        &self.config
    }

    pub(crate) fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn stopping_flag(&self) -> Arc<AtomicBool> {
        self.stopping.clone()
    }

    /// Allocates buffers (already done in `new`) and requests real-time
    /// display mode on every known device. Succeeds if at least one device
    /// acknowledged.
    pub async fn initialize(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        let results = call_guarded(self.transport.set_realtime_mode(true)).await;
        let ok = any_device_succeeded(&results);
        if ok {
            self.stats.record_realtime_enabled();
            self.events.publish(PresenterEvent::RealtimeModeChanged {
                enabled: true,
                success_count: success_count(&results),
                total: self.transport.device_count(),
            });
        }
        ok
    }

    /// Scans starting at the rolling `current_back_index` for an `Available`
    /// buffer, transitions it to `Rendering`, and returns it. Never blocks;
    /// applies the starvation policy and returns `None` if the pool is
    /// exhausted.
    pub fn acquire_back_buffer(&self) -> Option<BackBuffer> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let mut inner = self.inner.lock();
        let count = inner.buffers.len();
        let start = inner.current_back_index;

        for offset in 0..count {
            let idx = (start + offset) % count;
            if inner.buffers[idx].is_available() {
                inner.buffers[idx].acquire();
                inner.current_back_index = (idx + 1) % count;
                let metadata = inner.buffers[idx].metadata.take();
                let status = self.buffer_status_event(&inner);
                drop(inner);
                self.events.publish(status);
                return Some(BackBuffer { index: idx, payload: Vec::new(), metadata });
            }
        }

        self.apply_starvation_policy(&mut inner);
        None
    }

    /// Histogram used for [`PresenterEvent::BufferStatusChanged`], emitted
    /// whenever acquire/release/starvation changes the available count.
    fn buffer_status_event(&self, inner: &Inner) -> PresenterEvent {
        let available = inner.buffers.iter().filter(|b| b.is_available()).count();
        PresenterEvent::BufferStatusChanged {
            total: inner.buffers.len(),
            available,
            devices: self.transport.device_count(),
        }
    }

    fn apply_starvation_policy(&self, inner: &mut Inner) {
        match self.config.mode {
            SwapChainMode::Sequential => {
                // Caller must retry later; nothing to reclaim.
            }
            SwapChainMode::Discard | SwapChainMode::FlipDiscard => {
                let oldest = inner
                    .buffers
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| !b.is_available())
                    .min_by_key(|(_, b)| b.acquired_at.unwrap_or(b.created_at))
                    .map(|(idx, _)| idx);

                if let Some(idx) = oldest {
                    inner.buffers[idx].release();
                    self.stats.record_dropped();
                    let buffer_index = idx;
                    let events = self.events.clone();
                    drop_buffer_from_queue(inner, idx);
                    let status = self.buffer_status_event(inner);
                    events.publish(PresenterEvent::FrameDropped {
                        buffer_index: Some(buffer_index),
                        reason: "buffer starvation".into(),
                        metadata: None,
                    });
                    events.publish(status);
                    self.available_cond.notify_one();
                }
            }
        }
    }

    /// Requires the buffer to still be `Rendering` with a non-empty
    /// payload. Transitions it to `PendingPresent`, assigns a transfer id,
    /// and enqueues a [`PresentRequest`]. Rejects with `false` on contract
    /// violation without mutating pool state beyond restoring the payload
    /// the caller handed back.
    pub fn present(&self, mut buffer: BackBuffer, priority: i32) -> bool {
        if self.index_out_of_range(buffer.index) {
            self.emit_swapchain_error("present", "buffer index out of range for this swap chain");
            return false;
        }

        if buffer.payload.is_empty() {
            warn!(index = buffer.index, "rejected present of empty payload");
            let mut inner = self.inner.lock();
            inner.buffers[buffer.index].payload = std::mem::take(&mut buffer.payload);
            inner.buffers[buffer.index].metadata = buffer.metadata.take();
            return false;
        }

        let transfer_id = self.transfer_ids.alloc();
        let queue_len;
        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.buffers[buffer.index];
            slot.payload = std::mem::take(&mut buffer.payload);
            slot.metadata = buffer.metadata.take();
            slot.mark_pending_present();

            inner.present_queue.push_back(PresentRequest {
                buffer_index: buffer.index,
                priority,
                transfer_id,
                request_time: Instant::now(),
            });
            queue_len = inner.present_queue.len();
        }

        self.stats.record_queued();
        self.events.publish(PresenterEvent::QueueStatusChanged {
            current_size: queue_len,
            max_size: self.config.buffer_count as usize,
        });
        true
    }

    /// Bypasses the present queue entirely under the single-permit
    /// semaphore, dispatching the transport call synchronously from the
    /// caller's perspective.
    pub async fn present_immediate(&self, mut buffer: BackBuffer, metadata: Option<String>) -> bool {
        if self.index_out_of_range(buffer.index) {
            self.emit_swapchain_error("present_immediate", "buffer index out of range for this swap chain");
            return false;
        }
        if buffer.payload.is_empty() {
            return false;
        }
        let _permit = self.immediate_semaphore.acquire().await.expect("semaphore not closed");

        let transfer_id = self.transfer_ids.alloc();
        self.stats.record_present_attempt();
        let results = call_guarded(self.transport.transfer_data(&buffer.payload, transfer_id)).await;

        if any_device_succeeded(&results) {
            {
                let mut inner = self.inner.lock();
                let slot = &mut inner.buffers[buffer.index];
                slot.payload = std::mem::take(&mut buffer.payload);
                slot.mark_pending_present();
                slot.mark_presented();
                slot.release();
            }
            self.available_cond.notify_one();
            self.stats.record_presented();
            self.stats.record_sent();
            self.events.publish(PresenterEvent::FramePresented {
                buffer_index: buffer.index,
                transfer_id,
                metadata,
            });
            true
        } else {
            self.release_index(buffer.index);
            self.stats.record_dropped();
            self.events.publish(PresenterEvent::FrameDropped {
                buffer_index: Some(buffer.index),
                reason: "immediate present failed".into(),
                metadata,
            });
            false
        }
    }

    /// Forces `Available`, clears the payload, and wakes
    /// [`Self::wait_for_available`] waiters. Producer-abort path; consumes
    /// the [`BackBuffer`] so it cannot be presented afterwards.
    pub fn release(&self, buffer: BackBuffer) {
        self.release_index(buffer.index);
    }

    pub(crate) fn release_index(&self, index: usize) {
        if self.index_out_of_range(index) {
            self.emit_swapchain_error("release", "buffer index out of range for this swap chain");
            return;
        }
        let status;
        {
            let mut inner = self.inner.lock();
            inner.buffers[index].release();
            status = self.buffer_status_event(&inner);
        }
        self.available_cond.notify_one();
        self.events.publish(status);
    }

    fn index_out_of_range(&self, index: usize) -> bool {
        index >= self.inner.lock().buffers.len()
    }

    /// Logs and publishes [`PresenterEvent::SwapChainError`] for internal
    /// contract violations that can't be represented by a simple `false`
    /// return — e.g. a [`BackBuffer`] presented/released against a
    /// different swap chain instance than the one that issued it.
    fn emit_swapchain_error(&self, context: &str, reason: &str) {
        warn!(context, reason, "swap chain error");
        self.events.publish(PresenterEvent::SwapChainError {
            reason: reason.into(),
            context: context.into(),
        });
    }

    /// Waits for the buffer-available signal. Does NOT guarantee
    /// acquisition afterwards — another waiter may win the race.
    pub fn wait_for_available(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.buffers.iter().any(FrameBuffer::is_available) {
            return true;
        }
        let result = self.available_cond.wait_for(&mut inner, timeout);
        !result.timed_out()
    }

    pub fn get_statistics(&self) -> SwapChainStatistics {
        let inner = self.inner.lock();
        let mut available = 0;
        let mut rendering = 0;
        let mut pending_present = 0;
        let mut presented = 0;
        for buffer in &inner.buffers {
            match buffer.state {
                BufferState::Available => available += 1,
                BufferState::Rendering => rendering += 1,
                BufferState::PendingPresent => pending_present += 1,
                BufferState::Presented => presented += 1,
            }
        }
        SwapChainStatistics {
            stats: self.stats.snapshot(),
            total: inner.buffers.len(),
            available,
            rendering,
            pending_present,
            presented,
        }
    }

    /// Pops at most one [`PresentRequest`] for the pacer to dispatch.
    /// Priority is advisory-FIFO: requests are served in enqueue order
    /// unless a higher-priority request is waiting, in which case it is
    /// served first.
    pub(crate) fn dequeue_present(&self) -> Option<PresentRequest> {
        let mut inner = self.inner.lock();
        if inner.present_queue.is_empty() {
            return None;
        }
        let best = inner
            .present_queue
            .iter()
            .enumerate()
            .max_by(|(ia, ra), (ib, rb)| ra.priority.cmp(&rb.priority).then(ib.cmp(ia)))
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        inner.present_queue.remove(best)
    }

    /// Copies out the payload of the buffer behind a dequeued
    /// [`PresentRequest`], which is still `PendingPresent` and therefore
    /// not being written to by anyone else.
    pub(crate) fn payload_of(&self, buffer_index: usize) -> Vec<u8> {
        self.inner.lock().buffers[buffer_index].payload.clone()
    }

    /// Metadata the producer attached via [`BackBuffer::set_metadata`],
    /// stashed on the slot by [`Self::present`] for the pacer to read back
    /// when it publishes `FramePresented`/`FrameDropped`.
    pub(crate) fn metadata_of(&self, buffer_index: usize) -> Option<String> {
        self.inner.lock().buffers[buffer_index].metadata.clone()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Marks the buffer behind `request` as `Presented` then immediately
    /// `Available` — producers observe the transition only through the
    /// `FramePresented` event; the buffer itself returns to `Available`
    /// without any further action on their part.
    pub(crate) fn complete_present_success(&self, request: &PresentRequest) {
        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.buffers[request.buffer_index];
            slot.mark_presented();
            slot.release();
        }
        self.available_cond.notify_one();
        self.stats.record_presented();
        self.stats.record_sent();
    }

    /// No retry in the swap-chain path: it's stateless and drops on
    /// failure. The buffer returns to `Available` and the frame is counted
    /// dropped.
    pub(crate) fn complete_present_failure(&self, request: &PresentRequest) {
        self.release_index(request.buffer_index);
        self.stats.record_dropped();
    }

    /// Stops the pacer, attempts a best-effort `set_realtime_mode(false)`
    /// with a 5-second ceiling, and zeroes buffer payloads. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stopping.store(true, Ordering::Release);

        let outcome = tokio::time::timeout(DISPOSAL_TIMEOUT, self.transport.set_realtime_mode(false)).await;
        match outcome {
            Ok(results) => {
                self.stats.record_realtime_disabled();
                self.events.publish(PresenterEvent::RealtimeModeChanged {
                    enabled: false,
                    success_count: success_count(&results),
                    total: self.transport.device_count(),
                });
            }
            Err(_) => {
                debug!("set_realtime_mode(false) did not complete within the disposal ceiling");
            }
        }

        let mut inner = self.inner.lock();
        for buffer in &mut inner.buffers {
            buffer.payload.clear();
        }
        inner.present_queue.clear();
        self.available_cond.notify_all();
    }
}

/// Drops any queued [`PresentRequest`] that referenced `buffer_index`,
/// since the starvation policy just forced that buffer back to
/// `Available` out from under a pending present.
fn drop_buffer_from_queue(inner: &mut Inner, buffer_index: usize) {
    inner.present_queue.retain(|r| r.buffer_index != buffer_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeviceResultMap;
    use std::sync::atomic::AtomicUsize;

    struct StubTransport {
        succeed: bool,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for StubTransport {
        async fn transfer_data(&self, _bytes: &[u8], _transfer_id: u8) -> DeviceResultMap {
            self.calls.fetch_add(1, Ordering::SeqCst);
            [(1u32, self.succeed)].into_iter().collect()
        }

        async fn set_realtime_mode(&self, _enable: bool) -> DeviceResultMap {
            [(1u32, true)].into_iter().collect()
        }

        fn device_count(&self) -> usize {
            1
        }
    }

    fn make_swapchain(mode: SwapChainMode, succeed: bool) -> Arc<SwapChain> {
        let transport = Arc::new(StubTransport { succeed, calls: AtomicUsize::new(0) });
        let config = SwapChainConfig::default().buffer_count(2).mode(mode);
        SwapChain::new(config, transport, EventBus::default(), Arc::new(StatsAggregator::new())).unwrap()
    }

    #[test]
    fn acquire_present_release_round_trip() {
        let sc = make_swapchain(SwapChainMode::Discard, true);
        let mut back = sc.acquire_back_buffer().expect("buffer available");
        back.write(b"hello");
        assert!(sc.present(back, 0));

        let stats = sc.get_statistics();
        assert_eq!(stats.pending_present, 1);
    }

    #[test]
    fn present_rejects_empty_payload() {
        let sc = make_swapchain(SwapChainMode::Discard, true);
        let back = sc.acquire_back_buffer().unwrap();
        assert!(!sc.present(back, 0));
        let stats = sc.get_statistics();
        assert_eq!(stats.rendering, 1);
    }

    #[test]
    fn discard_mode_reclaims_oldest_buffer() {
        let sc = make_swapchain(SwapChainMode::Discard, true);
        let _b0 = sc.acquire_back_buffer().unwrap();
        let _b1 = sc.acquire_back_buffer().unwrap();

        let stats_before = sc.get_statistics();
        assert_eq!(stats_before.rendering, 2);

        // This call finds no Available buffer, discards the oldest
        // (b0) to make room, but still returns None to this caller.
        assert!(sc.acquire_back_buffer().is_none());
        let stats_after = sc.get_statistics();
        assert_eq!(stats_after.available, 1);
        assert_eq!(*stats_after.stats.frames_dropped(), 1);

        // The next call succeeds against the reclaimed slot.
        assert!(sc.acquire_back_buffer().is_some());
    }

    #[test]
    fn sequential_mode_never_reclaims() {
        let sc = make_swapchain(SwapChainMode::Sequential, true);
        let _b0 = sc.acquire_back_buffer().unwrap();
        let _b1 = sc.acquire_back_buffer().unwrap();
        assert!(sc.acquire_back_buffer().is_none());
        assert!(sc.acquire_back_buffer().is_none());
    }

    #[tokio::test]
    async fn present_immediate_reports_failure() {
        let sc = make_swapchain(SwapChainMode::Discard, false);
        let mut back = sc.acquire_back_buffer().unwrap();
        back.write(b"data");
        assert!(!sc.present_immediate(back, None).await);
        let stats = sc.get_statistics();
        assert_eq!(stats.available, 2);
    }

    #[tokio::test]
    async fn present_immediate_reports_success() {
        let sc = make_swapchain(SwapChainMode::Discard, true);
        let mut back = sc.acquire_back_buffer().unwrap();
        back.write(b"data");
        assert!(sc.present_immediate(back, None).await);
        let stats = sc.get_statistics();
        assert_eq!(stats.available, 2);
        assert_eq!(*stats.stats.presented(), 1);
    }
}
