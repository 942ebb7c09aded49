//! The alternative, buffer-less producer-facing path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::PresenterError;
use crate::events::{EventBus, PresenterEvent};
use crate::realtime::RealtimeModeController;
use crate::retry::RetryOutcome;
use crate::stats::StatsAggregator;
use crate::transfer_id::TransferIdAllocator;
use crate::transport::{any_device_succeeded, call_guarded, Transport};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub processing_interval_ms: u64,
    pub max_queue: usize,
    pub max_retries: u32,
    pub monitor_interval_ms: u64,
    pub realtime_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_interval_ms: 33,
            max_queue: 32,
            max_retries: 3,
            monitor_interval_ms: 500,
            realtime_timeout_ms: 5_000,
        }
    }
}

impl QueueConfig {
    value_builder! { processing_interval_ms, u64 }
    value_builder! { max_queue, usize }
    value_builder! { max_retries, u32 }
    value_builder! { monitor_interval_ms, u64 }
    value_builder! { realtime_timeout_ms, u64 }

    pub fn validate(&self) -> Result<(), PresenterError> {
        if self.processing_interval_ms < 1 {
            return Err(PresenterError::InvalidProcessingInterval(self.processing_interval_ms));
        }
        if self.max_queue < 1 {
            return Err(PresenterError::InvalidMaxQueue(self.max_queue));
        }
        if self.max_retries < 1 {
            return Err(PresenterError::InvalidMaxRetries(self.max_retries));
        }
        Ok(())
    }
}

/// An opaque transmission, copied defensively on ingress so the producer
/// may mutate its source buffer afterward.
#[derive(Debug, Clone)]
pub struct TransmissionItem {
    pub payload: Vec<u8>,
    pub priority: i32,
    pub metadata: Option<String>,
    pub queued_time: Instant,
    pub retry_count: u32,
}

struct Inner {
    items: VecDeque<TransmissionItem>,
    last_activity: Instant,
}

/// Bounded FIFO with drop-oldest overflow, adaptive drain interval, and
/// integrated retry.
pub struct TransmissionQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,

    transport: Arc<dyn Transport>,
    transfer_ids: TransferIdAllocator,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    realtime: Arc<RealtimeModeController>,

    current_period_ms: AtomicU64,
    stopping: std::sync::atomic::AtomicBool,
}

impl TransmissionQueue {
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        events: EventBus,
        stats: Arc<StatsAggregator>,
        realtime: Arc<RealtimeModeController>,
    ) -> Result<Arc<Self>, PresenterError> {
        config.validate()?;
        let base_period = config.processing_interval_ms;
        Ok(Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                last_activity: Instant::now(),
            }),
            transport,
            transfer_ids: TransferIdAllocator::default(),
            stats,
            events,
            realtime,
            current_period_ms: AtomicU64::new(base_period),
            stopping: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Copies `payload`, timestamps it, and appends it. Drops the oldest
    /// item (counted, event emitted) if this would exceed `max_queue`
    /// before appending the new one.
    pub fn enqueue(&self, payload: &[u8], priority: i32, metadata: Option<String>) -> bool {
        if self.stopping.load(Ordering::Acquire) {
            return false;
        }

        let item = TransmissionItem {
            payload: payload.to_vec(),
            priority,
            metadata,
            queued_time: Instant::now(),
            retry_count: 0,
        };

        let mut dropped_item = None;
        {
            let mut inner = self.inner.lock();
            if inner.items.len() >= self.config.max_queue {
                dropped_item = inner.items.pop_front();
            }
            inner.items.push_back(item);
            inner.last_activity = Instant::now();
        }

        if let Some(dropped) = dropped_item {
            self.stats.record_dropped();
            self.events.publish(PresenterEvent::FrameDropped {
                buffer_index: None,
                reason: "Queue overflow".into(),
                metadata: dropped.metadata,
            });
        }
        self.stats.record_queued();
        self.events.publish(PresenterEvent::QueueStatusChanged {
            current_size: self.len(),
            max_size: self.config.max_queue,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all items, counting each as dropped with reason
    /// "queue cleared".
    pub fn clear(&self) {
        let removed: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.items.drain(..).collect()
        };
        for item in removed {
            self.stats.record_dropped();
            self.events.publish(PresenterEvent::FrameDropped {
                buffer_index: None,
                reason: "queue cleared".into(),
                metadata: item.metadata,
            });
        }
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Forces the transport into non-real-time mode and updates the
    /// controller state.
    pub async fn disable_realtime_mode(&self) {
        self.realtime.force_disable(&self.transport).await;
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Adaptive tick period table: period only changes when the delta from
    /// the current period exceeds 5 ms, to avoid thrashing.
    fn next_period(&self) -> Duration {
        let base = self.config.processing_interval_ms;
        let fill = self.len() as f64 / self.config.max_queue as f64;

        let target = if fill > 0.8 {
            (base / 2).max(10)
        } else if fill > 0.5 {
            ((base as f64) * 0.8) as u64
        } else if fill < 0.2 {
            (base * 2).min(100)
        } else {
            base
        };

        let current = self.current_period_ms.load(Ordering::Relaxed);
        let delta = current.abs_diff(target);
        let chosen = if delta > 5 { target } else { current };
        self.current_period_ms.store(chosen, Ordering::Relaxed);
        Duration::from_millis(chosen.max(1))
    }

    fn pop_front(&self) -> Option<TransmissionItem> {
        self.inner.lock().items.pop_front()
    }

    fn requeue_tail(&self, item: TransmissionItem) {
        self.inner.lock().items.push_back(item);
    }

    /// Runs until stopped, popping one item per adaptive tick and
    /// attempting delivery. On zero-success it applies the retry/drop
    /// policy. Transmission only happens while the real-time controller has
    /// the device in real-time mode; items sit in the queue otherwise.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }

            let period = self.next_period();
            tokio::time::sleep(period).await;

            if self.stopping.load(Ordering::Acquire) {
                return;
            }

            if !self.realtime.is_enabled() {
                continue;
            }

            let Some(item) = self.pop_front() else {
                continue;
            };

            self.attempt_transmission(item).await;
        }
    }

    async fn attempt_transmission(&self, item: TransmissionItem) {
        let transfer_id = self.transfer_ids.alloc();
        self.stats.record_present_attempt();

        let results = call_guarded(self.transport.transfer_data(&item.payload, transfer_id)).await;

        if any_device_succeeded(&results) {
            self.stats.record_sent();
            self.events.publish(PresenterEvent::FramePresented {
                buffer_index: usize::MAX,
                transfer_id,
                metadata: item.metadata,
            });
            return;
        }

        match crate::retry::apply_retry(item, self.config.max_retries) {
            RetryOutcome::Requeue(retried) => {
                self.stats.record_retry();
                debug!(retry_count = retried.retry_count, "retrying transmission after delay");
                tokio::time::sleep(crate::retry::RETRY_DELAY).await;
                self.requeue_tail(retried);
            }
            RetryOutcome::Drop(dropped) => {
                self.stats.record_dropped();
                warn!("transmission failed after retries, dropping");
                self.events.publish(PresenterEvent::TransmissionError {
                    reason: "max retries exceeded".into(),
                    context: "Transmission failed after retries".into(),
                });
                self.events.publish(PresenterEvent::FrameDropped {
                    buffer_index: None,
                    reason: "max retries exceeded".into(),
                    metadata: dropped.metadata,
                });
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeviceResultMap;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysFail;
    #[async_trait::async_trait]
    impl Transport for AlwaysFail {
        async fn transfer_data(&self, _bytes: &[u8], _transfer_id: u8) -> DeviceResultMap {
            [(1u32, false)].into_iter().collect()
        }
        async fn set_realtime_mode(&self, _enable: bool) -> DeviceResultMap {
            [(1u32, true)].into_iter().collect()
        }
        fn device_count(&self) -> usize {
            1
        }
    }

    fn make_queue(max_queue: usize) -> Arc<TransmissionQueue> {
        let transport = Arc::new(AlwaysFail);
        let stats = Arc::new(StatsAggregator::new());
        let events = EventBus::default();
        let realtime = Arc::new(RealtimeModeController::new(Default::default(), events.clone(), stats.clone()));
        TransmissionQueue::new(
            QueueConfig::default().max_queue(max_queue),
            transport,
            events,
            stats,
            realtime,
        )
        .unwrap()
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = make_queue(3);
        for label in ["A", "B", "C", "D", "E"] {
            queue.enqueue(b"x", 0, Some(label.into()));
        }
        let remaining: Vec<_> = queue
            .inner
            .lock()
            .items
            .iter()
            .map(|i| i.metadata.clone().unwrap())
            .collect();
        assert_eq!(remaining, vec!["C", "D", "E"]);
        assert_eq!(*queue.stats.snapshot().frames_dropped(), 2);
    }

    #[test]
    fn clear_counts_every_item_dropped() {
        let queue = make_queue(5);
        for _ in 0..4 {
            queue.enqueue(b"x", 0, None);
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(*queue.stats.snapshot().frames_dropped(), 4);
    }

    #[test]
    fn enqueue_defensively_copies_payload() {
        let queue = make_queue(5);
        let mut source = vec![1, 2, 3];
        queue.enqueue(&source, 0, None);
        source[0] = 99;
        let stored = queue.inner.lock().items[0].payload.clone();
        assert_eq!(stored, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn persistent_failure_drops_after_max_retries_plus_one_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));

        struct CountingFail(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl Transport for CountingFail {
            async fn transfer_data(&self, _bytes: &[u8], _transfer_id: u8) -> DeviceResultMap {
                self.0.fetch_add(1, Ordering::SeqCst);
                [(1u32, false)].into_iter().collect()
            }
            async fn set_realtime_mode(&self, _enable: bool) -> DeviceResultMap {
                [(1u32, true)].into_iter().collect()
            }
            fn device_count(&self) -> usize {
                1
            }
        }

        let stats = Arc::new(StatsAggregator::new());
        let events = EventBus::default();
        let realtime = Arc::new(RealtimeModeController::new(Default::default(), events.clone(), stats.clone()));
        let queue = TransmissionQueue::new(
            QueueConfig::default().max_queue(5).max_retries(3),
            Arc::new(CountingFail(attempts.clone())),
            events,
            stats.clone(),
            realtime,
        )
        .unwrap();

        queue.enqueue(b"frame", 0, None);
        let item = queue.pop_front().unwrap();
        queue.attempt_transmission(item).await;
        loop {
            let Some(item) = queue.pop_front() else { break };
            queue.attempt_transmission(item).await;
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(*stats.snapshot().frames_dropped(), 1);
    }
}
