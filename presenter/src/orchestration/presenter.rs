use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::PresenterError;
use crate::events::{EventBus, PresenterEvent};
use crate::pacer::PresentPacer;
use crate::queue::{QueueConfig, TransmissionQueue};
use crate::realtime::{RealtimeConfig, RealtimeModeController};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::swapchain::{BackBuffer, SwapChain, SwapChainConfig, SwapChainStatistics};
use crate::transport::{DeviceEvent, Transport};

/// Ceiling applied when waiting for the background tasks to exit during
/// [`PresenterHandle::shutdown`]. Longer than the swap chain's own disposal
/// ceiling since it also has to wait out the queue's current drain tick.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a [`Presenter`] from a transport implementation and the three
/// independent config blocks (swap chain, transmission queue, real-time
/// hysteresis).
pub struct PresenterBuilder {
    swapchain_config: SwapChainConfig,
    queue_config: QueueConfig,
    realtime_config: RealtimeConfig,
    event_capacity: usize,
    transport: Option<Arc<dyn Transport>>,
}

impl Default for PresenterBuilder {
    fn default() -> Self {
        Self {
            swapchain_config: SwapChainConfig::default(),
            queue_config: QueueConfig::default(),
            realtime_config: RealtimeConfig::default(),
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
            transport: None,
        }
    }
}

impl PresenterBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn swapchain_config(mut self, config: SwapChainConfig) -> Self {
        self.swapchain_config = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn realtime_config(mut self, config: RealtimeConfig) -> Self {
        self.realtime_config = config;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validates both config blocks up front so construction fails before
    /// any buffer or background task exists.
    pub fn build(self) -> Result<Presenter, PresenterError> {
        self.swapchain_config.validate()?;
        self.queue_config.validate()?;
        let transport = self.transport.ok_or(PresenterError::MissingTransport)?;

        let events = EventBus::new(self.event_capacity);
        let stats = Arc::new(StatsAggregator::new());

        let swap_chain = SwapChain::new(self.swapchain_config, transport.clone(), events.clone(), stats.clone())?;
        let realtime = Arc::new(RealtimeModeController::new(self.realtime_config, events.clone(), stats.clone()));
        let queue = TransmissionQueue::new(
            self.queue_config,
            transport.clone(),
            events.clone(),
            stats.clone(),
            realtime.clone(),
        )?;

        Ok(Presenter {
            swap_chain,
            queue,
            realtime,
            transport,
            events,
            stats,
        })
    }
}

/// A fully constructed but not-yet-running pipeline: a swap chain and a
/// transmission queue sharing one transport, event bus, and statistics
/// aggregator.
pub struct Presenter {
    swap_chain: Arc<SwapChain>,
    queue: Arc<TransmissionQueue>,
    realtime: Arc<RealtimeModeController>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    stats: Arc<StatsAggregator>,
}

impl Presenter {
    pub fn builder() -> PresenterBuilder {
        PresenterBuilder::default()
    }

    pub fn swap_chain(&self) -> &Arc<SwapChain> {
        &self.swap_chain
    }

    pub fn queue(&self) -> &Arc<TransmissionQueue> {
        &self.queue
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<PresenterEvent> {
        self.events.subscribe()
    }

    /// Initializes the swap chain's device-side real-time mode, then spawns
    /// the pacer, the queue drain loop, the real-time hysteresis monitor,
    /// and the device-event bridge as background tasks.
    pub async fn run(self) -> PresenterHandle {
        self.swap_chain.initialize().await;

        let pacer = PresentPacer::new(self.swap_chain.clone());
        let pacer_task = tokio::spawn(pacer.run());

        let queue_task = tokio::spawn(self.queue.clone().run());

        let monitor_task = tokio::spawn(self.realtime.clone().run(self.queue.clone()));

        let device_events = self.transport.subscribe_device_events();
        let device_event_task = tokio::spawn(forward_device_events(device_events, self.events.clone()));

        PresenterHandle {
            swap_chain: self.swap_chain,
            queue: self.queue,
            stats: self.stats,
            pacer_task: Some(pacer_task),
            queue_task: Some(queue_task),
            monitor_task: Some(monitor_task),
            device_event_task: Some(device_event_task),
        }
    }
}

/// Forwards device connect/disconnect/error notifications onto the
/// presenter's own event bus, translating [`DeviceEvent`] into the matching
/// [`PresenterEvent`] variant. Exits once the transport's channel closes.
async fn forward_device_events(mut source: tokio::sync::broadcast::Receiver<DeviceEvent>, sink: EventBus) {
    loop {
        match source.recv().await {
            Ok(DeviceEvent::Connected(id)) => sink.publish(PresenterEvent::DeviceConnected(id)),
            Ok(DeviceEvent::Disconnected(id)) => sink.publish(PresenterEvent::DeviceDisconnected(id)),
            Ok(DeviceEvent::Error(id, reason)) => sink.publish(PresenterEvent::DeviceError(id, reason)),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// A running [`Presenter`]. Exposes the producer-facing operations directly
/// so callers don't have to reach through `swap_chain()`/`queue()` for the
/// common path.
pub struct PresenterHandle {
    swap_chain: Arc<SwapChain>,
    queue: Arc<TransmissionQueue>,
    stats: Arc<StatsAggregator>,
    pacer_task: Option<JoinHandle<()>>,
    queue_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
    device_event_task: Option<JoinHandle<()>>,
}

impl PresenterHandle {
    pub fn acquire_back_buffer(&self) -> Option<BackBuffer> {
        self.swap_chain.acquire_back_buffer()
    }

    pub fn present(&self, buffer: BackBuffer, priority: i32) -> bool {
        self.swap_chain.present(buffer, priority)
    }

    pub async fn present_immediate(&self, buffer: BackBuffer, metadata: Option<String>) -> bool {
        self.swap_chain.present_immediate(buffer, metadata).await
    }

    pub fn release(&self, buffer: BackBuffer) {
        self.swap_chain.release(buffer)
    }

    pub fn swapchain_statistics(&self) -> SwapChainStatistics {
        self.swap_chain.get_statistics()
    }

    pub fn enqueue(&self, payload: &[u8], priority: i32, metadata: Option<String>) -> bool {
        self.queue.enqueue(payload, priority, metadata)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops both paths, disposes the swap chain (best-effort
    /// `set_realtime_mode(false)` under its own ceiling), and waits for the
    /// background tasks to exit, up to [`SHUTDOWN_JOIN_TIMEOUT`].
    pub async fn shutdown(mut self) {
        self.queue.stop();
        self.swap_chain.dispose().await;

        let tasks = [
            self.pacer_task.take(),
            self.queue_task.take(),
            self.monitor_task.take(),
            self.device_event_task.take(),
        ];

        for task in tasks.into_iter().flatten() {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await.is_err() {
                warn!("background task did not exit within the shutdown ceiling");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::realtime::RealtimeConfig;
    use crate::swapchain::{PresentMode, SwapChainConfig, SwapChainMode};
    use crate::transport::DeviceResultMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeTransport {
        succeed: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn new(succeed: bool) -> Self {
            Self {
                succeed: AtomicBool::new(succeed),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn transfer_data(&self, _bytes: &[u8], _transfer_id: u8) -> DeviceResultMap {
            self.calls.fetch_add(1, Ordering::SeqCst);
            [(1u32, self.succeed.load(Ordering::SeqCst))].into_iter().collect()
        }

        async fn set_realtime_mode(&self, _enable: bool) -> DeviceResultMap {
            [(1u32, true)].into_iter().collect()
        }

        fn device_count(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn swapchain_path_presents_a_frame_end_to_end() {
        let transport = Arc::new(FakeTransport::new(true));
        let presenter = Presenter::builder()
            .transport(transport)
            .swapchain_config(SwapChainConfig::default().refresh_hz(120).mode(SwapChainMode::Discard))
            .build()
            .unwrap();

        let handle = presenter.run().await;

        let mut back = handle.acquire_back_buffer().expect("buffer available");
        back.write(b"frame-bytes");
        assert!(handle.present(back, 0));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = handle.stats();
        assert!(*stats.presented() >= 1);
        assert!(*stats.frames_sent() >= 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn queue_path_delivers_frame_end_to_end() {
        let transport = Arc::new(FakeTransport::new(true));
        let presenter = Presenter::builder()
            .transport(transport)
            .queue_config(QueueConfig::default().processing_interval_ms(5))
            .realtime_config(RealtimeConfig {
                idle_timeout_ms: 5_000,
                monitor_interval_ms: 10,
            })
            .build()
            .unwrap();

        let handle = presenter.run().await;
        assert!(handle.enqueue(b"payload", 0, None));

        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = handle.stats();
        assert!(*stats.frames_sent() >= 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn overloaded_queue_drops_oldest_before_any_drain() {
        let transport = Arc::new(FakeTransport::new(true));
        let presenter = Presenter::builder()
            .transport(transport)
            .queue_config(QueueConfig::default().processing_interval_ms(1_000).max_queue(2))
            .build()
            .unwrap();

        let handle = presenter.run().await;
        for _ in 0..5 {
            handle.enqueue(b"x", 0, None);
        }

        let stats = handle.stats();
        assert_eq!(*stats.frames_dropped(), 3);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn vsync_mode_still_dispatches_present_requests() {
        let transport = Arc::new(FakeTransport::new(true));
        let presenter = Presenter::builder()
            .transport(transport)
            .swapchain_config(
                SwapChainConfig::default()
                    .refresh_hz(120)
                    .present_mode(PresentMode::VSync),
            )
            .build()
            .unwrap();

        let handle = presenter.run().await;
        let mut back = handle.acquire_back_buffer().unwrap();
        back.write(b"frame");
        assert!(handle.present(back, 0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(*handle.stats().presented() >= 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_disables_realtime_mode() {
        let transport = Arc::new(FakeTransport::new(true));
        let presenter = Presenter::builder().transport(transport).build().unwrap();

        let handle = presenter.run().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let before = handle.stats();
        assert_eq!(*before.realtime_enable_count(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn realtime_monitor_enables_on_backlog_and_reports_via_events() {
        let transport = Arc::new(FakeTransport::new(true));
        let presenter = Presenter::builder()
            .transport(transport)
            .queue_config(QueueConfig::default().processing_interval_ms(1_000).max_queue(10))
            .realtime_config(RealtimeConfig {
                idle_timeout_ms: 50,
                monitor_interval_ms: 10,
            })
            .build()
            .unwrap();

        let mut events = presenter.subscribe_events();
        let handle = presenter.run().await;
        handle.enqueue(b"x", 0, None);

        let mut saw_monitor_update = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(50), events.recv()).await {
                Ok(Ok(PresenterEvent::QueueMonitorUpdate { .. })) => {
                    saw_monitor_update = true;
                    break;
                }
                _ => continue,
            }
        }
        assert!(saw_monitor_update);

        handle.shutdown().await;
    }
}
