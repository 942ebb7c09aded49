//! Hysteresis-based real-time-mode lifecycle for the transmission queue path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::events::{EventBus, PresenterEvent};
use crate::queue::TransmissionQueue;
use crate::stats::StatsAggregator;
use crate::transport::{success_count, Transport};

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub idle_timeout_ms: u64,
    pub monitor_interval_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5_000,
            monitor_interval_ms: 500,
        }
    }
}

/// Samples queue activity on a timer and toggles the device's real-time
/// streaming mode, with hysteresis so a single idle tick doesn't flip the
/// mode back off the moment a queue happens to drain.
pub struct RealtimeModeController {
    config: RealtimeConfig,
    events: EventBus,
    stats: Arc<StatsAggregator>,
    enabled: AtomicBool,
}

impl RealtimeModeController {
    pub fn new(config: RealtimeConfig, events: EventBus, stats: Arc<StatsAggregator>) -> Self {
        Self {
            config,
            events,
            stats,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    async fn set_enabled(&self, enable: bool, transport: &Arc<dyn Transport>) {
        if self.enabled.load(Ordering::Acquire) == enable {
            return;
        }

        let results = crate::transport::call_guarded(transport.set_realtime_mode(enable)).await;
        let successes = success_count(&results);
        let total = transport.device_count();

        self.enabled.store(enable, Ordering::Release);
        if enable {
            self.stats.record_realtime_enabled();
        } else {
            self.stats.record_realtime_disabled();
        }

        info!(enable, successes, total, "real-time mode toggled");
        self.events.publish(PresenterEvent::RealtimeModeChanged {
            enabled: enable,
            success_count: successes,
            total,
        });
    }

    /// Unconditionally drives the device into non-real-time mode. Used on
    /// shutdown and by the explicit opt-out API.
    pub async fn force_disable(&self, transport: &Arc<dyn Transport>) {
        self.set_enabled(false, transport).await;
    }

    /// Runs until `queue` reports it is stopping. Every `monitor_interval_ms`
    /// it samples queue occupancy and idle time and applies:
    ///
    /// - enable, if the queue currently holds items and mode is off
    /// - disable, if the queue has been empty for at least `idle_timeout_ms`
    ///   and mode is on
    ///
    /// Either edge publishes [`PresenterEvent::QueueMonitorUpdate`] as well
    /// as the toggle's own `RealtimeModeChanged`.
    pub async fn run(self: Arc<Self>, queue: Arc<TransmissionQueue>) {
        let interval = Duration::from_millis(self.config.monitor_interval_ms.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if queue.is_stopping() {
                return;
            }

            let size = queue.len();
            let has_data = size > 0;
            let idle = queue.last_activity().elapsed();
            let idle_duration_ms = idle.as_millis() as u64;
            let enabled = self.is_enabled();

            if has_data && !enabled {
                self.set_enabled(true, queue.transport()).await;
            } else if !has_data && enabled && idle_duration_ms >= self.config.idle_timeout_ms {
                self.set_enabled(false, queue.transport()).await;
            }

            self.events.publish(PresenterEvent::QueueMonitorUpdate {
                size,
                has_data,
                realtime_on: self.is_enabled(),
                processing_on: has_data,
                idle_duration_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DeviceResultMap;

    struct StubTransport {
        succeed: bool,
    }

    #[async_trait::async_trait]
    impl Transport for StubTransport {
        async fn transfer_data(&self, _bytes: &[u8], _transfer_id: u8) -> DeviceResultMap {
            [(1u32, self.succeed)].into_iter().collect()
        }
        async fn set_realtime_mode(&self, _enable: bool) -> DeviceResultMap {
            [(1u32, self.succeed)].into_iter().collect()
        }
        fn device_count(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn enabling_twice_is_idempotent() {
        let events = EventBus::default();
        let stats = Arc::new(StatsAggregator::new());
        let controller = RealtimeModeController::new(RealtimeConfig::default(), events, stats.clone());
        let transport: Arc<dyn Transport> = Arc::new(StubTransport { succeed: true });

        controller.set_enabled(true, &transport).await;
        controller.set_enabled(true, &transport).await;

        assert!(controller.is_enabled());
        assert_eq!(*stats.snapshot().realtime_enable_count(), 1);
    }

    #[tokio::test]
    async fn force_disable_from_enabled_records_one_disable() {
        let events = EventBus::default();
        let stats = Arc::new(StatsAggregator::new());
        let controller = RealtimeModeController::new(RealtimeConfig::default(), events, stats.clone());
        let transport: Arc<dyn Transport> = Arc::new(StubTransport { succeed: true });

        controller.set_enabled(true, &transport).await;
        controller.force_disable(&transport).await;

        assert!(!controller.is_enabled());
        assert_eq!(*stats.snapshot().realtime_disable_count(), 1);
    }
}
