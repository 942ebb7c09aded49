//! Timer-driven dispatcher that drains the present queue at the configured
//! rate.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::events::PresenterEvent;
use crate::swapchain::{PresentMode, SwapChain};
use crate::transport::any_device_succeeded;

/// Drains at most one [`crate::swapchain::PresentRequest`] per tick and
/// dispatches it to the transport. Runs as a background `tokio` task owned
/// by the [`crate::orchestration::Presenter`] facade.
pub struct PresentPacer {
    swapchain: Arc<SwapChain>,
}

impl PresentPacer {
    pub fn new(swapchain: Arc<SwapChain>) -> Self {
        Self { swapchain }
    }

    /// Runs until the swap chain's stopping flag is set. `dispose()` on the
    /// owning swap chain sets that flag and this loop exits after its
    /// current tick's in-flight transport call (if any) completes.
    pub async fn run(self) {
        let stopping = self.swapchain.stopping_flag();
        let period = self.swapchain.config().present_period();
        let present_mode = self.swapchain.config().present_mode;

        let mut present_interval = tokio::time::interval(period);
        present_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut vsync_interval = if present_mode == PresentMode::VSync {
            tokio::time::sleep(period / 2).await;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            Some(interval)
        } else {
            None
        };

        let mut last_tick: Option<Instant> = None;

        loop {
            if stopping.load(Ordering::Acquire) {
                self.drain_remaining().await;
                return;
            }

            tokio::select! {
                _ = present_interval.tick() => {
                    self.record_inter_present(&mut last_tick);
                    self.dispatch_one().await;
                }
                _ = conditional_tick(&mut vsync_interval) => {
                    self.swapchain.events().publish(PresenterEvent::VsyncOccurred {
                        timestamp: Instant::now(),
                        refresh_hz: self.swapchain.config().refresh_hz,
                    });
                    self.dispatch_one().await;
                }
            }
        }
    }

    fn record_inter_present(&self, last_tick: &mut Option<Instant>) {
        let now = Instant::now();
        if let Some(previous) = *last_tick {
            let dt_ms = now.duration_since(previous).as_secs_f64() * 1000.0;
            self.swapchain.stats().record_frame_time(dt_ms);
        }
        *last_tick = Some(now);
    }

    async fn dispatch_one(&self) {
        let Some(request) = self.swapchain.dequeue_present() else {
            trace!("present queue empty, nothing to dispatch");
            return;
        };

        self.swapchain.stats().record_present_attempt();
        let payload = self.swapchain.payload_of(request.buffer_index);
        let metadata = self.swapchain.metadata_of(request.buffer_index);

        let results = crate::transport::call_guarded(
            self.swapchain.transport().transfer_data(&payload, request.transfer_id),
        )
        .await;

        if any_device_succeeded(&results) {
            self.swapchain.complete_present_success(&request);
            self.swapchain.events().publish(PresenterEvent::FramePresented {
                buffer_index: request.buffer_index,
                transfer_id: request.transfer_id,
                metadata,
            });
        } else {
            self.swapchain.complete_present_failure(&request);
            self.swapchain.events().publish(PresenterEvent::FrameDropped {
                buffer_index: Some(request.buffer_index),
                reason: "transport rejected present".into(),
                metadata,
            });
        }
    }

    async fn drain_remaining(&self) {
        debug!("pacer stopping, draining remaining present requests");
        while let Some(request) = self.swapchain.dequeue_present() {
            let metadata = self.swapchain.metadata_of(request.buffer_index);
            self.swapchain.complete_present_failure(&request);
            self.swapchain.events().publish(PresenterEvent::FrameDropped {
                buffer_index: Some(request.buffer_index),
                reason: "pacer stopped".into(),
                metadata,
            });
        }
    }
}

async fn conditional_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
