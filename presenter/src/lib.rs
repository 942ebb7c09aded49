#[macro_use]
mod macros;

pub mod buffer;
pub mod error;
pub mod events;
pub mod orchestration;
pub mod pacer;
pub mod queue;
pub mod realtime;
pub mod retry;
pub mod stats;
pub mod swapchain;
pub mod transfer_id;
pub mod transport;

pub use error::PresenterError;
pub use events::{EventBus, PresenterEvent};
pub use orchestration::{Presenter, PresenterBuilder, PresenterHandle};
pub use queue::{QueueConfig, TransmissionItem, TransmissionQueue};
pub use realtime::{RealtimeConfig, RealtimeModeController};
pub use stats::{Health, StatsAggregator, StatsSnapshot};
pub use swapchain::{BackBuffer, PresentMode, SwapChain, SwapChainConfig, SwapChainMode, SwapChainStatistics};
pub use transport::{DeviceEvent, DeviceId, Transport};
