/// Errors raised at construction time, before any background task has
/// started. Nothing on the hot path returns this type: per the public
/// contract, `SwapChain`/`TransmissionQueue` operations report failure as
/// `bool`/`Option` and surface diagnostics through [`crate::events::PresenterEvent`].
#[derive(Debug, thiserror::Error)]
pub enum PresenterError {
    #[error("buffer_count must be 2, 3, or 4 (got {0})")]
    InvalidBufferCount(u32),

    #[error("refresh_hz must be in 1..=120 (got {0})")]
    InvalidRefreshRate(u32),

    #[error("processing_interval_ms must be >= 1 (got {0})")]
    InvalidProcessingInterval(u64),

    #[error("max_queue must be >= 1 (got {0})")]
    InvalidMaxQueue(usize),

    #[error("max_retries must be >= 1 (got {0})")]
    InvalidMaxRetries(u32),

    #[error("no devices acknowledged initialization")]
    NoDeviceAcknowledged,

    #[error("component has been disposed")]
    Disposed,

    #[error("PresenterBuilder::transport was never called")]
    MissingTransport,
}
