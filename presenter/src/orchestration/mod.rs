//! Top-level facade wiring the swap-chain and transmission-queue paths to a
//! shared transport, event bus, and statistics aggregator.

mod presenter;

pub use presenter::{Presenter, PresenterBuilder, PresenterHandle};
