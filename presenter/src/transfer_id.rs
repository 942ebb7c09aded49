//! Cyclic transfer-id allocation.

use parking_lot::Mutex;

/// Device-protocol ceiling on transfer ids; configurable but defaults to 59.
pub const DEFAULT_MAX_TRANSFER_ID: u8 = 59;

/// Cycles through `[1, max]`, wrapping back to 1. Not cryptographically
/// random — only required to avoid immediate collisions inside the device's
/// in-flight window.
pub struct TransferIdAllocator {
    max: u8,
    next: Mutex<u8>,
}

impl TransferIdAllocator {
    pub fn new(max: u8) -> Self {
        let max = max.max(1);
        Self {
            max,
            next: Mutex::new(1),
        }
    }

    pub fn alloc(&self) -> u8 {
        let mut next = self.next.lock();
        let id = *next;
        *next = if id >= self.max { 1 } else { id + 1 };
        id
    }
}

impl Default for TransferIdAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSFER_ID)
    }
}
