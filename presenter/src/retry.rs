//! Retry and drop decision for a failed transmission attempt.

use std::time::Duration;

use crate::queue::TransmissionItem;

/// Delay before a requeued item is eligible for another attempt.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

pub enum RetryOutcome {
    Requeue(TransmissionItem),
    Drop(TransmissionItem),
}

/// Bumps `retry_count` and decides whether the item gets one more shot.
/// `max_retries` retries are allowed beyond the first attempt, so an item
/// can be attempted `max_retries + 1` times in total before it is dropped.
pub fn apply_retry(mut item: TransmissionItem, max_retries: u32) -> RetryOutcome {
    item.retry_count += 1;
    if item.retry_count <= max_retries {
        RetryOutcome::Requeue(item)
    } else {
        RetryOutcome::Drop(item)
    }
}
