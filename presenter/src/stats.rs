//! Lock-free statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use derive_getters::Getters;

/// Health label derived from success/drop rates on snapshot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Point-in-time view of [`StatsAggregator`]'s counters plus derived
/// metrics. Counters are monotone; derived metrics are computed fresh on
/// every call to [`StatsAggregator::snapshot`].
#[derive(Debug, Clone, Getters)]
pub struct StatsSnapshot {
    frames_queued: u64,
    frames_sent: u64,
    frames_dropped: u64,
    retries: u64,
    present_attempts: u64,
    presented: u64,
    realtime_enable_count: u64,
    realtime_disable_count: u64,
    success_rate: f64,
    drop_rate: f64,
    effective_fps: f64,
}

impl StatsSnapshot {
    pub fn health(&self) -> Health {
        let success_pct = self.success_rate * 100.0;
        let drop_pct = self.drop_rate * 100.0;
        if success_pct > 95.0 && drop_pct < 2.0 {
            Health::Excellent
        } else if success_pct > 85.0 && drop_pct < 5.0 {
            Health::Good
        } else if success_pct > 70.0 && drop_pct < 10.0 {
            Health::Fair
        } else {
            Health::Poor
        }
    }
}

/// Atomic 64-bit counters for the pipeline's running totals, plus the
/// exponentially-smoothed inter-present frame time used by the pacer
/// (`avg := 0.9*avg + 0.1*dt`). The average is stored as the bit pattern of
/// an `f64` behind a CAS loop since there's no atomic float type.
#[derive(Default)]
pub struct StatsAggregator {
    frames_queued: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    retries: AtomicU64,
    present_attempts: AtomicU64,
    presented: AtomicU64,
    realtime_enable_count: AtomicU64,
    realtime_disable_count: AtomicU64,
    avg_frame_time_ms_bits: AtomicU64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queued(&self) {
        self.frames_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_present_attempt(&self) {
        self.present_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presented(&self) {
        self.presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_realtime_enabled(&self) {
        self.realtime_enable_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_realtime_disabled(&self) {
        self.realtime_disable_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds `dt_ms` into the EWMA: `avg := 0.9*avg + 0.1*dt`. The very
    /// first sample seeds the average directly rather than blending against
    /// zero, so early frame-time estimates aren't biased low.
    pub fn record_frame_time(&self, dt_ms: f64) {
        loop {
            let current_bits = self.avg_frame_time_ms_bits.load(Ordering::Relaxed);
            let current = f64::from_bits(current_bits);
            let next = if current_bits == 0 {
                dt_ms
            } else {
                0.9 * current + 0.1 * dt_ms
            };
            let next_bits = next.to_bits();
            if self
                .avg_frame_time_ms_bits
                .compare_exchange_weak(current_bits, next_bits, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    fn avg_frame_time_ms(&self) -> f64 {
        f64::from_bits(self.avg_frame_time_ms_bits.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let frames_queued = self.frames_queued.load(Ordering::Relaxed);
        let frames_sent = self.frames_sent.load(Ordering::Relaxed);
        let frames_dropped = self.frames_dropped.load(Ordering::Relaxed);
        let avg_frame_time_ms = self.avg_frame_time_ms();

        let success_rate = if frames_queued == 0 {
            0.0
        } else {
            frames_sent as f64 / frames_queued as f64
        };
        let drop_rate = if frames_queued == 0 {
            0.0
        } else {
            frames_dropped as f64 / frames_queued as f64
        };
        let effective_fps = if avg_frame_time_ms > 0.0 {
            1000.0 / avg_frame_time_ms
        } else {
            0.0
        };

        StatsSnapshot {
            frames_queued,
            frames_sent,
            frames_dropped,
            retries: self.retries.load(Ordering::Relaxed),
            present_attempts: self.present_attempts.load(Ordering::Relaxed),
            presented: self.presented.load(Ordering::Relaxed),
            realtime_enable_count: self.realtime_enable_count.load(Ordering::Relaxed),
            realtime_disable_count: self.realtime_disable_count.load(Ordering::Relaxed),
            success_rate,
            drop_rate,
            effective_fps,
        }
    }

    pub fn reset(&self) {
        self.frames_queued.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.present_attempts.store(0, Ordering::Relaxed);
        self.presented.store(0, Ordering::Relaxed);
        self.realtime_enable_count.store(0, Ordering::Relaxed);
        self.realtime_disable_count.store(0, Ordering::Relaxed);
        self.avg_frame_time_ms_bits.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_buckets() {
        let stats = StatsAggregator::new();
        for _ in 0..100 {
            stats.record_queued();
        }
        for _ in 0..98 {
            stats.record_sent();
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.health(), Health::Excellent);
    }

    #[test]
    fn ewma_seeds_on_first_sample() {
        let stats = StatsAggregator::new();
        stats.record_frame_time(33.3);
        assert!((*stats.snapshot().effective_fps() - 30.03).abs() < 0.5);
    }

    #[test]
    fn derived_rates_are_zero_with_no_samples() {
        let stats = StatsAggregator::new();
        let snapshot = stats.snapshot();
        assert_eq!(*snapshot.success_rate(), 0.0);
        assert_eq!(*snapshot.drop_rate(), 0.0);
    }
}
