//! Per-channel counters written from interrupt context.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Lock-free status of one capture channel.
///
/// Writers are the interrupt handlers; readers (diagnostics, the control
/// plane) take a [`StatsSnapshot`] without locking.
#[derive(Debug, Default)]
pub struct ChannelStats {
    frame_cnt: CachePadded<AtomicU64>,
    lost_cnt: CachePadded<AtomicU64>,
    err_cnt: CachePadded<AtomicU64>,
    reset_cnt: CachePadded<AtomicU64>,
    fifo_overflow_cnt: CachePadded<AtomicU64>,
    last_interval_us: CachePadded<AtomicU64>,
    max_latency_us: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub frame_cnt: u64,
    pub lost_cnt: u64,
    pub err_cnt: u64,
    pub reset_cnt: u64,
    pub fifo_overflow_cnt: u64,
    pub last_interval_us: u64,
    pub max_latency_us: u64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(&self) {
        self.frame_cnt.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vin.frames.done").increment(1);
    }

    pub fn lost(&self) {
        self.lost_cnt.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vin.frames.lost").increment(1);
    }

    pub fn error(&self) {
        self.err_cnt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fifo_overflow(&self) {
        self.fifo_overflow_cnt.fetch_add(1, Ordering::Relaxed);
    }

    /// A reset completed: count it and restart the frame counter.
    pub fn reset(&self) {
        self.reset_cnt.fetch_add(1, Ordering::Relaxed);
        self.frame_cnt.store(0, Ordering::Relaxed);
    }

    pub fn record_timing(&self, interval_us: u64, latency_us: u64) {
        self.last_interval_us.store(interval_us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn frame_cnt(&self) -> u64 {
        self.frame_cnt.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frame_cnt: self.frame_cnt.load(Ordering::Relaxed),
            lost_cnt: self.lost_cnt.load(Ordering::Relaxed),
            err_cnt: self.err_cnt.load(Ordering::Relaxed),
            reset_cnt: self.reset_cnt.load(Ordering::Relaxed),
            fifo_overflow_cnt: self.fifo_overflow_cnt.load(Ordering::Relaxed),
            last_interval_us: self.last_interval_us.load(Ordering::Relaxed),
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter except `reset_cnt`.
    pub fn clear(&self) {
        for c in [
            &self.frame_cnt,
            &self.lost_cnt,
            &self.err_cnt,
            &self.fifo_overflow_cnt,
            &self.last_interval_us,
            &self.max_latency_us,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_restarts_frame_count_only() {
        let s = ChannelStats::new();
        s.frame();
        s.frame();
        s.lost();
        s.record_timing(33_000, 40);
        s.record_timing(33_300, 20);
        s.reset();
        let snap = s.snapshot();
        assert_eq!(snap.frame_cnt, 0);
        assert_eq!(snap.lost_cnt, 1);
        assert_eq!(snap.reset_cnt, 1);
        assert_eq!(snap.last_interval_us, 33_300);
        assert_eq!(snap.max_latency_us, 40);
    }
}
