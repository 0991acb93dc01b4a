//! Bounded history of hardware faults for diagnostics

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::error::HwFault;

/// Block that raised a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSource {
    Parser(usize),
    Isp(usize),
    Dma(usize),
}

impl std::fmt::Display for FaultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultSource::Parser(id) => write!(f, "csi{id}"),
            FaultSource::Isp(id) => write!(f, "isp{id}"),
            FaultSource::Dma(id) => write!(f, "vinc{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub source: FaultSource,
    pub fault: HwFault,
    /// Frame counter of the source at the time of the fault.
    pub frame_cnt: u64,
    pub at: Instant,
}

/// Overwriting ring of the most recent faults.
///
/// Recording never allocates, so it is safe from interrupt context.
pub struct FaultHistory {
    ring: spin::Mutex<HeapRb<FaultRecord>>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    recorded: AtomicUsize,
    overwritten: AtomicUsize,
}

impl FaultHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: spin::Mutex::new(HeapRb::new(capacity.max(1))),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn record(&self, rec: FaultRecord) {
        let evicted = self.ring.lock().push_overwrite(rec);
        if evicted.is_some() {
            self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.recorded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vin.faults").increment(1);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<FaultRecord> {
        self.ring.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return the oldest record.
    pub fn pop(&self) -> Option<FaultRecord> {
        self.ring.lock().try_pop()
    }

    /// (recorded, overwritten)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.recorded.load(Ordering::Relaxed),
            self.stats.overwritten.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: usize) -> FaultRecord {
        FaultRecord {
            source: FaultSource::Isp(id),
            fault: HwFault::FrameLost,
            frame_cnt: id as u64,
            at: Instant::now(),
        }
    }

    #[test]
    fn oldest_records_are_overwritten() {
        let h = FaultHistory::new(3);
        for i in 0..5 {
            h.record(rec(i));
        }
        let ids: Vec<u64> = h.snapshot().iter().map(|r| r.frame_cnt).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(h.stats(), (5, 2));
        assert_eq!(h.pop().map(|r| r.frame_cnt), Some(2));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn source_names() {
        assert_eq!(FaultSource::Parser(1).to_string(), "csi1");
        assert_eq!(FaultSource::Dma(0).to_string(), "vinc0");
    }
}
