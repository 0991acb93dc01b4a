use std::time::Instant;

use crate::mem::{DmaBuffer, PhysAddr};

/// Ownership state of one capture buffer.
///
/// `Dequeued` buffers belong to the consumer, everything else to the driver.
/// Only `Queued`/`Active` buffers may be latched into a DMA address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Dequeued,
    Queued,
    Active,
    Done,
    Error,
}

/// Capture buffer backed by DMA memory
#[derive(Debug, Clone)]
pub struct VideoBuffer {
    pub index: usize,
    pub dma: DmaBuffer,
    pub state: BufferState,
}

impl VideoBuffer {
    pub fn new(index: usize, dma: DmaBuffer) -> Self {
        Self {
            index,
            dma,
            state: BufferState::Dequeued,
        }
    }

    pub fn phys(&self) -> PhysAddr {
        self.dma.phys()
    }
}

/// Completion record handed to the consumer when a buffer retires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneFrame {
    pub index: usize,
    /// Per-node monotonic sequence. Never reset, not even by a recovery.
    pub sequence: u64,
    pub bytes_used: u32,
    pub state: BufferState,
    pub timestamp: Instant,
}
