//! Buffer-count negotiation and the driver side of the buffer queue.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::frame::{BufferState, VideoBuffer};
use crate::error::{Result, VinError};

/// Default buffer count when the caller asks for zero.
pub const DEFAULT_BUFFERS: u32 = 8;
/// Minimum buffers for continuous video capture.
pub const MIN_VIDEO_BUFFERS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptureMode {
    #[default]
    Video,
    /// Single-shot still capture.
    Image,
    /// Output consumed directly by the video encoder; one buffer, or two when
    /// the encoder shares them.
    VeOnline { two_buffers: bool },
}

/// Negotiate how many `size`-byte buffers to allocate.
///
/// Zero means [`DEFAULT_BUFFERS`]. The count shrinks until it fits under
/// `ceiling`; if the ceiling forced a reduction the result is returned as is,
/// otherwise the capture mode's minimums are applied.
pub fn queue_setup(requested: u32, size: u32, mode: CaptureMode, ceiling: u64) -> Result<u32> {
    if size == 0 {
        return Err(VinError::InvalidArgument("zero buffer size"));
    }
    let mut n = if requested == 0 {
        DEFAULT_BUFFERS
    } else {
        requested
    };
    let mut clamped = false;
    while n > 0 && n as u64 * size as u64 > ceiling {
        n -= 1;
        clamped = true;
    }
    if n == 0 {
        return Err(VinError::NoMemory {
            requested: size as usize,
        });
    }
    if clamped {
        debug!(requested, granted = n, "buffer count clamped by frame memory");
        return Ok(n);
    }
    let fit = (ceiling / size as u64).min(u32::MAX as u64) as u32;
    Ok(match mode {
        CaptureMode::Image => 1,
        CaptureMode::Video => n.max(MIN_VIDEO_BUFFERS.min(fit)),
        CaptureMode::VeOnline { two_buffers } => {
            if two_buffers && fit >= 2 {
                2
            } else {
                1
            }
        }
    })
}

/// Buffers of one capture node plus the FIFO of driver-owned ones.
#[derive(Debug, Default)]
pub struct VideoQueue {
    bufs: Vec<VideoBuffer>,
    active: VecDeque<usize>,
}

impl VideoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the buffer set. Returns the previous buffers so their memory
    /// can be released outside any lock.
    pub fn install(&mut self, bufs: Vec<VideoBuffer>) -> Vec<VideoBuffer> {
        self.active.clear();
        self.active.reserve(bufs.len());
        std::mem::replace(&mut self.bufs, bufs)
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&VideoBuffer> {
        self.bufs.get(index)
    }

    pub fn buffers(&self) -> &[VideoBuffer] {
        &self.bufs
    }

    /// Hand a consumer-owned buffer to the driver.
    pub fn qbuf(&mut self, index: usize) -> Result<()> {
        let buf = self
            .bufs
            .get_mut(index)
            .ok_or(VinError::InvalidArgument("buffer index out of range"))?;
        if buf.state != BufferState::Dequeued {
            return Err(VinError::InvalidState("buffer is not owned by the consumer"));
        }
        buf.state = BufferState::Queued;
        self.active.push_back(index);
        Ok(())
    }

    /// Consumer took a completed buffer back.
    pub fn mark_dequeued(&mut self, index: usize) {
        if let Some(buf) = self.bufs.get_mut(index) {
            buf.state = BufferState::Dequeued;
        }
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn front(&self) -> Option<usize> {
        self.active.front().copied()
    }

    /// First driver-owned buffer other than `skip`.
    pub fn next_after(&self, skip: Option<usize>) -> Option<usize> {
        self.active.iter().copied().find(|&i| Some(i) != skip)
    }

    pub fn set_state(&mut self, index: usize, state: BufferState) {
        if let Some(buf) = self.bufs.get_mut(index) {
            buf.state = state;
        }
    }

    /// Remove `index` from the active FIFO and mark it `state`.
    pub fn retire(&mut self, index: usize, state: BufferState) -> bool {
        let Some(pos) = self.active.iter().position(|&i| i == index) else {
            return false;
        };
        self.active.remove(pos);
        self.set_state(index, state);
        true
    }

    /// Return every buffer to the consumer.
    pub fn recycle_all(&mut self) {
        self.active.clear();
        for buf in &mut self.bufs {
            buf.state = BufferState::Dequeued;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::DmaBuffer;

    const MIB: u64 = 1024 * 1024;
    const NV12_1080P: u32 = 1920 * 1080 * 3 / 2;

    #[test]
    fn zero_means_eight() {
        assert_eq!(
            queue_setup(0, NV12_1080P, CaptureMode::Video, 150 * MIB).unwrap(),
            8
        );
    }

    #[test]
    fn ceiling_wins_over_minimums() {
        // Only two 1080p NV12 frames fit in 7 MiB.
        let n = queue_setup(8, NV12_1080P, CaptureMode::Video, 7 * MIB).unwrap();
        assert_eq!(n, 2);
        assert!(matches!(
            queue_setup(4, NV12_1080P, CaptureMode::Video, MIB),
            Err(VinError::NoMemory { .. })
        ));
    }

    #[test]
    fn mode_minimums() {
        let c = 150 * MIB;
        assert_eq!(queue_setup(1, NV12_1080P, CaptureMode::Video, c).unwrap(), 3);
        assert_eq!(queue_setup(5, NV12_1080P, CaptureMode::Video, c).unwrap(), 5);
        assert_eq!(queue_setup(5, NV12_1080P, CaptureMode::Image, c).unwrap(), 1);
        let ve = |two| CaptureMode::VeOnline { two_buffers: two };
        assert_eq!(queue_setup(6, NV12_1080P, ve(false), c).unwrap(), 1);
        assert_eq!(queue_setup(6, NV12_1080P, ve(true), c).unwrap(), 2);
    }

    #[test]
    fn result_always_fits_under_ceiling() {
        let size = 1_000_000u32;
        for ceiling_mb in 1..20u64 {
            let ceiling = ceiling_mb * 1_000_000;
            for req in 0..12 {
                for mode in [
                    CaptureMode::Video,
                    CaptureMode::Image,
                    CaptureMode::VeOnline { two_buffers: true },
                ] {
                    let n = queue_setup(req, size, mode, ceiling).unwrap();
                    assert!(n >= 1);
                    assert!(n as u64 * size as u64 <= ceiling);
                }
            }
        }
    }

    fn queue(n: usize) -> VideoQueue {
        let mut q = VideoQueue::new();
        let bufs = (0..n)
            .map(|i| VideoBuffer::new(i, DmaBuffer::new(0x1000 * i as u64, 0x1000, "t", None)))
            .collect();
        q.install(bufs);
        q
    }

    #[test]
    fn qbuf_requires_consumer_ownership() {
        let mut q = queue(2);
        q.qbuf(1).unwrap();
        assert!(matches!(q.qbuf(1), Err(VinError::InvalidState(_))));
        assert!(matches!(q.qbuf(5), Err(VinError::InvalidArgument(_))));
        assert_eq!(q.front(), Some(1));
        assert_eq!(q.next_after(Some(1)), None);
    }

    #[test]
    fn retire_and_recycle() {
        let mut q = queue(3);
        for i in 0..3 {
            q.qbuf(i).unwrap();
        }
        assert!(q.retire(0, BufferState::Done));
        assert!(!q.retire(0, BufferState::Done));
        assert_eq!(q.get(0).unwrap().state, BufferState::Done);
        assert_eq!(q.next_after(Some(1)), Some(2));
        q.recycle_all();
        assert_eq!(q.active_len(), 0);
        assert!(q.buffers().iter().all(|b| b.state == BufferState::Dequeued));
    }
}
