//! Rotating reference buffers for 3D noise reduction and WDR fusion.

use std::sync::Arc;

use crate::error::Result;
use crate::mem::{self, DmaAllocator, DmaBuffer, PhysAddr};

/// A set of DMA buffers whose roles rotate by one every frame.
///
/// Role 0 is the buffer the ISP writes this frame; higher roles hold older
/// frames it reads back.
#[derive(Debug)]
pub struct PingPong {
    bufs: Vec<DmaBuffer>,
    rotation: usize,
    size: usize,
}

impl PingPong {
    /// Allocate `count` buffers of `size` bytes. If any allocation fails the
    /// ones already obtained are released before the error is returned.
    pub fn alloc(alloc: &Arc<dyn DmaAllocator>, count: usize, size: usize, name: &str) -> Result<Self> {
        let bufs = (0..count)
            .map(|i| mem::alloc(alloc, size, &format!("{name}{i}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            bufs,
            rotation: 0,
            size,
        })
    }

    pub fn count(&self) -> usize {
        self.bufs.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn matches(&self, count: usize, size: usize) -> bool {
        self.bufs.len() == count && self.size == size
    }

    pub fn rotate(&mut self) {
        if !self.bufs.is_empty() {
            self.rotation = (self.rotation + 1) % self.bufs.len();
        }
    }

    pub fn reset_rotation(&mut self) {
        self.rotation = 0;
    }

    pub fn role_addr(&self, role: usize) -> PhysAddr {
        let n = self.bufs.len().max(1);
        self.bufs
            .get((role + self.rotation) % n)
            .map(DmaBuffer::phys)
            .unwrap_or(0)
    }

    /// Buffer at `role` after the current rotation.
    pub fn role(&self, role: usize) -> Option<&DmaBuffer> {
        let n = self.bufs.len().max(1);
        self.bufs.get((role + self.rotation) % n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VinError;
    use crate::mem::SimAllocator;

    #[test]
    fn roles_rotate_through_every_buffer() {
        let alloc: Arc<dyn DmaAllocator> = SimAllocator::new(0x4000_0000, 1 << 20);
        let mut pp = PingPong::alloc(&alloc, 3, 0x1000, "d3d").unwrap();
        let first: Vec<PhysAddr> = (0..3).map(|r| pp.role_addr(r)).collect();
        pp.rotate();
        assert_eq!(pp.role_addr(0), first[1]);
        assert_eq!(pp.role_addr(2), first[0]);
        pp.rotate();
        pp.rotate();
        assert_eq!(pp.role_addr(0), first[0]);
    }

    #[test]
    fn partial_failure_releases_everything() {
        let sim = SimAllocator::new(0x4000_0000, 1 << 20);
        sim.fail_after(2);
        let alloc: Arc<dyn DmaAllocator> = sim.clone();
        let r = PingPong::alloc(&alloc, 3, 0x1000, "d3d");
        assert!(matches!(r, Err(VinError::NoMemory { .. })));
        assert_eq!(sim.live_allocations(), 0);
    }
}
