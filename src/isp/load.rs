//! Double-buffered ISP parameter load region.
//!
//! The ISP fetches its parameters from one of two DMA banks at every frame
//! start. The control plane never writes a bank directly: it edits a shadow
//! copy, and the frame handler copies the whole shadow into the bank the
//! hardware is not using, then flips the active index.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{Result, VinError};
use crate::mem::{self, DmaAllocator, DmaBuffer, PhysAddr};

struct Shadow {
    data: BytesMut,
    generation: u64,
}

pub struct LoadRegion {
    banks: [DmaBuffer; 2],
    active: AtomicUsize,
    shadow: spin::Mutex<Shadow>,
    /// Shadow generation last copied into each bank.
    bank_gen: [AtomicU64; 2],
    flips: AtomicU64,
}

impl LoadRegion {
    /// Allocate both banks and seed them and the shadow with `image`.
    pub fn new(alloc: &Arc<dyn DmaAllocator>, size: usize, image: &[u8], name: &str) -> Result<Self> {
        let bank0 = mem::alloc(alloc, size, &format!("{name}-load0"))?;
        let bank1 = mem::alloc(alloc, size, &format!("{name}-load1"))?;
        let mut data = BytesMut::zeroed(size);
        let n = image.len().min(size);
        data[..n].copy_from_slice(&image[..n]);
        bank0.write_at(0, &data);
        bank1.write_at(0, &data);
        Ok(Self {
            banks: [bank0, bank1],
            active: AtomicUsize::new(0),
            shadow: spin::Mutex::new(Shadow {
                data,
                generation: 0,
            }),
            bank_gen: [AtomicU64::new(0), AtomicU64::new(0)],
            flips: AtomicU64::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.banks[0].size()
    }

    /// Bank the hardware is reading.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn bank_phys(&self, bank: usize) -> PhysAddr {
        self.banks[bank & 1].phys()
    }

    pub fn bank(&self, bank: usize) -> &DmaBuffer {
        &self.banks[bank & 1]
    }

    pub fn flips(&self) -> u64 {
        self.flips.load(Ordering::Relaxed)
    }

    /// Control-plane write into the shadow. Takes effect at a later frame
    /// boundary, never partially.
    pub fn write_shadow(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut sh = self.shadow.lock();
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= sh.data.len())
            .ok_or(VinError::InvalidArgument("parameter write outside load region"))?;
        sh.data[offset..end].copy_from_slice(bytes);
        sh.generation += 1;
        Ok(())
    }

    pub fn read_shadow(&self, offset: usize, dst: &mut [u8]) -> usize {
        let sh = self.shadow.lock();
        if offset >= sh.data.len() {
            return 0;
        }
        let n = dst.len().min(sh.data.len() - offset);
        dst[..n].copy_from_slice(&sh.data[offset..offset + n]);
        n
    }

    /// Bring the inactive bank up to date with the shadow and return its
    /// index. The active bank is never written.
    pub fn prepare_next(&self) -> usize {
        let target = 1 - self.active();
        let sh = self.shadow.lock();
        if self.bank_gen[target].load(Ordering::Relaxed) != sh.generation {
            self.banks[target].write_at(0, &sh.data);
            self.bank_gen[target].store(sh.generation, Ordering::Relaxed);
        }
        target
    }

    /// Make `bank` the active one.
    pub fn commit(&self, bank: usize) {
        self.active.store(bank & 1, Ordering::Release);
        self.flips.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::SimAllocator;

    fn region() -> LoadRegion {
        let alloc: Arc<dyn DmaAllocator> = SimAllocator::new(0x4000_0000, 1 << 20);
        LoadRegion::new(&alloc, 0x100, &[0xaa; 4], "isp0").unwrap()
    }

    #[test]
    fn flip_alternates_and_never_writes_active_bank() {
        let r = region();
        for i in 0..10u8 {
            let active = r.active();
            let before = {
                let mut b = [0u8; 1];
                r.bank(active).read_at(0x10, &mut b);
                b[0]
            };
            r.write_shadow(0x10, &[i]).unwrap();
            let target = r.prepare_next();
            assert_ne!(target, active);
            let mut after = [0u8; 1];
            r.bank(active).read_at(0x10, &mut after);
            assert_eq!(after[0], before, "active bank modified");
            r.bank(target).read_at(0x10, &mut after);
            assert_eq!(after[0], i);
            r.commit(target);
            assert_eq!(r.active(), target);
        }
        assert_eq!(r.flips(), 10);
    }

    #[test]
    fn stale_bank_catches_up_with_whole_shadow() {
        let r = region();
        r.write_shadow(0x0, &[1, 2]).unwrap();
        r.write_shadow(0x20, &[3]).unwrap();
        let t = r.prepare_next();
        r.commit(t);
        // Bank 0 missed both writes; the next prepare copies everything.
        let t = r.prepare_next();
        let mut b = [0u8; 2];
        r.bank(t).read_at(0, &mut b);
        assert_eq!(b, [1, 2]);
        r.bank(t).read_at(0x20, &mut b[..1]);
        assert_eq!(b[0], 3);
    }

    #[test]
    fn out_of_range_shadow_write_is_rejected() {
        let r = region();
        assert!(r.write_shadow(0xff, &[0, 0]).is_err());
        assert!(r.write_shadow(usize::MAX, &[0]).is_err());
        let mut b = [0u8; 4];
        r.read_shadow(0, &mut b);
        assert_eq!(b, [0xaa; 4]);
    }
}
