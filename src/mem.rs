//! DMA memory collaborator.
//!
//! The capture core needs physically contiguous buffers with a known bus
//! address and a CPU mapping. [`DmaAllocator`] is the seam; [`SimAllocator`]
//! is a bump allocator over a fake physical window used by the simulation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::{Result, VinError};

pub type PhysAddr = u64;

/// Handle used to pass a buffer to another consumer without copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExportHandle(pub u64);

/// One contiguous DMA allocation.
///
/// Cloning shares the same memory; the allocation is returned to the
/// allocator when the last clone is dropped.
#[derive(Clone)]
pub struct DmaBuffer {
    inner: Arc<DmaInner>,
}

struct DmaInner {
    phys: PhysAddr,
    size: usize,
    name: String,
    cpu: spin::Mutex<BytesMut>,
    owner: Option<Arc<dyn DmaAllocator>>,
}

impl Drop for DmaInner {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(self.phys, self.size);
        }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("name", &self.inner.name)
            .field("phys", &format_args!("{:#x}", self.inner.phys))
            .field("size", &self.inner.size)
            .finish()
    }
}

impl DmaBuffer {
    /// Wrap memory handed out by `owner`; `owner.release` runs on last drop.
    pub fn new(
        phys: PhysAddr,
        size: usize,
        name: impl Into<String>,
        owner: Option<Arc<dyn DmaAllocator>>,
    ) -> Self {
        Self {
            inner: Arc::new(DmaInner {
                phys,
                size,
                name: name.into(),
                cpu: spin::Mutex::new(BytesMut::zeroed(size)),
                owner,
            }),
        }
    }

    pub fn phys(&self) -> PhysAddr {
        self.inner.phys
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Copy `src` into the CPU mapping at `offset`. Out-of-range writes are
    /// truncated to the buffer size.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let mut cpu = self.inner.cpu.lock();
        if offset >= cpu.len() {
            return 0;
        }
        let n = src.len().min(cpu.len() - offset);
        cpu[offset..offset + n].copy_from_slice(&src[..n]);
        n
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let cpu = self.inner.cpu.lock();
        if offset >= cpu.len() {
            return 0;
        }
        let n = dst.len().min(cpu.len() - offset);
        dst[..n].copy_from_slice(&cpu[offset..offset + n]);
        n
    }

    /// Run `f` over the whole CPU mapping.
    pub fn with_cpu<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut cpu = self.inner.cpu.lock();
        f(&mut cpu[..])
    }

    pub fn fill(&self, byte: u8) {
        self.with_cpu(|m| m.fill(byte));
    }

    /// Two handles point at the same allocation.
    pub fn same_memory(&self, other: &DmaBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Contiguous DMA allocator.
pub trait DmaAllocator: Send + Sync {
    /// Allocate `size` bytes. Implementations must hand back a buffer whose
    /// drop calls [`DmaAllocator::release`].
    fn alloc(self: Arc<Self>, size: usize, name: &str) -> Result<DmaBuffer>;

    /// Return `size` bytes at `phys` to the allocator.
    fn release(&self, phys: PhysAddr, size: usize);

    /// Publish `buf` so another consumer can import it.
    fn export(&self, buf: &DmaBuffer) -> ExportHandle;

    fn import(&self, handle: ExportHandle) -> Option<DmaBuffer>;

    /// Withdraw a published handle. Buffers already imported stay valid.
    fn unexport(&self, handle: ExportHandle);
}

/// Allocate through a shared allocator handle.
pub fn alloc(allocator: &Arc<dyn DmaAllocator>, size: usize, name: &str) -> Result<DmaBuffer> {
    allocator.clone().alloc(size, name)
}

const SIM_PAGE: u64 = 0x1000;

#[derive(Default)]
struct SimState {
    next: PhysAddr,
    in_use: usize,
    live: BTreeMap<PhysAddr, usize>,
    exported: BTreeMap<u64, DmaBuffer>,
    fail_after: Option<usize>,
}

/// Bump allocator over a fake physical window.
///
/// Freed space is not reused; addresses stay unique for the lifetime of the
/// allocator, which makes stale-pointer bugs visible in tests.
pub struct SimAllocator {
    base: PhysAddr,
    capacity: usize,
    state: Mutex<SimState>,
    next_handle: AtomicU64,
}

impl SimAllocator {
    pub fn new(base: PhysAddr, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            base,
            capacity,
            state: Mutex::new(SimState {
                next: base,
                ..Default::default()
            }),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Make the allocator fail once `n` more allocations have succeeded.
    pub fn fail_after(&self, n: usize) {
        if let Ok(mut st) = self.state.lock() {
            st.fail_after = Some(n);
        }
    }

    pub fn clear_failure(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.fail_after = None;
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        self.state.lock().map(|st| st.in_use).unwrap_or(0)
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().map(|st| st.live.len()).unwrap_or(0)
    }
}

impl DmaAllocator for SimAllocator {
    fn alloc(self: Arc<Self>, size: usize, name: &str) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(VinError::InvalidArgument("zero-sized DMA allocation"));
        }
        let phys = {
            let mut st = self
                .state
                .lock()
                .map_err(|_| VinError::NoMemory { requested: size })?;
            if let Some(left) = st.fail_after.as_mut() {
                if *left == 0 {
                    warn!(name, size, "simulated DMA allocation failure");
                    return Err(VinError::NoMemory { requested: size });
                }
                *left -= 1;
            }
            if st.in_use + size > self.capacity {
                return Err(VinError::NoMemory { requested: size });
            }
            let phys = st.next;
            let span = (size as u64).div_ceil(SIM_PAGE) * SIM_PAGE;
            st.next += span;
            st.in_use += size;
            st.live.insert(phys, size);
            phys
        };
        debug!(name, size, phys = format_args!("{:#x}", phys), "dma alloc");
        let owner: Arc<dyn DmaAllocator> = self;
        Ok(DmaBuffer::new(phys, size, name, Some(owner)))
    }

    fn release(&self, phys: PhysAddr, size: usize) {
        if let Ok(mut st) = self.state.lock() {
            if st.live.remove(&phys).is_some() {
                st.in_use -= size;
            } else {
                warn!(phys = format_args!("{:#x}", phys), "release of unknown DMA buffer");
            }
        }
    }

    fn export(&self, buf: &DmaBuffer) -> ExportHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut st) = self.state.lock() {
            st.exported.insert(id, buf.clone());
        }
        ExportHandle(id)
    }

    fn import(&self, handle: ExportHandle) -> Option<DmaBuffer> {
        self.state
            .lock()
            .ok()
            .and_then(|st| st.exported.get(&handle.0).cloned())
    }

    fn unexport(&self, handle: ExportHandle) {
        // The last clone releases into `state`, so drop it after unlocking.
        let removed = match self.state.lock() {
            Ok(mut st) => st.exported.remove(&handle.0),
            Err(_) => None,
        };
        drop(removed);
    }
}

impl SimAllocator {
    pub fn exported_count(&self) -> usize {
        self.state.lock().map(|st| st.exported.len()).unwrap_or(0)
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }
}
