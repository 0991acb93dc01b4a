//! TDM receiver bridge between parsers and the ISP.
//!
//! Raw lines are buffered in DRAM so one ISP can serve several sensors in
//! time-division. The receive buffers exist only while some pipeline streams
//! through the bridge.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, VinError};
use crate::hw::regs::tdm::{off, RX_CFG, TDM_TOP};
use crate::hw::{pack_size, RegBlock};
use crate::mem::{self, DmaAllocator, DmaBuffer};
use crate::pipeline::{SharedGate, Subdev};
use crate::platform::PlatformDesc;
use crate::utils::align_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RxGeometry {
    width: u32,
    height: u32,
    bit_depth: u32,
}

impl RxGeometry {
    fn frame_bytes(&self) -> usize {
        align_up(self.width * self.bit_depth / 8, 16) as usize * self.height as usize
    }
}

#[derive(Default)]
struct TdmState {
    geometry: Option<RxGeometry>,
    bufs: Vec<DmaBuffer>,
}

pub struct TdmRx {
    id: usize,
    name: String,
    regs: RegBlock,
    plat: &'static PlatformDesc,
    alloc: Arc<dyn DmaAllocator>,
    power_gate: SharedGate,
    stream_gate: SharedGate,
    state: spin::Mutex<TdmState>,
}

impl TdmRx {
    pub fn new(
        id: usize,
        regs: RegBlock,
        plat: &'static PlatformDesc,
        alloc: Arc<dyn DmaAllocator>,
    ) -> Self {
        Self {
            id,
            name: format!("tdm{id}"),
            regs,
            plat,
            alloc,
            power_gate: SharedGate::new("power"),
            stream_gate: SharedGate::new("stream"),
            state: spin::Mutex::new(TdmState::default()),
        }
    }

    pub fn configure(&self, width: u32, height: u32, bit_depth: u32) -> Result<()> {
        let geo = RxGeometry {
            width,
            height,
            bit_depth,
        };
        let mut st = self.state.lock();
        if self.stream_gate.is_held() && st.geometry != Some(geo) {
            return Err(VinError::Busy(self.name.clone()));
        }
        st.geometry = Some(geo);
        Ok(())
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().bufs.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.is_set(off::TOP, TDM_TOP::EN)
    }
}

impl Subdev for TdmRx {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_gate(&self) -> &SharedGate {
        &self.power_gate
    }

    fn stream_gate(&self) -> &SharedGate {
        &self.stream_gate
    }

    fn hw_enable(&self) -> Result<()> {
        let geo = self
            .state
            .lock()
            .geometry
            .ok_or(VinError::InvalidState("tdm not configured"))?;
        let count = self.plat.tdm_rx_buffers.max(1);
        let size = geo.frame_bytes();
        // Partial failures drop whatever was allocated so far.
        let bufs = (0..count)
            .map(|slot| mem::alloc(&self.alloc, size, &format!("{}-rx{slot}", self.name)))
            .collect::<Result<Vec<_>>>()?;

        for (slot, buf) in bufs.iter().enumerate() {
            let addr = (buf.phys() >> self.plat.dma_addr_shift) as u32;
            self.regs.write(off::rx_addr(0, slot), addr);
        }
        self.regs.write(off::rx_size(0), pack_size(geo.width, geo.height));
        self.regs.write_fields(
            off::rx_cfg(0),
            RX_CFG::EN::SET + RX_CFG::BUF_NUM.val(count as u32),
        );
        self.regs.write_fields(off::TOP, TDM_TOP::EN::SET);
        self.state.lock().bufs = bufs;
        info!(tdm = self.id, count, size, "tdm receiver enabled");
        Ok(())
    }

    fn hw_disable(&self) {
        self.regs.write(off::TOP, 0);
        self.regs.write(off::rx_cfg(0), 0);
        let bufs = std::mem::take(&mut self.state.lock().bufs);
        debug!(tdm = self.id, released = bufs.len(), "tdm receive buffers released");
        drop(bufs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockRegisters;
    use crate::mem::SimAllocator;

    #[test]
    fn buffers_live_only_while_enabled() {
        let plat = PlatformDesc::lookup("sun55iw3").unwrap();
        let mock = Arc::new(MockRegisters::new());
        let alloc = SimAllocator::new(0x4000_0000, 64 << 20);
        let tdm = TdmRx::new(0, RegBlock::new(mock, 0x1_0000, "tdm0"), plat, alloc.clone());
        tdm.configure(1920, 1080, 10).unwrap();
        tdm.hw_enable().unwrap();
        assert_eq!(tdm.buffer_count(), plat.tdm_rx_buffers);
        assert!(tdm.is_enabled());
        tdm.hw_disable();
        assert_eq!(tdm.buffer_count(), 0);
        assert_eq!(alloc.live_allocations(), 0);
    }

    #[test]
    fn allocation_failure_releases_partial_set() {
        let plat = PlatformDesc::lookup("sun55iw3").unwrap();
        let mock = Arc::new(MockRegisters::new());
        let alloc = SimAllocator::new(0x4000_0000, 64 << 20);
        alloc.fail_after(1);
        let tdm = TdmRx::new(0, RegBlock::new(mock, 0x1_0000, "tdm0"), plat, alloc.clone());
        tdm.configure(1920, 1080, 10).unwrap();
        assert!(matches!(tdm.hw_enable(), Err(VinError::NoMemory { .. })));
        assert_eq!(alloc.live_allocations(), 0);
        assert!(!tdm.is_enabled());
    }
}
