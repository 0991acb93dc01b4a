//! Simulated-platform rig shared by the integration tests.

#![allow(dead_code)]

use sunxi_vin::hw::regs;
use sunxi_vin::pipeline::{MediaGraph, SimPlatform};
use sunxi_vin::{Config, VinDevice};

pub struct Rig {
    pub sim: SimPlatform,
    pub graph: MediaGraph,
}

pub fn rig() -> Rig {
    rig_with(Config::default())
}

pub fn rig_with(cfg: Config) -> Rig {
    let sim = SimPlatform::new(&cfg).unwrap();
    let graph = MediaGraph::new(sim.platform(), cfg).unwrap();
    Rig { sim, graph }
}

impl Rig {
    pub fn device(&self, vinc: usize) -> VinDevice {
        VinDevice::new(&self.graph, vinc).unwrap()
    }

    pub fn dma_reg(&self, id: usize, off: u32) -> u32 {
        self.graph.platform().regs.dma.base_of(id).unwrap() + off
    }

    pub fn isp_reg(&self, id: usize, off: u32) -> u32 {
        self.graph.platform().regs.isp.base_of(id).unwrap() + off
    }

    pub fn parser_reg(&self, id: usize, off: u32) -> u32 {
        self.graph.platform().regs.parser.base_of(id).unwrap() + off
    }

    /// Raise DMA interrupt bits and run every handler.
    pub fn fire_dma(&self, id: usize, bits: u32) {
        self.sim.regs.raise(self.dma_reg(id, regs::dma::off::INT_STA), bits);
        self.graph.irq_all();
    }

    pub fn fire_isp(&self, id: usize, bits: u32) {
        self.sim.regs.raise(self.isp_reg(id, regs::isp::off::INT_STA), bits);
        self.graph.irq_all();
    }

    /// One captured frame on DMA `id`: vsync, then frame done.
    pub fn frame(&self, id: usize) {
        self.fire_dma(id, regs::dma::INT_VSYNC);
        self.fire_dma(id, regs::dma::INT_FRAME_DONE);
    }
}

/// Open `dev`, allocate `count` buffers and queue them all.
pub fn prepare(dev: &VinDevice, count: u32) -> u32 {
    dev.open().unwrap();
    let n = dev.request_buffers(count).unwrap();
    for i in 0..n as usize {
        dev.queue_buffer(i).unwrap();
    }
    n
}
