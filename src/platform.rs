//! Per-SoC descriptors.
//!
//! Everything that used to vary by compile-time SoC selection (block counts,
//! register bases, alignment, memory ceilings, ping-pong depths, split-image
//! thresholds) lives in a [`PlatformDesc`] picked by name at start-up.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VinError};

/// ISP generation. Selects register field widths and the LBC tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IspPlatform {
    Isp520,
    Isp521,
    Isp600,
}

/// How capture devices map onto parsers and ISPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topology {
    /// One parser per ISP, one ISP per video node.
    Linear,
    /// Several video nodes share one parser/ISP through virtual channels.
    VirtualChannels,
    /// Parser output is buffered through a TDM receiver before the ISP.
    TdmBridge,
}

/// Base address and per-instance stride of a block family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMap {
    pub base: u32,
    pub stride: u32,
    pub count: usize,
}

impl BlockMap {
    pub const fn new(base: u32, stride: u32, count: usize) -> Self {
        Self { base, stride, count }
    }

    pub fn base_of(&self, id: usize) -> Option<u32> {
        (id < self.count).then(|| self.base + self.stride * id as u32)
    }
}

/// Register address map of the whole capture subsystem.
#[derive(Debug, Clone, Copy)]
pub struct RegisterLayout {
    pub top: u32,
    pub parser: BlockMap,
    pub mipi: BlockMap,
    pub tdm: BlockMap,
    pub isp: BlockMap,
    pub vipp: BlockMap,
    pub dma: BlockMap,
}

/// Overlap added to each half of a split (large) image.
///
/// `overlap = align_up(base + width / div, align)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct OverlapFormula {
    pub base: u32,
    pub div: u32,
    pub align: u32,
    pub max: u32,
}

#[derive(Debug, Clone)]
pub struct PlatformDesc {
    pub name: &'static str,
    pub isp_platform: IspPlatform,
    pub topology: Topology,
    pub regs: RegisterLayout,
    /// Output channels per ISP (main + sub channels).
    pub isp_channels: usize,

    pub width_align: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Widest input a single ISP handles before split mode kicks in.
    pub isp_max_width: u32,
    pub large_overlap: OverlapFormula,

    pub max_frame_mem: u64,
    /// DMA address registers hold `addr >> dma_addr_shift`.
    pub dma_addr_shift: u32,

    pub isp_load_size: usize,
    pub isp_save_size: usize,
    pub isp_stat_size: usize,
    pub d3d_buffers: usize,
    pub wdr_buffers: usize,
    pub tdm_rx_buffers: usize,
    pub lbc_bw_limit_bits: u32,
    pub lbc_sat_bits: u32,

    pub quiesce_polls: u32,
    pub quiesce_delay_us: u32,

    pub csi_top_clk_hz: u64,
    pub isp_clk_hz: u64,
    pub mclk_hz: u64,
}

impl PlatformDesc {
    pub fn lookup(name: &str) -> Result<&'static PlatformDesc> {
        PLATFORMS
            .get(name)
            .ok_or_else(|| VinError::UnknownPlatform(name.to_string()))
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        PLATFORMS.keys().copied()
    }

    /// Whether a frame `width` pixels wide must be split across two ISP passes.
    pub fn needs_split(&self, width: u32) -> bool {
        width > self.isp_max_width
    }
}

fn sun8iw21() -> PlatformDesc {
    PlatformDesc {
        name: "sun8iw21",
        isp_platform: IspPlatform::Isp600,
        topology: Topology::VirtualChannels,
        regs: RegisterLayout {
            top: 0x0000,
            parser: BlockMap::new(0x1000, 0x1000, 3),
            mipi: BlockMap::new(0x8000, 0x1000, 2),
            tdm: BlockMap::new(0x1_0000, 0x1000, 1),
            isp: BlockMap::new(0x2_0000, 0x1000, 1),
            vipp: BlockMap::new(0x3_0000, 0x400, 4),
            dma: BlockMap::new(0x4_0000, 0x1000, 4),
        },
        isp_channels: 4,
        width_align: 16,
        min_width: 32,
        min_height: 32,
        max_width: 3840,
        max_height: 2160,
        isp_max_width: 3840,
        large_overlap: OverlapFormula {
            base: 64,
            div: 32,
            align: 16,
            max: 256,
        },
        max_frame_mem: 150 * 1024 * 1024,
        dma_addr_shift: 2,
        isp_load_size: 0x2000,
        isp_save_size: 0x400,
        isp_stat_size: 0x4000,
        d3d_buffers: 2,
        wdr_buffers: 2,
        tdm_rx_buffers: 2,
        lbc_bw_limit_bits: 12,
        lbc_sat_bits: 10,
        quiesce_polls: 200,
        quiesce_delay_us: 500,
        csi_top_clk_hz: 300_000_000,
        isp_clk_hz: 300_000_000,
        mclk_hz: 24_000_000,
    }
}

fn sun8iw19() -> PlatformDesc {
    PlatformDesc {
        name: "sun8iw19",
        isp_platform: IspPlatform::Isp520,
        topology: Topology::Linear,
        regs: RegisterLayout {
            top: 0x0000,
            parser: BlockMap::new(0x1000, 0x1000, 2),
            mipi: BlockMap::new(0x8000, 0x1000, 2),
            tdm: BlockMap::new(0x1_0000, 0x1000, 0),
            isp: BlockMap::new(0x2_0000, 0x1000, 2),
            vipp: BlockMap::new(0x3_0000, 0x400, 4),
            dma: BlockMap::new(0x4_0000, 0x1000, 4),
        },
        isp_channels: 2,
        width_align: 16,
        min_width: 32,
        min_height: 32,
        max_width: 2688,
        max_height: 1944,
        isp_max_width: 2688,
        large_overlap: OverlapFormula {
            base: 64,
            div: 32,
            align: 16,
            max: 256,
        },
        max_frame_mem: 64 * 1024 * 1024,
        dma_addr_shift: 0,
        isp_load_size: 0x1000,
        isp_save_size: 0x400,
        isp_stat_size: 0x2000,
        d3d_buffers: 2,
        wdr_buffers: 2,
        tdm_rx_buffers: 0,
        lbc_bw_limit_bits: 12,
        lbc_sat_bits: 10,
        quiesce_polls: 200,
        quiesce_delay_us: 500,
        csi_top_clk_hz: 336_000_000,
        isp_clk_hz: 336_000_000,
        mclk_hz: 24_000_000,
    }
}

fn sun55iw3() -> PlatformDesc {
    PlatformDesc {
        name: "sun55iw3",
        isp_platform: IspPlatform::Isp521,
        topology: Topology::TdmBridge,
        regs: RegisterLayout {
            top: 0x0000,
            parser: BlockMap::new(0x1000, 0x1000, 4),
            mipi: BlockMap::new(0x8000, 0x1000, 4),
            tdm: BlockMap::new(0x1_0000, 0x1000, 1),
            isp: BlockMap::new(0x2_0000, 0x1000, 2),
            vipp: BlockMap::new(0x3_0000, 0x400, 8),
            dma: BlockMap::new(0x4_0000, 0x1000, 8),
        },
        isp_channels: 4,
        width_align: 16,
        min_width: 32,
        min_height: 32,
        max_width: 8192,
        max_height: 4320,
        isp_max_width: 4224,
        large_overlap: OverlapFormula {
            base: 128,
            div: 64,
            align: 32,
            max: 512,
        },
        max_frame_mem: 512 * 1024 * 1024,
        dma_addr_shift: 2,
        isp_load_size: 0x4000,
        isp_save_size: 0x800,
        isp_stat_size: 0x8000,
        d3d_buffers: 3,
        wdr_buffers: 2,
        tdm_rx_buffers: 4,
        lbc_bw_limit_bits: 12,
        lbc_sat_bits: 10,
        quiesce_polls: 200,
        quiesce_delay_us: 500,
        csi_top_clk_hz: 400_000_000,
        isp_clk_hz: 400_000_000,
        mclk_hz: 27_000_000,
    }
}

static PLATFORMS: Lazy<HashMap<&'static str, PlatformDesc>> = Lazy::new(|| {
    [sun8iw21(), sun8iw19(), sun55iw3()]
        .into_iter()
        .map(|p| (p.name, p))
        .collect()
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_and_unknown() {
        assert_eq!(PlatformDesc::lookup("sun8iw21").unwrap().width_align, 16);
        assert!(matches!(
            PlatformDesc::lookup("sun4i"),
            Err(VinError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn block_bases_stay_in_range() {
        let p = PlatformDesc::lookup("sun8iw19").unwrap();
        assert_eq!(p.regs.isp.base_of(1), Some(0x2_1000));
        assert_eq!(p.regs.isp.base_of(2), None);
        assert_eq!(p.regs.tdm.base_of(0), None);
    }

    #[test]
    fn split_only_above_isp_limit() {
        let p = PlatformDesc::lookup("sun55iw3").unwrap();
        assert!(!p.needs_split(4224));
        assert!(p.needs_split(4225));
    }
}
