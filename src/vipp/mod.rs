//! Scaler (VIPP) and DMA output stage.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument};

use crate::capture::format::{PixelFormat, PlaneLayout};
use crate::error::{Result, VinError};
use crate::hw::regs::vipp::{off, MODE, OSD_CFG, SC_CFG, SC_WEIGHT, START, VIPP_EN};
use crate::hw::{pack_size, RegBlock};
use crate::mem::{self, DmaAllocator, DmaBuffer};
use crate::pipeline::{SharedGate, Subdev};
use crate::platform::PlatformDesc;
use crate::utils::{align_down, align_up};

pub mod dma;
pub mod osd;

pub use dma::DmaEngine;
pub use osd::{Cover, OsdLayout, Overlay};

/// Largest downscale per axis.
pub const MAX_DOWNSCALE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Yuv420,
    Yuv422,
    Raw,
}

impl OutputFormat {
    pub fn for_pixel(pf: PixelFormat) -> Self {
        if pf.is_raw() {
            return OutputFormat::Raw;
        }
        match pf.layout() {
            PlaneLayout::SemiPlanar { chroma_v_div: 1, .. }
            | PlaneLayout::Planar { chroma_v_div: 1, .. }
            | PlaneLayout::Packed { .. } => OutputFormat::Yuv422,
            _ => OutputFormat::Yuv420,
        }
    }
}

/// 8.8 fixed-point ratio `out / in`.
pub fn scale_ratio(input: u32, output: u32) -> u32 {
    if input == 0 {
        return 0x100;
    }
    ((output as u64 * 256) / input as u64) as u32
}

#[derive(Debug, Clone, Copy)]
struct ScalerConfig {
    input: (u32, u32),
    crop: Rect,
    output: (u32, u32),
    format: OutputFormat,
}

struct OsdBuffers {
    bitmap: DmaBuffer,
    params: DmaBuffer,
    covers: DmaBuffer,
}

pub struct Vipp {
    id: usize,
    name: String,
    regs: RegBlock,
    plat: &'static PlatformDesc,
    alloc: Arc<dyn DmaAllocator>,
    power_gate: SharedGate,
    stream_gate: SharedGate,
    cfg: spin::Mutex<Option<ScalerConfig>>,
    osd: Mutex<Option<(OsdLayout, OsdBuffers)>>,
}

impl Vipp {
    pub fn new(id: usize, regs: RegBlock, plat: &'static PlatformDesc, alloc: Arc<dyn DmaAllocator>) -> Self {
        Self {
            id,
            name: format!("vipp{id}"),
            regs,
            plat,
            alloc,
            power_gate: SharedGate::new("power"),
            stream_gate: SharedGate::new("stream"),
            cfg: spin::Mutex::new(None),
            osd: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn regs(&self) -> &RegBlock {
        &self.regs
    }

    /// Normalise a crop rectangle: even start, size aligned down, inside
    /// `input`.
    pub fn adjust_crop(&self, input: (u32, u32), crop: Rect) -> Result<Rect> {
        let r = Rect {
            left: align_down(crop.left, 2),
            top: align_down(crop.top, 2),
            width: align_down(crop.width, self.plat.width_align),
            height: align_down(crop.height, 2),
        };
        if r.width == 0 || r.height == 0 {
            return Err(VinError::InvalidArgument("crop too small"));
        }
        if r.left + r.width > input.0 || r.top + r.height > input.1 {
            return Err(VinError::InvalidArgument("crop outside the input"));
        }
        Ok(r)
    }

    /// Validate and store the scaler configuration. The output must be a
    /// downscale of the crop by at most [`MAX_DOWNSCALE`] per axis.
    #[instrument(skip(self), fields(vipp = self.id))]
    pub fn configure(&self, input: (u32, u32), crop: Option<Rect>, output: (u32, u32), pf: PixelFormat) -> Result<Rect> {
        let crop = self.adjust_crop(input, crop.unwrap_or(Rect::full(input.0, input.1)))?;
        let (ow, oh) = output;
        if ow > crop.width || oh > crop.height {
            return Err(VinError::InvalidArgument("scaler cannot upscale"));
        }
        if ow * MAX_DOWNSCALE < crop.width || oh * MAX_DOWNSCALE < crop.height {
            return Err(VinError::InvalidArgument("downscale beyond 1/16"));
        }
        let cfg = ScalerConfig {
            input,
            crop,
            output,
            format: OutputFormat::for_pixel(pf),
        };
        let mut cur = self.cfg.lock();
        if self.stream_gate.is_held() {
            let same = cur.is_some_and(|c| c.crop == cfg.crop && c.output == cfg.output && c.format == cfg.format);
            return if same { Ok(crop) } else { Err(VinError::Busy(self.name.clone())) };
        }
        *cur = Some(cfg);
        debug!(?crop, ow, oh, "scaler configured");
        Ok(crop)
    }

    pub fn crop(&self) -> Option<Rect> {
        self.cfg.lock().map(|c| c.crop)
    }

    /// Program the scaler registers from the stored configuration.
    fn program(&self, cfg: &ScalerConfig) {
        let (iw, ih) = cfg.input;
        let (ow, oh) = cfg.output;
        let c = cfg.crop;
        self.regs.write(off::IN_SIZE, pack_size(iw, ih));
        self.regs
            .write_fields(off::CROP_START, START::HOR.val(c.left) + START::VER.val(c.top));
        self.regs.write(off::CROP_SIZE, pack_size(c.width, c.height));
        self.regs.write(off::OUT_SIZE, pack_size(ow, oh));
        let scaling = (ow, oh) != (c.width, c.height);
        let (xr, yr) = (scale_ratio(c.width, ow), scale_ratio(c.height, oh));
        self.regs
            .write_fields(off::SC_CFG, SC_CFG::XRATIO.val(xr) + SC_CFG::YRATIO.val(yr));
        // Weight shift grows with the downscale factor so the filter sum
        // stays inside 16 bits.
        let shift = 8 + (256 / xr.min(yr).max(1)).ilog2().min(4);
        self.regs.write_fields(off::SC_WEIGHT, SC_WEIGHT::SHIFT.val(shift));
        let fmt = match cfg.format {
            OutputFormat::Yuv420 => MODE::OUT_FMT::Yuv420,
            OutputFormat::Yuv422 => MODE::OUT_FMT::Yuv422,
            OutputFormat::Raw => MODE::OUT_FMT::Raw,
        };
        let sc = if scaling { MODE::SCALER_EN::SET } else { MODE::SCALER_EN::CLEAR };
        self.regs.write_fields(off::MODE, fmt + sc);
    }

    /// Composite `overlays`/`covers` into the OSD buffers. An empty list
    /// turns the overlay engine off.
    pub fn set_overlay(&self, overlays: &[Overlay], covers: &[Cover]) -> Result<()> {
        let (w, h) = self
            .cfg
            .lock()
            .map(|c| c.output)
            .ok_or(VinError::InvalidState("scaler not configured"))?;
        let layout = osd::compose(overlays, covers, w, h)?;
        let mut slot = self.osd.lock().unwrap_or_else(|e| e.into_inner());
        if layout.is_empty() {
            *slot = None;
            self.regs
                .modify(off::EN, VIPP_EN::OSD_OV_EN::CLEAR + VIPP_EN::OSD_CV_EN::CLEAR);
            return Ok(());
        }
        let table = layout.window_table();
        let cover_table = layout.cover_table();
        let bufs = OsdBuffers {
            bitmap: mem::alloc(&self.alloc, align_up(layout.bitmap.len().max(1) as u32, 64) as usize, &format!("{}-osd-bm", self.name))?,
            params: mem::alloc(&self.alloc, osd::MAX_OVERLAYS * 12, &format!("{}-osd-para", self.name))?,
            covers: mem::alloc(&self.alloc, osd::MAX_COVERS * 12, &format!("{}-osd-cv", self.name))?,
        };
        bufs.bitmap.write_at(0, &layout.bitmap);
        bufs.params.write_at(0, &table);
        bufs.covers.write_at(0, &cover_table);

        let shift = self.plat.dma_addr_shift;
        self.regs.write(off::OSD_BM_ADDR, (bufs.bitmap.phys() >> shift) as u32);
        self.regs.write(off::OSD_PARA_ADDR, (bufs.params.phys() >> shift) as u32);
        self.regs.write(off::OSD_CV_ADDR, (bufs.covers.phys() >> shift) as u32);
        self.regs.write_fields(
            off::OSD_CFG,
            OSD_CFG::OV_NUM.val(layout.windows.len() as u32)
                + OSD_CFG::CV_NUM.val(layout.covers.len() as u32)
                + OSD_CFG::ALPHA.val(0xff),
        );
        let ov = if layout.windows.is_empty() {
            VIPP_EN::OSD_OV_EN::CLEAR
        } else {
            VIPP_EN::OSD_OV_EN::SET
        };
        let cv = if layout.covers.is_empty() {
            VIPP_EN::OSD_CV_EN::CLEAR
        } else {
            VIPP_EN::OSD_CV_EN::SET
        };
        self.regs.modify(off::EN, ov + cv);
        debug!(vipp = self.id, overlays = layout.windows.len(), bands = layout.bands, "osd updated");
        *slot = Some((layout, bufs));
        Ok(())
    }

    pub fn overlay(&self) -> Option<OsdLayout> {
        self.osd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(l, _)| l.clone())
    }

    /// Reset stop.
    pub fn halt(&self) {
        self.regs.modify(off::EN, VIPP_EN::EN::CLEAR);
    }

    /// Reset restart.
    pub fn resume(&self) {
        if let Some(cfg) = *self.cfg.lock() {
            self.program(&cfg);
        }
        self.regs.modify(off::EN, VIPP_EN::EN::SET);
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.is_set(off::EN, VIPP_EN::EN)
    }
}

impl Subdev for Vipp {
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
        let cfg = (*self.cfg.lock()).ok_or(VinError::InvalidState("scaler not configured"))?;
        self.program(&cfg);
        self.regs.modify(off::EN, VIPP_EN::EN::SET);
        info!(vipp = self.id, w = cfg.output.0, h = cfg.output.1, "scaler enabled");
        Ok(())
    }

    fn hw_disable(&self) {
        self.regs.write(off::EN, 0);
        self.osd.lock().unwrap_or_else(|e| e.into_inner()).take();
        info!(vipp = self.id, "scaler disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockRegisters;
    use crate::mem::SimAllocator;

    const BASE: u32 = 0x3_0000;

    fn vipp() -> (Arc<MockRegisters>, Vipp) {
        let plat = PlatformDesc::lookup("sun8iw21").unwrap();
        let mock = Arc::new(MockRegisters::new());
        let v = Vipp::new(
            0,
            RegBlock::new(mock.clone(), BASE, "vipp0"),
            plat,
            SimAllocator::new(0x5000_0000, 16 << 20),
        );
        (mock, v)
    }

    #[test]
    fn crop_is_normalised_and_bounded() {
        let (_m, v) = vipp();
        let r = v
            .adjust_crop(
                (1920, 1080),
                Rect {
                    left: 13,
                    top: 7,
                    width: 1000,
                    height: 501,
                },
            )
            .unwrap();
        assert_eq!(r, Rect { left: 12, top: 6, width: 992, height: 500 });
        assert!(v.adjust_crop((640, 480), Rect { left: 0, top: 0, width: 656, height: 480 }).is_err());
        assert!(v.adjust_crop((640, 480), Rect { left: 0, top: 0, width: 8, height: 480 }).is_err());
    }

    #[test]
    fn downscale_only_within_ratio() {
        let (_m, v) = vipp();
        let nv12 = PixelFormat::Nv12;
        assert!(v.configure((1920, 1080), None, (2560, 1080), nv12).is_err());
        assert!(v.configure((1920, 1080), None, (112, 1080), nv12).is_err());
        assert!(v.configure((1920, 1080), None, (120, 68), nv12).is_ok());
    }

    #[test]
    fn enable_programs_ratio_and_format() {
        let (m, v) = vipp();
        v.configure((1920, 1080), None, (960, 540), PixelFormat::Nv16).unwrap();
        v.hw_enable().unwrap();
        assert_eq!(m.peek(BASE + off::SC_CFG), 0x80 | (0x80 << 16));
        assert!(v.regs().is_set(off::MODE, MODE::SCALER_EN));
        assert_eq!(v.regs().read_field(off::MODE, MODE::OUT_FMT), 1);
        assert!(v.is_enabled());
        v.hw_disable();
        assert!(!v.is_enabled());
    }

    #[test]
    fn overlay_programs_counts_and_buffers() {
        let (m, v) = vipp();
        assert!(v.set_overlay(&[], &[]).is_err());
        v.configure((1280, 720), None, (1280, 720), PixelFormat::Nv12).unwrap();
        let o = Overlay {
            x: 16,
            y: 16,
            width: 8,
            height: 4,
            alpha: 0x80,
            bitmap: bytes::Bytes::from(vec![0x7f; 8 * 4 * osd::OSD_BPP]),
        };
        v.set_overlay(&[o], &[]).unwrap();
        assert_eq!(v.regs().read_field(off::OSD_CFG, OSD_CFG::OV_NUM), 1);
        assert!(v.regs().is_set(off::EN, VIPP_EN::OSD_OV_EN));
        assert!(!v.regs().is_set(off::EN, VIPP_EN::OSD_CV_EN));
        assert_ne!(m.peek(BASE + off::OSD_BM_ADDR), 0);
        v.set_overlay(&[], &[]).unwrap();
        assert!(!v.regs().is_set(off::EN, VIPP_EN::OSD_OV_EN));
        assert!(v.overlay().is_none());
    }

    #[test]
    fn ratio_is_8_8_fixed_point() {
        assert_eq!(scale_ratio(1920, 1920), 0x100);
        assert_eq!(scale_ratio(1920, 120), 0x10);
    }
}
