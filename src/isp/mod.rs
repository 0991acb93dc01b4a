//! ISP pipeline engine.
//!
//! Owns the double-buffered parameter load region, the save/statistics
//! regions, the 3D-NR and WDR ping-pong buffers and the per-channel output
//! geometry. The interrupt handler runs the frame-boundary protocol; faults
//! are handed to the reset coordinator through the fault sink.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::format::FrameFormat;
use crate::error::{HwFault, Result, VinError};
use crate::hw::regs::isp::{self as regs_isp, off, FE_CFG, FE_CTRL, OB_START};
use crate::hw::{pack_size, RegBlock};
use crate::mem::{self, DmaAllocator, DmaBuffer, PhysAddr};
use crate::pipeline::reset::FaultSink;
use crate::pipeline::ringbuf::FaultSource;
use crate::pipeline::{SharedGate, Subdev};
use crate::platform::PlatformDesc;
use crate::sensor::WdrMode;
use crate::utils::align_up;

pub mod lbc;
pub mod load;
pub mod pingpong;
pub mod split;

use lbc::{CompressionMode, LbcRegs};
use load::LoadRegion;
use pingpong::PingPong;
use split::SplitGeometry;

/// Offsets of tunables inside the parameter load region.
pub mod params {
    pub const MODULE_EN: usize = 0x000;
    pub const AWB_GAIN_R: usize = 0x010;
    pub const AWB_GAIN_G: usize = 0x014;
    pub const AWB_GAIN_B: usize = 0x018;
    pub const D3D_STRENGTH: usize = 0x120;
    pub const SHARPNESS: usize = 0x140;
}

/// Power-on parameter image.
const DEFAULT_PARAMS: &[(usize, u32)] = &[
    (params::MODULE_EN, 0x0000_0fff),
    (params::AWB_GAIN_R, 0x100),
    (params::AWB_GAIN_G, 0x100),
    (params::AWB_GAIN_B, 0x100),
    (params::D3D_STRENGTH, 64),
    (params::SHARPNESS, 32),
];

fn default_image(size: usize) -> Vec<u8> {
    let mut img = vec![0u8; size];
    for &(off, val) in DEFAULT_PARAMS {
        if off + 4 <= size {
            img[off..off + 4].copy_from_slice(&val.to_le_bytes());
        }
    }
    img
}

/// Processing mode negotiated with the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IspMode {
    pub wdr: WdrMode,
    /// 3D-NR reference compression, `None` when 3D-NR is off.
    pub d3d: Option<CompressionMode>,
    /// Bits per raw sample at the ISP input.
    pub bit_depth: u32,
}

impl Default for IspMode {
    fn default() -> Self {
        Self {
            wdr: WdrMode::Linear,
            d3d: None,
            bit_depth: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFormat {
    pub width: u32,
    pub height: u32,
    pub sizeimage: u32,
}

/// Geometry and mode read by the frame handler.
#[derive(Debug, Clone, Default)]
pub struct IspLayout {
    pub mode: IspMode,
    pub split: Option<SplitGeometry>,
    pub channels: Vec<Option<ChannelFormat>>,
}

/// DMA regions that live from the first `init(true)` to the last
/// `init(false)`.
pub struct IspRegions {
    pub load: LoadRegion,
    pub save: DmaBuffer,
    pub stats: [DmaBuffer; 2],
}

/// Statistics of one completed frame.
#[derive(Debug, Clone)]
pub struct IspStats {
    pub frame: u64,
    pub data: Bytes,
}

struct IrqState {
    streaming: bool,
    frame_cnt: u64,
    split_right: bool,
    stats_bank: usize,
    d3d: Option<PingPong>,
    wdr: Option<PingPong>,
}

#[derive(Default)]
struct Parked {
    d3d: Option<PingPong>,
    wdr: Option<PingPong>,
}

const NO_STATS: usize = usize::MAX;

pub struct Isp {
    id: usize,
    name: String,
    regs: RegBlock,
    plat: &'static PlatformDesc,
    alloc: Arc<dyn DmaAllocator>,
    power_gate: SharedGate,
    stream_gate: SharedGate,
    init_count: Mutex<usize>,
    regions: ArcSwapOption<IspRegions>,
    layout: ArcSwap<IspLayout>,
    cfg_lock: Mutex<()>,
    irq: spin::Mutex<IrqState>,
    parked: Mutex<Parked>,
    defer_free: AtomicBool,
    latest_stats: AtomicUsize,
    stats_frame: AtomicU64,
    fault_sink: OnceCell<FaultSink>,
}

impl Isp {
    pub fn new(
        id: usize,
        regs: RegBlock,
        plat: &'static PlatformDesc,
        alloc: Arc<dyn DmaAllocator>,
    ) -> Self {
        Self {
            id,
            name: format!("isp{id}"),
            regs,
            plat,
            alloc,
            power_gate: SharedGate::new("power"),
            stream_gate: SharedGate::new("stream"),
            init_count: Mutex::new(0),
            regions: ArcSwapOption::empty(),
            layout: ArcSwap::from_pointee(IspLayout {
                channels: vec![None; plat.isp_channels],
                ..Default::default()
            }),
            cfg_lock: Mutex::new(()),
            irq: spin::Mutex::new(IrqState {
                streaming: false,
                frame_cnt: 0,
                split_right: false,
                stats_bank: 0,
                d3d: None,
                wdr: None,
            }),
            parked: Mutex::new(Parked::default()),
            defer_free: AtomicBool::new(false),
            latest_stats: AtomicUsize::new(NO_STATS),
            stats_frame: AtomicU64::new(0),
            fault_sink: OnceCell::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn regs(&self) -> &RegBlock {
        &self.regs
    }

    pub fn set_fault_sink(&self, sink: FaultSink) {
        if self.fault_sink.set(sink).is_err() {
            warn!(isp = self.id, "fault sink already installed");
        }
    }

    /// Keep ping-pong buffers parked on stream-off for reuse.
    pub fn set_defer_free(&self, defer: bool) {
        self.defer_free.store(defer, Ordering::Relaxed);
    }

    fn dma_addr(&self, phys: PhysAddr) -> u32 {
        (phys >> self.plat.dma_addr_shift) as u32
    }

    /// Reference-counted bring-up. The first call allocates and programs the
    /// load/save/statistics regions; the last `init(false)` frees them.
    #[instrument(skip(self), fields(isp = self.id))]
    pub fn init(&self, enable: bool) -> Result<()> {
        let mut n = self.init_count.lock().unwrap_or_else(|e| e.into_inner());
        if !enable {
            if *n == 0 {
                return Err(VinError::InvalidState("unbalanced isp init(false)"));
            }
            *n -= 1;
            if *n == 0 {
                self.regs.write(off::LOAD_ADDR, 0);
                self.regs.write(off::SAVE_ADDR, 0);
                self.regs.write(off::STAT_ADDR, 0);
                self.regions.store(None);
                self.latest_stats.store(NO_STATS, Ordering::Release);
                let parked = std::mem::take(&mut *self.parked.lock().unwrap_or_else(|e| e.into_inner()));
                drop(parked);
                info!("ISP regions released");
            }
            return Ok(());
        }
        if *n == 0 {
            let load = LoadRegion::new(
                &self.alloc,
                self.plat.isp_load_size,
                &default_image(self.plat.isp_load_size),
                &self.name,
            )?;
            let save = mem::alloc(&self.alloc, self.plat.isp_save_size, &format!("{}-save", self.name))?;
            let stats = [
                mem::alloc(&self.alloc, self.plat.isp_stat_size, &format!("{}-stat0", self.name))?,
                mem::alloc(&self.alloc, self.plat.isp_stat_size, &format!("{}-stat1", self.name))?,
            ];
            self.regs.write(off::LOAD_ADDR, self.dma_addr(load.bank_phys(load.active())));
            self.regs.write(off::SAVE_ADDR, self.dma_addr(save.phys()));
            self.regs.write(off::STAT_ADDR, self.dma_addr(stats[0].phys()));
            self.regions.store(Some(Arc::new(IspRegions { load, save, stats })));
            info!("ISP regions allocated");
        }
        *n += 1;
        Ok(())
    }

    pub fn init_count(&self) -> usize {
        *self.init_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn regions(&self) -> Option<Arc<IspRegions>> {
        self.regions.load_full()
    }

    pub fn layout(&self) -> Arc<IspLayout> {
        self.layout.load_full()
    }

    pub fn set_mode(&self, mode: IspMode) -> Result<()> {
        let _g = self.cfg_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cur = self.layout.load_full();
        if cur.mode == mode {
            return Ok(());
        }
        if self.stream_gate.is_held() {
            return Err(VinError::Busy(self.name.clone()));
        }
        let mut next = (*cur).clone();
        next.mode = mode;
        self.layout.store(Arc::new(next));
        debug!(isp = self.id, ?mode, "isp mode set");
        Ok(())
    }

    /// Program the output geometry of `channel` and return the buffer size a
    /// frame of `fmt` needs.
    #[instrument(skip(self, fmt), fields(isp = self.id, w = fmt.width, h = fmt.height))]
    pub fn set_format(&self, channel: usize, fmt: &FrameFormat) -> Result<u32> {
        if channel >= self.plat.isp_channels {
            return Err(VinError::InvalidArgument("isp channel out of range"));
        }
        let aligned = FrameFormat::new(fmt.width, fmt.height, fmt.pixel_format, fmt.mbus_code, self.plat);
        let (w, h) = (aligned.width, aligned.height);
        let cf = ChannelFormat {
            width: w,
            height: h,
            sizeimage: aligned.sizeimage,
        };

        let _g = self.cfg_lock.lock().unwrap_or_else(|e| e.into_inner());
        let cur = self.layout.load_full();
        if cur.channels[channel] == Some(cf) && self.stream_gate.is_held() {
            return Ok(cf.sizeimage);
        }
        let mut next = (*cur).clone();
        if channel > 0 {
            let main = cur.channels[0].ok_or(VinError::InvalidState("main channel format not set"))?;
            if w > main.width || h > main.height {
                return Err(VinError::SubChannelTooLarge {
                    sub_w: w,
                    sub_h: h,
                    main_w: main.width,
                    main_h: main.height,
                });
            }
        } else {
            let split = split::geometry(self.plat, w, h);
            if let Some(s) = split {
                if s.pass_width() > self.plat.isp_max_width {
                    return Err(VinError::SizeOutOfRange {
                        width: w,
                        height: h,
                        min_w: self.plat.min_width,
                        min_h: self.plat.min_height,
                        max_w: self.plat.isp_max_width * 2 - s.overlap * 2,
                        max_h: self.plat.max_height,
                    });
                }
            }
            if self.stream_gate.is_held() && cur.channels[0] != Some(cf) {
                return Err(VinError::Busy(self.name.clone()));
            }
            next.split = split;
            // Sub channels larger than the new main channel are dropped.
            for sub in next.channels.iter_mut().skip(1) {
                if sub.is_some_and(|s| s.width > w || s.height > h) {
                    *sub = None;
                }
            }
            let pass_w = split.map_or(w, |s| s.pass_width());
            self.regs.write(off::IN_SIZE, pack_size(w, h));
            self.regs.write(off::OB_SIZE, pack_size(w, h));
            self.regs.write(off::OB_VALID, pack_size(pass_w, h));
            self.regs.write(off::OB_START, 0);
            let split_en = if split.is_some() {
                FE_CFG::SPLIT_EN::SET
            } else {
                FE_CFG::SPLIT_EN::CLEAR
            };
            self.regs.modify(off::FE_CFG, split_en);
            if let Some(s) = split {
                info!(overlap = s.overlap, pass_w, "large image split enabled");
            }
        }
        self.regs.write(off::ch_size(channel), pack_size(w, h));
        next.channels[channel] = Some(cf);
        self.layout.store(Arc::new(next));
        Ok(cf.sizeimage)
    }

    fn d3d_size(&self, mode: CompressionMode, main: ChannelFormat, bit_depth: u32) -> usize {
        let stride = align_up(main.width, self.plat.width_align);
        lbc::line_geometry(mode, stride, bit_depth).frame_bytes(main.height) as usize
    }

    fn write_roles(&self, st: &IrqState) {
        if let Some(pp) = &st.d3d {
            for role in 0..pp.count() {
                self.regs.write(off::d3d_addr(role), self.dma_addr(pp.role_addr(role)));
            }
        }
        if let Some(pp) = &st.wdr {
            for role in 0..pp.count() {
                self.regs.write(off::wdr_addr(role), self.dma_addr(pp.role_addr(role)));
            }
        }
    }

    /// Allocate what the negotiated mode needs and start the front end.
    #[instrument(skip(self), fields(isp = self.id))]
    pub fn start_stream(&self) -> Result<()> {
        let regions = self
            .regions
            .load_full()
            .ok_or(VinError::InvalidState("isp not initialised"))?;
        let layout = self.layout.load_full();
        let main = layout.channels[0].ok_or(VinError::InvalidState("isp format not set"))?;
        let mode = layout.mode;

        let parked = std::mem::take(&mut *self.parked.lock().unwrap_or_else(|e| e.into_inner()));
        let d3d = match mode.d3d {
            Some(cmp) => {
                let (n, size) = (self.plat.d3d_buffers, self.d3d_size(cmp, main, mode.bit_depth));
                Some(match parked.d3d {
                    Some(pp) if pp.matches(n, size) => pp,
                    _ => PingPong::alloc(&self.alloc, n, size, &format!("{}-d3d", self.name))?,
                })
            }
            None => None,
        };
        let wdr = if mode.wdr.needs_buffers() {
            let (n, size) = (self.plat.wdr_buffers, (main.width * main.height * 2) as usize);
            Some(match parked.wdr {
                Some(pp) if pp.matches(n, size) => pp,
                _ => PingPong::alloc(&self.alloc, n, size, &format!("{}-wdr", self.name))?,
            })
        } else {
            None
        };

        let mut cfg = FE_CFG::EN::SET;
        if let Some(cmp) = mode.d3d {
            LbcRegs::derive(cmp, mode.bit_depth, self.plat.lbc_bw_limit_bits, self.plat.lbc_sat_bits)
                .write(&self.regs, off::D3D_LBC);
            cfg = cfg + FE_CFG::D3D_EN::SET + FE_CFG::LBC_EN::SET;
        }
        match mode.wdr {
            WdrMode::Linear => cfg = cfg + FE_CFG::WDR_MODE::Linear,
            WdrMode::TwoFrame => {
                LbcRegs::derive(
                    CompressionMode::Lossless,
                    mode.bit_depth,
                    self.plat.lbc_bw_limit_bits,
                    self.plat.lbc_sat_bits,
                )
                .write(&self.regs, off::WDR_LBC);
                cfg = cfg + FE_CFG::WDR_EN::SET + FE_CFG::WDR_MODE::TwoFrame;
            }
            WdrMode::Dol => cfg = cfg + FE_CFG::WDR_EN::SET + FE_CFG::WDR_MODE::Dol,
        }
        if layout.split.is_some() {
            cfg = cfg + FE_CFG::SPLIT_EN::SET;
        }

        let mut st = self.irq.lock();
        st.d3d = d3d;
        st.wdr = wdr;
        st.frame_cnt = 0;
        st.split_right = false;
        st.stats_bank = 0;
        self.write_roles(&st);
        self.regs.write(off::LOAD_ADDR, self.dma_addr(regions.load.bank_phys(regions.load.active())));
        self.regs.write(off::STAT_ADDR, self.dma_addr(regions.stats[0].phys()));
        self.regs.write(off::INT_STA, regs_isp::INT_ALL);
        self.regs.write(off::INT_EN, regs_isp::INT_ALL);
        self.regs.write_fields(off::FE_CFG, cfg);
        self.regs
            .write_fields(off::FE_CTRL, FE_CTRL::CAP_EN::SET + FE_CTRL::PARA_READY::SET);
        st.streaming = true;
        info!(
            d3d = st.d3d.as_ref().map_or(0, PingPong::count),
            wdr = st.wdr.as_ref().map_or(0, PingPong::count),
            "ISP streaming"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(isp = self.id))]
    pub fn stop_stream(&self, defer_free: bool) {
        let (d3d, wdr) = {
            let mut st = self.irq.lock();
            self.regs.write(off::FE_CTRL, 0);
            self.regs.write(off::INT_EN, 0);
            self.regs.modify(off::FE_CFG, FE_CFG::EN::CLEAR);
            st.streaming = false;
            (st.d3d.take(), st.wdr.take())
        };
        if defer_free && (d3d.is_some() || wdr.is_some()) {
            debug!("ping-pong buffers parked");
            *self.parked.lock().unwrap_or_else(|e| e.into_inner()) = Parked { d3d, wdr };
        }
        info!("ISP stopped");
    }

    /// Reset stop: freeze the front end, keep every buffer.
    pub fn halt(&self) {
        let _st = self.irq.lock();
        self.regs.write(off::FE_CTRL, 0);
        self.regs.modify(off::FE_CFG, FE_CFG::EN::CLEAR);
    }

    /// Reset restart: re-arm addresses from scratch and start counting frames
    /// from zero.
    pub fn restart(&self) -> Result<()> {
        let regions = self
            .regions
            .load_full()
            .ok_or(VinError::InvalidState("isp not initialised"))?;
        let mut st = self.irq.lock();
        if !st.streaming {
            return Err(VinError::InvalidState("isp not streaming"));
        }
        if let Some(pp) = st.d3d.as_mut() {
            pp.reset_rotation();
        }
        if let Some(pp) = st.wdr.as_mut() {
            pp.reset_rotation();
        }
        st.frame_cnt = 0;
        st.split_right = false;
        self.write_roles(&st);
        self.regs.write(off::LOAD_ADDR, self.dma_addr(regions.load.bank_phys(regions.load.active())));
        self.regs.write(off::OB_START, 0);
        self.regs.write(off::INT_STA, regs_isp::INT_ALL);
        self.regs.modify(off::FE_CFG, FE_CFG::EN::SET);
        self.regs
            .write_fields(off::FE_CTRL, FE_CTRL::CAP_EN::SET + FE_CTRL::PARA_READY::SET);
        Ok(())
    }

    /// Frame-boundary protocol, run on "parameters loaded".
    ///
    /// `PARA_READY` is cleared first and set last: the hardware must never
    /// pick up a half-written bank.
    fn frame_boundary(&self, st: &mut IrqState) {
        self.regs.modify(off::FE_CTRL, FE_CTRL::PARA_READY::CLEAR);
        let regions = self.regions.load();
        let Some(regions) = regions.as_deref() else {
            return;
        };
        let target = regions.load.prepare_next();

        let layout = self.layout.load();
        if let Some(s) = layout.split {
            st.split_right = !st.split_right;
            self.regs.write_fields(
                off::OB_START,
                OB_START::HOR.val(s.ob_start(st.split_right)) + OB_START::VER.val(0),
            );
        }
        if let Some(pp) = st.d3d.as_mut() {
            pp.rotate();
        }
        if let Some(pp) = st.wdr.as_mut() {
            pp.rotate();
        }
        self.write_roles(st);

        self.regs.write(off::LOAD_ADDR, self.dma_addr(regions.load.bank_phys(target)));
        regions.load.commit(target);
        self.regs.modify(off::FE_CTRL, FE_CTRL::PARA_READY::SET);
    }

    fn frame_finished(&self, st: &mut IrqState) {
        st.frame_cnt += 1;
        let regions = self.regions.load();
        let Some(regions) = regions.as_deref() else {
            return;
        };
        let done = st.stats_bank;
        st.stats_bank ^= 1;
        self.regs.write(off::STAT_ADDR, self.dma_addr(regions.stats[st.stats_bank].phys()));
        self.stats_frame.store(st.frame_cnt, Ordering::Relaxed);
        self.latest_stats.store(done, Ordering::Release);
    }

    fn classify(sta: u32) -> Option<HwFault> {
        const ORDER: [(u32, HwFault); 7] = [
            (regs_isp::INT_DDR_RW_ERROR, HwFault::DdrConflict),
            (regs_isp::INT_LBC_ERROR, HwFault::LbcDecode),
            (regs_isp::INT_FRAME_LOST, HwFault::FrameLost),
            (regs_isp::INT_FRAME_ERROR, HwFault::FrameLost),
            (regs_isp::INT_SRC0_FIFO_OF, HwFault::FifoOverflow),
            (regs_isp::INT_CFG_MISMATCH, HwFault::ConfigMismatch),
            (regs_isp::INT_HB_SHORT, HwFault::HblankShort),
        ];
        ORDER.iter().find(|(bit, _)| sta & bit != 0).map(|&(_, f)| f)
    }

    /// Interrupt entry point.
    pub fn irq(&self) {
        let sta = self.regs.read(off::INT_STA);
        if sta == 0 {
            return;
        }
        self.regs.write(off::INT_STA, sta);
        let (fault, frame) = {
            let mut st = self.irq.lock();
            if !st.streaming {
                return;
            }
            if sta & regs_isp::INT_PARA_LOAD != 0 {
                self.frame_boundary(&mut st);
            }
            if sta & regs_isp::INT_FINISH != 0 {
                self.frame_finished(&mut st);
            }
            (Self::classify(sta & regs_isp::INT_FAULTS), st.frame_cnt)
        };
        // The guard is gone: the sink may reset this very ISP.
        if let Some(fault) = fault {
            if fault.needs_reset() {
                error!(isp = self.id, frame, %fault, status = sta, "ISP fault");
            } else {
                warn!(isp = self.id, frame, %fault, "ISP warning");
            }
            if let Some(sink) = self.fault_sink.get() {
                sink(FaultSource::Isp(self.id), fault);
            }
        }
    }

    /// Control-plane parameter write through the shadow.
    pub fn write_params(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let regions = self
            .regions
            .load_full()
            .ok_or(VinError::InvalidState("isp not initialised"))?;
        regions.load.write_shadow(offset, bytes)
    }

    pub fn read_param(&self, offset: usize) -> Option<u32> {
        let regions = self.regions.load_full()?;
        let mut b = [0u8; 4];
        (regions.load.read_shadow(offset, &mut b) == 4).then(|| u32::from_le_bytes(b))
    }

    /// Copy of the statistics of the most recent completed frame.
    pub fn latest_stats(&self) -> Option<IspStats> {
        let bank = self.latest_stats.load(Ordering::Acquire);
        if bank == NO_STATS {
            return None;
        }
        let regions = self.regions.load_full()?;
        let data = regions.stats[bank].with_cpu(|m| Bytes::copy_from_slice(m));
        Some(IspStats {
            frame: self.stats_frame.load(Ordering::Relaxed),
            data,
        })
    }

    pub fn frame_cnt(&self) -> u64 {
        self.irq.lock().frame_cnt
    }

    pub fn is_streaming(&self) -> bool {
        self.irq.lock().streaming
    }

    /// (3D-NR, WDR) ping-pong buffer counts currently held.
    pub fn pingpong_counts(&self) -> (usize, usize) {
        let st = self.irq.lock();
        (
            st.d3d.as_ref().map_or(0, PingPong::count),
            st.wdr.as_ref().map_or(0, PingPong::count),
        )
    }

    /// Physical address of the 3D-NR buffer currently in `role`.
    pub fn d3d_role_addr(&self, role: usize) -> Option<PhysAddr> {
        self.irq.lock().d3d.as_ref().map(|pp| pp.role_addr(role))
    }

    pub fn has_parked_buffers(&self) -> bool {
        let p = self.parked.lock().unwrap_or_else(|e| e.into_inner());
        p.d3d.is_some() || p.wdr.is_some()
    }
}

impl Subdev for Isp {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_gate(&self) -> &SharedGate {
        &self.power_gate
    }

    fn stream_gate(&self) -> &SharedGate {
        &self.stream_gate
    }

    fn power_on(&self) -> Result<()> {
        self.init(true)
    }

    fn power_off(&self) {
        if let Err(e) = self.init(false) {
            warn!(isp = self.id, "power off: {e}");
        }
    }

    fn hw_enable(&self) -> Result<()> {
        self.start_stream()
    }

    fn hw_disable(&self) {
        self.stop_stream(self.defer_free.load(Ordering::Relaxed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::format::{MbusCode, PixelFormat};
    use crate::hw::mock::MockRegisters;
    use crate::mem::SimAllocator;

    const BASE: u32 = 0x2_0000;

    fn setup(plat: &str) -> (Arc<MockRegisters>, Arc<SimAllocator>, Isp) {
        let plat = PlatformDesc::lookup(plat).unwrap();
        let mock = Arc::new(MockRegisters::new());
        mock.mark_w1c(BASE + off::INT_STA);
        let alloc = SimAllocator::new(0x4000_0000, 256 << 20);
        let isp = Isp::new(0, RegBlock::new(mock.clone(), BASE, "isp0"), plat, alloc.clone());
        (mock, alloc, isp)
    }

    fn fmt(w: u32, h: u32) -> FrameFormat {
        let plat = PlatformDesc::lookup("sun55iw3").unwrap();
        FrameFormat::new(w, h, PixelFormat::Nv12, MbusCode::Sbggr10_1x10, plat)
    }

    #[test]
    fn init_is_reference_counted() {
        let (_mock, alloc, isp) = setup("sun8iw21");
        isp.init(true).unwrap();
        let live = alloc.live_allocations();
        assert_eq!(live, 5);
        isp.init(true).unwrap();
        assert_eq!(alloc.live_allocations(), live);
        isp.init(false).unwrap();
        assert!(isp.regions().is_some());
        isp.init(false).unwrap();
        assert!(isp.regions().is_none());
        assert_eq!(alloc.live_allocations(), 0);
        assert!(matches!(isp.init(false), Err(VinError::InvalidState(_))));
    }

    #[test]
    fn default_image_is_loaded() {
        let (_mock, _alloc, isp) = setup("sun8iw21");
        isp.init(true).unwrap();
        assert_eq!(isp.read_param(params::AWB_GAIN_G), Some(0x100));
        isp.write_params(params::D3D_STRENGTH, &80u32.to_le_bytes()).unwrap();
        assert_eq!(isp.read_param(params::D3D_STRENGTH), Some(80));
    }

    #[test]
    fn sub_channel_must_fit_main() {
        let (_mock, _alloc, isp) = setup("sun8iw21");
        assert!(matches!(isp.set_format(1, &fmt(640, 480)), Err(VinError::InvalidState(_))));
        let size = isp.set_format(0, &fmt(1920, 1080)).unwrap();
        assert_eq!(size, 1920 * 1080 * 3 / 2);
        assert!(matches!(
            isp.set_format(1, &fmt(2560, 1440)),
            Err(VinError::SubChannelTooLarge { .. })
        ));
        isp.set_format(1, &fmt(640, 480)).unwrap();
        assert!(isp.set_format(9, &fmt(640, 480)).is_err());
    }

    #[test]
    fn wide_frames_enter_split_mode() {
        let (mock, _alloc, isp) = setup("sun55iw3");
        isp.set_format(0, &fmt(7680, 4320)).unwrap();
        let split = isp.layout().split.unwrap();
        assert_eq!(mock.peek(BASE + off::OB_VALID) & 0xffff, split.pass_width());
        assert!(isp.regs().is_set(off::FE_CFG, FE_CFG::SPLIT_EN));
        isp.set_format(0, &fmt(1920, 1080)).unwrap();
        assert!(isp.layout().split.is_none());
        assert!(!isp.regs().is_set(off::FE_CFG, FE_CFG::SPLIT_EN));
    }

    #[test]
    fn pingpong_allocated_only_when_needed() {
        let (_mock, alloc, isp) = setup("sun8iw21");
        isp.init(true).unwrap();
        isp.set_format(0, &fmt(1920, 1080)).unwrap();
        isp.start_stream().unwrap();
        assert_eq!(isp.pingpong_counts(), (0, 0));
        isp.stop_stream(false);

        isp.set_mode(IspMode {
            wdr: WdrMode::TwoFrame,
            d3d: Some(CompressionMode::Ratio2x),
            bit_depth: 10,
        })
        .unwrap();
        let before = alloc.live_allocations();
        isp.start_stream().unwrap();
        assert_eq!(isp.pingpong_counts(), (2, 2));
        assert_eq!(alloc.live_allocations(), before + 4);
        isp.stop_stream(false);
        assert_eq!(alloc.live_allocations(), before);
    }

    #[test]
    fn failed_pingpong_allocation_releases_all() {
        let (_mock, alloc, isp) = setup("sun8iw21");
        isp.init(true).unwrap();
        isp.set_format(0, &fmt(1920, 1080)).unwrap();
        isp.set_mode(IspMode {
            wdr: WdrMode::TwoFrame,
            d3d: Some(CompressionMode::Ratio2x),
            bit_depth: 10,
        })
        .unwrap();
        let before = alloc.live_allocations();
        alloc.fail_after(3);
        assert!(matches!(isp.start_stream(), Err(VinError::NoMemory { .. })));
        assert_eq!(alloc.live_allocations(), before);
        assert!(!isp.is_streaming());
    }

    #[test]
    fn parked_buffers_are_reused() {
        let (_mock, alloc, isp) = setup("sun8iw21");
        isp.init(true).unwrap();
        isp.set_format(0, &fmt(1920, 1080)).unwrap();
        isp.set_mode(IspMode {
            d3d: Some(CompressionMode::Ratio2x),
            ..IspMode::default()
        })
        .unwrap();
        isp.start_stream().unwrap();
        let addr = isp.d3d_role_addr(0).unwrap();
        isp.stop_stream(true);
        assert!(isp.has_parked_buffers());
        let live = alloc.live_allocations();
        isp.start_stream().unwrap();
        assert_eq!(alloc.live_allocations(), live);
        assert_eq!(isp.d3d_role_addr(0), Some(addr));
        isp.stop_stream(true);
        isp.init(false).unwrap();
        assert_eq!(alloc.live_allocations(), 0);
    }

    #[test]
    fn para_load_flips_banks_and_sets_ready_last() {
        let (mock, _alloc, isp) = setup("sun8iw21");
        isp.init(true).unwrap();
        isp.set_format(0, &fmt(1920, 1080)).unwrap();
        isp.set_mode(IspMode {
            d3d: Some(CompressionMode::Ratio2x),
            ..IspMode::default()
        })
        .unwrap();
        isp.start_stream().unwrap();
        let regions = isp.regions().unwrap();
        let mut last_active = regions.load.active();
        for _ in 0..6 {
            mock.clear_log();
            let role0 = isp.d3d_role_addr(0).unwrap();
            mock.raise(BASE + off::INT_STA, regs_isp::INT_PARA_LOAD);
            isp.irq();
            let active = regions.load.active();
            assert_ne!(active, last_active);
            last_active = active;
            assert_eq!(
                mock.peek(BASE + off::LOAD_ADDR),
                (regions.load.bank_phys(active) >> 2) as u32
            );
            assert_ne!(isp.d3d_role_addr(0).unwrap(), role0);
            let writes = mock.writes();
            let (addr, val) = *writes.last().unwrap();
            assert_eq!(addr, BASE + off::FE_CTRL);
            assert_ne!(val & 0b10, 0);
        }
    }

    #[test]
    fn finish_publishes_stats() {
        let (mock, _alloc, isp) = setup("sun8iw21");
        isp.init(true).unwrap();
        isp.set_format(0, &fmt(1280, 720)).unwrap();
        isp.start_stream().unwrap();
        assert!(isp.latest_stats().is_none());
        let regions = isp.regions().unwrap();
        regions.stats[0].write_at(0, &[7, 7]);
        mock.raise(BASE + off::INT_STA, regs_isp::INT_FINISH);
        isp.irq();
        let s = isp.latest_stats().unwrap();
        assert_eq!(s.frame, 1);
        assert_eq!(&s.data[..2], &[7, 7]);
        assert_eq!(isp.frame_cnt(), 1);
    }

    #[test]
    fn faults_reach_the_sink_after_unlock() {
        let (mock, _alloc, isp) = setup("sun8iw21");
        let isp = Arc::new(isp);
        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        let (s, weak) = (seen.clone(), Arc::downgrade(&isp));
        isp.set_fault_sink(Arc::new(move |src, fault| {
            // Taking the ISP lock here would deadlock if it were still held.
            let cnt = weak.upgrade().map(|i| i.frame_cnt());
            s.lock().push((src, fault, cnt));
        }));
        isp.init(true).unwrap();
        isp.set_format(0, &fmt(1280, 720)).unwrap();
        isp.start_stream().unwrap();
        mock.raise(BASE + off::INT_STA, regs_isp::INT_FRAME_LOST | regs_isp::INT_HB_SHORT);
        isp.irq();
        assert_eq!(
            *seen.lock(),
            vec![(FaultSource::Isp(0), HwFault::FrameLost, Some(0))]
        );
        assert_eq!(mock.peek(BASE + off::INT_STA), 0);
    }
}
