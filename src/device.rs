//! Control-plane surface of one video capture node.
//!
//! Every verb validates its arguments before anything reaches the hardware.
//! The node moves `Closed → Open → Streaming → Open → Closed`; low-power mode
//! is a flag on an open, idle node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::capture::format::{self, FormatDesc, FrameFormat, PixelFormat, ALL_FORMATS};
use crate::capture::frame::{BufferState, DoneFrame, VideoBuffer};
use crate::capture::queue::{queue_setup, CaptureMode};
use crate::csi::SignalStatus;
use crate::error::{Result, VinError};
use crate::isp::{params, IspStats};
use crate::mem::{self, ExportHandle, PhysAddr};
use crate::pipeline::{
    EventKind, FaultRecord, MediaGraph, Pipeline, StatsSnapshot, StreamRequest, VinEvent,
};
use crate::sensor::{self, ExposureGain, FlashMode, TestPattern, WdrMode};
use crate::vipp::dma::MAX_BUFFERS;
use crate::vipp::{Cover, Overlay, Rect};

/// Control ids.
pub mod cid {
    pub const EXPOSURE: u32 = 0x0098_0911;
    pub const GAIN: u32 = 0x0098_0913;
    pub const FOCUS_ABSOLUTE: u32 = 0x009a_090a;
    pub const FLASH_LED_MODE: u32 = 0x009c_0901;
    pub const FLASH_STROBE: u32 = 0x009c_0903;
    pub const TEST_PATTERN: u32 = 0x009f_0903;
    /// Driver-private range.
    pub const D3D_STRENGTH: u32 = 0x0098_1901;
    pub const WDR_MODE: u32 = 0x0098_1902;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: &'static str,
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub default: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Closed,
    Open,
    Streaming,
}

/// Answer to `query_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: usize,
    pub length: usize,
    pub phys: PhysAddr,
    pub state: BufferState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub state: NodeState,
    pub low_power: bool,
    pub format: FrameFormat,
    pub buffers: usize,
    pub sequence: u64,
    pub stats: StatsSnapshot,
    pub isp_frame_cnt: u64,
    pub resets: u64,
    pub signal: SignalStatus,
}

struct DeviceState {
    node: NodeState,
    format: FrameFormat,
    crop: Option<Rect>,
    mode: CaptureMode,
    wdr: WdrMode,
    /// Last value of controls the hardware cannot read back.
    written: HashMap<u32, i64>,
    exports: Vec<ExportHandle>,
}

/// One `/dev/videoN`-style capture node.
pub struct VinDevice {
    vinc: usize,
    graph: MediaGraph,
    pipe: Arc<Pipeline>,
    state: Mutex<DeviceState>,
}

impl VinDevice {
    pub fn new(graph: &MediaGraph, vinc: usize) -> Result<Self> {
        let pipe = graph.pipeline(vinc)?.clone();
        let cfg = graph.config();
        let code = cfg
            .sensors
            .get(pipe.route().sensor)
            .map(|s| s.mbus_code)
            .ok_or(VinError::NoDevice {
                kind: "sensor",
                id: pipe.route().sensor,
            })?;
        let cap = &cfg.capture;
        let format = FrameFormat::new(cap.width, cap.height, cap.format, code, graph.platform());
        Ok(Self {
            vinc,
            graph: graph.clone(),
            pipe,
            state: Mutex::new(DeviceState {
                node: NodeState::Closed,
                format,
                crop: None,
                mode: cap.capture_mode,
                wdr: WdrMode::Linear,
                written: HashMap::new(),
                exports: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.vinc
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn busy(&self) -> VinError {
        VinError::Busy(format!("vinc{}", self.vinc))
    }

    pub fn state(&self) -> NodeState {
        self.lock().node
    }

    #[instrument(skip(self), fields(vinc = self.vinc))]
    pub fn open(&self) -> Result<()> {
        let mut st = self.lock();
        if st.node != NodeState::Closed {
            return Err(self.busy());
        }
        self.graph.open(self.vinc)?;
        st.node = NodeState::Open;
        Ok(())
    }

    /// Stop streaming if needed, free the buffers and power the route down.
    #[instrument(skip(self), fields(vinc = self.vinc))]
    pub fn close(&self) -> Result<()> {
        let mut st = self.lock();
        if st.node == NodeState::Closed {
            return Err(VinError::InvalidState("video node not open"));
        }
        self.graph.close(self.vinc)?;
        st.node = NodeState::Closed;
        let freed = self.release_buffers(&mut st)?;
        debug!(released = freed, "capture buffers released");
        Ok(())
    }

    /// Withdraw exports and drop the installed buffer set.
    fn release_buffers(&self, st: &mut DeviceState) -> Result<usize> {
        let alloc = self.graph.allocator();
        for h in st.exports.drain(..) {
            alloc.unexport(h);
        }
        Ok(self.pipe.dma().install(Vec::new())?.len())
    }

    pub fn set_low_power(&self, on: bool) -> Result<()> {
        let st = self.lock();
        match st.node {
            NodeState::Closed => Err(VinError::InvalidState("video node not open")),
            NodeState::Streaming => Err(self.busy()),
            NodeState::Open => self.graph.set_low_power(self.vinc, on),
        }
    }

    // ---------------------------------------------------------------------
    // Formats

    pub fn enumerate_formats(&self, index: usize) -> Option<FormatDesc> {
        format::enumerate(index)
    }

    /// Negotiate without storing: clamp to the platform bounds and compute
    /// the plane geometry.
    pub fn try_format(&self, width: u32, height: u32, pf: PixelFormat) -> Result<FrameFormat> {
        if !ALL_FORMATS.contains(&pf) {
            return Err(VinError::UnsupportedFormat(pf));
        }
        let code = self.lock().format.mbus_code;
        let fmt = FrameFormat::new(width, height, pf, code, self.graph.platform());
        if self.pipe.route().isp_channel > 0 {
            // Sub channels never exceed the sensor's largest window.
            let sensor = self.pipe.sensor().sensor();
            let (mw, mh) = sensor
                .windows()
                .iter()
                .map(|w| (w.width, w.height))
                .max_by_key(|&(w, h)| w as u64 * h as u64)
                .unwrap_or((fmt.width, fmt.height));
            if fmt.width > mw || fmt.height > mh {
                return Err(VinError::SubChannelTooLarge {
                    sub_w: fmt.width,
                    sub_h: fmt.height,
                    main_w: mw,
                    main_h: mh,
                });
            }
        }
        Ok(fmt)
    }

    pub fn set_format(&self, width: u32, height: u32, pf: PixelFormat) -> Result<FrameFormat> {
        let fmt = self.try_format(width, height, pf)?;
        let mut st = self.lock();
        if st.node == NodeState::Streaming {
            return Err(self.busy());
        }
        if st.format != fmt {
            // A crop chosen for the old size may no longer fit.
            st.crop = None;
        }
        st.format = fmt;
        debug!(vinc = self.vinc, w = fmt.width, h = fmt.height, ?pf, "format set");
        Ok(fmt)
    }

    pub fn get_format(&self) -> FrameFormat {
        self.lock().format
    }

    /// Input size of the scaler for the current format and WDR mode.
    fn scaler_input(&self, st: &DeviceState) -> Result<(u32, u32)> {
        if self.pipe.route().isp_channel > 0 {
            return Ok((st.format.width, st.format.height));
        }
        let sensor = self.pipe.sensor().sensor();
        if self.pipe.sensor().is_streaming() {
            let w = sensor.window();
            return Ok((w.width, w.height));
        }
        sensor::choose_window(&sensor.windows(), st.format.width, st.format.height, st.wdr)
            .map(|w| (w.width, w.height))
            .ok_or(VinError::InvalidState("sensor reports no windows"))
    }

    /// Set the scaler crop. The rectangle is normalised and must still cover
    /// the output size.
    pub fn set_selection(&self, crop: Rect) -> Result<Rect> {
        let mut st = self.lock();
        if st.node == NodeState::Streaming {
            return Err(self.busy());
        }
        let input = self.scaler_input(&st)?;
        let r = self.pipe.vipp().adjust_crop(input, crop)?;
        if r.width < st.format.width || r.height < st.format.height {
            return Err(VinError::InvalidArgument("crop smaller than the output"));
        }
        st.crop = Some(r);
        Ok(r)
    }

    pub fn get_selection(&self) -> Result<Rect> {
        let st = self.lock();
        match st.crop {
            Some(r) => Ok(r),
            None => self.scaler_input(&st).map(|(w, h)| Rect::full(w, h)),
        }
    }

    pub fn set_capture_mode(&self, mode: CaptureMode) -> Result<()> {
        let mut st = self.lock();
        if st.node == NodeState::Streaming {
            return Err(self.busy());
        }
        st.mode = mode;
        Ok(())
    }

    pub fn capture_mode(&self) -> CaptureMode {
        self.lock().mode
    }

    // ---------------------------------------------------------------------
    // Buffers

    /// Negotiate the buffer count for the current format and allocate it.
    /// Returns the number of buffers granted.
    #[instrument(skip(self), fields(vinc = self.vinc))]
    pub fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut st = self.lock();
        match st.node {
            NodeState::Closed => return Err(VinError::InvalidState("video node not open")),
            NodeState::Streaming => return Err(self.busy()),
            NodeState::Open => {}
        }
        let size = st.format.sizeimage;
        let n = queue_setup(count, size, st.mode, self.graph.platform().max_frame_mem)?
            .min(MAX_BUFFERS as u32);
        // The old set has to go first or a repeat request at the ceiling fails.
        let freed = self.release_buffers(&mut st)?;
        let alloc = self.graph.allocator();
        let bufs = (0..n as usize)
            .map(|i| {
                mem::alloc(alloc, size as usize, &format!("vinc{}-buf{i}", self.vinc))
                    .map(|dma| VideoBuffer::new(i, dma))
            })
            .collect::<Result<Vec<_>>>()?;
        self.pipe.dma().install(bufs)?;
        info!(count = n, size, freed, "buffers allocated");
        Ok(n)
    }

    pub fn query_buffer(&self, index: usize) -> Result<BufferInfo> {
        let buf = self
            .pipe
            .dma()
            .buffer(index)
            .ok_or(VinError::InvalidArgument("buffer index out of range"))?;
        Ok(BufferInfo {
            index,
            length: buf.dma.size(),
            phys: buf.phys(),
            state: buf.state,
        })
    }

    /// Publish a buffer for import elsewhere. The handle is withdrawn when
    /// the buffer set is reallocated or the node closes.
    pub fn export_buffer(&self, index: usize) -> Result<ExportHandle> {
        let mut st = self.lock();
        let buf = self
            .pipe
            .dma()
            .buffer(index)
            .ok_or(VinError::InvalidArgument("buffer index out of range"))?;
        let h = self.graph.allocator().export(&buf.dma);
        st.exports.push(h);
        Ok(h)
    }

    pub fn queue_buffer(&self, index: usize) -> Result<()> {
        self.pipe.dma().qbuf(index)
    }

    /// Wait up to `timeout` for a completed frame.
    pub fn dequeue_buffer(&self, timeout: Duration) -> Result<DoneFrame> {
        if self.lock().node != NodeState::Streaming {
            return Err(VinError::InvalidState("video node not streaming"));
        }
        self.pipe.dma().dequeue(timeout)
    }

    // ---------------------------------------------------------------------
    // Streaming

    #[instrument(skip(self), fields(vinc = self.vinc))]
    pub fn stream_on(&self) -> Result<()> {
        let mut st = self.lock();
        match st.node {
            NodeState::Closed => return Err(VinError::InvalidState("video node not open")),
            NodeState::Streaming => return Err(self.busy()),
            NodeState::Open => {}
        }
        if self.pipe.dma().buffer_count() == 0 {
            return Err(VinError::InvalidState("no buffers requested"));
        }
        let req = StreamRequest {
            format: st.format,
            crop: st.crop,
            mode: st.mode,
            wdr: st.wdr,
        };
        self.graph.stream_on(self.vinc, &req)?;
        st.node = NodeState::Streaming;
        Ok(())
    }

    #[instrument(skip(self), fields(vinc = self.vinc))]
    pub fn stream_off(&self) -> Result<()> {
        let mut st = self.lock();
        if st.node != NodeState::Streaming {
            return Err(VinError::InvalidState("video node not streaming"));
        }
        self.graph.stream_off(self.vinc)?;
        st.node = NodeState::Open;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Controls

    pub fn query_control(&self, id: u32) -> Result<ControlInfo> {
        let sensor = self.pipe.sensor();
        let info = |name, min, max, step, default| ControlInfo {
            id,
            name,
            min,
            max,
            step,
            default,
        };
        match id {
            cid::EXPOSURE => {
                let (lo, hi) = sensor.sensor().exposure_range();
                Ok(info("Exposure", lo as i64, hi as i64, 1, lo as i64))
            }
            cid::GAIN => {
                let (lo, hi) = sensor.sensor().gain_range();
                Ok(info("Gain", lo as i64, hi as i64, 1, lo as i64))
            }
            cid::FOCUS_ABSOLUTE => {
                let act = sensor.actuator().ok_or(VinError::InvalidControl(id))?;
                let (lo, hi) = act.range();
                Ok(info("Focus, Absolute", lo as i64, hi as i64, 1, lo as i64))
            }
            cid::FLASH_LED_MODE => {
                sensor.flash().ok_or(VinError::InvalidControl(id))?;
                Ok(info("LED Mode", 0, FlashMode::Strobe.value(), 1, 0))
            }
            cid::FLASH_STROBE => {
                sensor.flash().ok_or(VinError::InvalidControl(id))?;
                Ok(info("Strobe", 0, 1, 1, 0))
            }
            cid::TEST_PATTERN => Ok(info("Test Pattern", 0, 2, 1, 0)),
            cid::D3D_STRENGTH => Ok(info("3D Noise Reduction", 0, 255, 1, 64)),
            cid::WDR_MODE => Ok(info("WDR Mode", 0, 2, 1, 0)),
            _ => Err(VinError::InvalidControl(id)),
        }
    }

    /// Range-check `value` and apply it.
    pub fn set_control(&self, id: u32, value: i64) -> Result<()> {
        let q = self.query_control(id)?;
        if value < q.min || value > q.max {
            return Err(VinError::ControlOutOfRange {
                id,
                value,
                min: q.min,
                max: q.max,
            });
        }
        let mut st = self.lock();
        if st.node == NodeState::Closed {
            return Err(VinError::InvalidState("video node not open"));
        }
        let node = self.pipe.sensor();
        let sensor = node.sensor();
        match id {
            cid::EXPOSURE => sensor.set_exposure(ExposureGain {
                exposure: value as u32,
                ..sensor.exposure()
            })?,
            cid::GAIN => sensor.set_exposure(ExposureGain {
                gain: value as u32,
                ..sensor.exposure()
            })?,
            cid::FOCUS_ABSOLUTE => node
                .actuator()
                .ok_or(VinError::InvalidControl(id))?
                .set_position(value as u32)?,
            cid::FLASH_LED_MODE => {
                let mode = FlashMode::from_value(value).ok_or(VinError::InvalidControl(id))?;
                node.flash().ok_or(VinError::InvalidControl(id))?.set_mode(mode)?;
            }
            cid::FLASH_STROBE => node
                .flash()
                .ok_or(VinError::InvalidControl(id))?
                .strobe(value != 0)?,
            cid::TEST_PATTERN => {
                let p = match value {
                    1 => TestPattern::ColorBars,
                    2 => TestPattern::Gradient,
                    _ => TestPattern::Off,
                };
                sensor.set_test_pattern(p)?;
            }
            cid::D3D_STRENGTH => self
                .pipe
                .isp()
                .write_params(params::D3D_STRENGTH, &(value as u32).to_le_bytes())?,
            cid::WDR_MODE => {
                if st.node == NodeState::Streaming {
                    return Err(self.busy());
                }
                let mode = match value {
                    1 => WdrMode::TwoFrame,
                    2 => WdrMode::Dol,
                    _ => WdrMode::Linear,
                };
                if !sensor.wdr_modes().contains(&mode) {
                    return Err(VinError::InvalidArgument("wdr mode not supported by the sensor"));
                }
                st.wdr = mode;
            }
            _ => return Err(VinError::InvalidControl(id)),
        }
        st.written.insert(id, value);
        Ok(())
    }

    pub fn get_control(&self, id: u32) -> Result<i64> {
        let q = self.query_control(id)?;
        let node = self.pipe.sensor();
        let cached = self.lock().written.get(&id).copied().unwrap_or(q.default);
        Ok(match id {
            cid::EXPOSURE => node.sensor().exposure().exposure as i64,
            cid::GAIN => node.sensor().exposure().gain as i64,
            cid::FOCUS_ABSOLUTE => node.actuator().map_or(cached, |a| a.position() as i64),
            cid::FLASH_LED_MODE => node.flash().map_or(cached, |f| f.mode().value()),
            cid::D3D_STRENGTH => self
                .pipe
                .isp()
                .read_param(params::D3D_STRENGTH)
                .map_or(cached, |v| v as i64),
            _ => cached,
        })
    }

    // ---------------------------------------------------------------------
    // Overlay, events, diagnostics

    /// Replace the on-screen display. Needs a configured scaler, so the node
    /// must have streamed at least once since it was opened.
    pub fn set_overlay(&self, overlays: &[Overlay], covers: &[Cover]) -> Result<()> {
        if self.lock().node == NodeState::Closed {
            return Err(VinError::InvalidState("video node not open"));
        }
        self.pipe.vipp().set_overlay(overlays, covers)
    }

    pub fn subscribe_event(&self, kind: EventKind) -> flume::Receiver<VinEvent> {
        let depth = self.graph.config().pipeline.event_depth;
        self.pipe.dma().events().subscribe(kind, depth)
    }

    pub fn isp_stats(&self) -> Option<IspStats> {
        self.pipe.isp().latest_stats()
    }

    pub fn status(&self) -> DeviceStatus {
        let st = self.lock();
        let dma = self.pipe.dma();
        DeviceStatus {
            state: st.node,
            low_power: self.graph.is_low_power(self.vinc),
            format: st.format,
            buffers: dma.buffer_count(),
            sequence: dma.sequence(),
            stats: dma.stats().snapshot(),
            isp_frame_cnt: self.pipe.isp().frame_cnt(),
            resets: self.graph.reset_coordinator().resets(),
            signal: self.pipe.csi().signal_status(self.pipe.route().csi_channel),
        }
    }

    pub fn fault_history(&self) -> Vec<FaultRecord> {
        self.graph.history().snapshot()
    }
}

impl Drop for VinDevice {
    fn drop(&mut self) {
        let open = self.lock().node != NodeState::Closed;
        if open {
            if let Err(e) = self.close() {
                tracing::warn!(vinc = self.vinc, "close on drop: {e}");
            }
        }
    }
}
