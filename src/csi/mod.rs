//! CSI parser, MIPI receiver, TDM receiver and the CSIC top bridge.
//!
//! The parser turns the sensor's bus signal into per-channel pixel windows
//! for the ISP. Its state machine is
//! `Idle → Configured → Streaming → (Error → Reset) → Idle`; errors are only
//! entered through the fault path, the parser does not detect them itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::format::{Field, FrameFormat, MbusCode};
use crate::error::{Result, VinError};
use crate::hw::regs::parser::{self, off, CH_INPUT, CH_WIN, IF_CFG, PRS_EN, SIGNAL_STA};
use crate::hw::regs::top;
use crate::hw::{poll_until, Delay, RegBlock};
use crate::pipeline::{Consumer, SharedGate, Subdev};
use crate::platform::PlatformDesc;
use crate::power::PowerHandle;

pub mod mipi;
pub mod tdm;

pub use mipi::Mipi;
pub use tdm::TdmRx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusType {
    Parallel,
    Bt656,
    Bt1120,
    Mipi,
}

/// Electrical description of a sensor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusInfo {
    pub bus_type: BusType,
    /// MIPI data lanes; ignored elsewhere.
    pub lanes: u8,
    /// Bits per sample on the wire.
    pub data_width: u8,
    /// Multiplexed channels (BT656 multi-channel, MIPI virtual channels).
    pub channels: usize,
    pub pclk_rising: bool,
    pub hsync_high: bool,
    pub vsync_high: bool,
}

impl BusInfo {
    pub fn new(bus_type: BusType, data_width: u8) -> Self {
        Self {
            bus_type,
            lanes: if bus_type == BusType::Mipi { 2 } else { 0 },
            data_width,
            channels: 1,
            pclk_rising: true,
            hsync_high: true,
            vsync_high: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputSeq {
    Yuyv = 0,
    Yvyu = 1,
    Uyvy = 2,
    Vyuy = 3,
}

struct BusFormat {
    code: MbusCode,
    seq: InputSeq,
    width: u8,
    buses: &'static [BusType],
}

const SERIAL_8: &[BusType] = &[BusType::Parallel, BusType::Bt656, BusType::Mipi];
const WIDE_16: &[BusType] = &[BusType::Parallel, BusType::Bt1120];
const RAW: &[BusType] = &[BusType::Parallel, BusType::Mipi];

/// Media-bus codes the parser accepts, with their input sequence and width.
const BUS_FORMATS: &[BusFormat] = &[
    BusFormat { code: MbusCode::Yuyv8_2x8, seq: InputSeq::Yuyv, width: 8, buses: SERIAL_8 },
    BusFormat { code: MbusCode::Yvyu8_2x8, seq: InputSeq::Yvyu, width: 8, buses: SERIAL_8 },
    BusFormat { code: MbusCode::Uyvy8_2x8, seq: InputSeq::Uyvy, width: 8, buses: SERIAL_8 },
    BusFormat { code: MbusCode::Vyuy8_2x8, seq: InputSeq::Vyuy, width: 8, buses: SERIAL_8 },
    BusFormat { code: MbusCode::Yuyv8_1x16, seq: InputSeq::Yuyv, width: 16, buses: WIDE_16 },
    BusFormat { code: MbusCode::Uyvy8_1x16, seq: InputSeq::Uyvy, width: 16, buses: WIDE_16 },
    BusFormat { code: MbusCode::Sbggr8_1x8, seq: InputSeq::Yuyv, width: 8, buses: RAW },
    BusFormat { code: MbusCode::Sgrbg8_1x8, seq: InputSeq::Yuyv, width: 8, buses: RAW },
    BusFormat { code: MbusCode::Sbggr10_1x10, seq: InputSeq::Yuyv, width: 10, buses: RAW },
    BusFormat { code: MbusCode::Srggb10_1x10, seq: InputSeq::Yuyv, width: 10, buses: RAW },
    BusFormat { code: MbusCode::Sbggr12_1x12, seq: InputSeq::Yuyv, width: 12, buses: RAW },
    BusFormat { code: MbusCode::Srggb12_1x12, seq: InputSeq::Yuyv, width: 12, buses: RAW },
];

fn bus_format(code: MbusCode) -> Option<&'static BusFormat> {
    BUS_FORMATS.iter().find(|f| f.code == code)
}

/// Rows × columns of the output tiling for `channels` multiplexed inputs.
///
/// BT656 tiles its channels into one frame: 2 channels side by side, 4 as a
/// 2×2 grid. Other buses keep channels as separate untiled windows.
pub fn arrangement(bus: BusType, channels: usize) -> Result<(u32, u32)> {
    match (bus, channels) {
        (_, 1) => Ok((1, 1)),
        (BusType::Bt656, 2) => Ok((1, 2)),
        (BusType::Bt656, 4) => Ok((2, 2)),
        (BusType::Bt656, _) => Err(VinError::InvalidArgument(
            "bt656 supports 1, 2 or 4 channels",
        )),
        (BusType::Mipi, 2..=4) => Ok((1, 1)),
        _ => Err(VinError::InvalidArgument("too many channels for this bus")),
    }
}

/// Channels one parser can multiplex.
pub const MAX_CHANNELS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Idle,
    Configured,
    Streaming,
    Error,
    /// Halted by a pipeline reset, configuration kept.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    Snapshot,
    #[default]
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParserConfig {
    bus: BusInfo,
    code: MbusCode,
    width: u32,
    height: u32,
    field: Field,
}

struct ParserInner {
    state: ParserState,
    cfg: Option<ParserConfig>,
    mode: StartMode,
    channels: usize,
    /// Bit per channel with capture running.
    capturing: u32,
    /// Consumers attached to each channel.
    users: [usize; MAX_CHANNELS],
}

/// Live input measurement of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalStatus {
    pub hsync: bool,
    pub vsync: bool,
    pub field: bool,
    pub width: u32,
    pub height: u32,
}

pub struct Parser {
    id: usize,
    name: String,
    regs: RegBlock,
    plat: &'static PlatformDesc,
    delay: Arc<dyn Delay>,
    power_gate: SharedGate,
    stream_gate: SharedGate,
    inner: spin::Mutex<ParserInner>,
}

impl Parser {
    pub fn new(id: usize, regs: RegBlock, plat: &'static PlatformDesc, delay: Arc<dyn Delay>) -> Self {
        Self {
            id,
            name: format!("csi{id}"),
            regs,
            plat,
            delay,
            power_gate: SharedGate::new("power"),
            stream_gate: SharedGate::new("stream"),
            inner: spin::Mutex::new(ParserInner {
                state: ParserState::Idle,
                cfg: None,
                mode: StartMode::Video,
                channels: 1,
                capturing: 0,
                users: [0; MAX_CHANNELS],
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ParserState {
        self.inner.lock().state
    }

    pub fn regs(&self) -> &RegBlock {
        &self.regs
    }

    /// Validate `bus`/`fmt` and program the interface registers.
    ///
    /// Nothing is written unless validation passes. A parser that is already
    /// streaming accepts only the configuration it is running with.
    #[instrument(skip(self, bus, fmt), fields(csi = self.id))]
    pub fn configure(&self, bus: &BusInfo, fmt: &FrameFormat) -> Result<()> {
        let entry = bus_format(fmt.mbus_code)
            .ok_or(VinError::UnsupportedBusCode(fmt.mbus_code.code()))?;
        if !entry.buses.contains(&bus.bus_type) || entry.width != bus.data_width {
            return Err(VinError::UnsupportedBusCode(fmt.mbus_code.code()));
        }
        arrangement(bus.bus_type, bus.channels)?;
        fmt.validate(self.plat)?;

        let cfg = ParserConfig {
            bus: *bus,
            code: fmt.mbus_code,
            width: fmt.width,
            height: fmt.height,
            field: fmt.field,
        };
        let mut inner = self.inner.lock();
        if inner.state == ParserState::Streaming {
            return if inner.cfg == Some(cfg) {
                Ok(())
            } else {
                Err(VinError::Busy(self.name.clone()))
            };
        }

        let if_mode = match bus.bus_type {
            BusType::Parallel | BusType::Mipi => IF_CFG::IF_MODE::Parallel,
            BusType::Bt656 => IF_CFG::IF_MODE::Bt656,
            BusType::Bt1120 => IF_CFG::IF_MODE::Bt1120,
        };
        let width = match entry.width {
            8 => IF_CFG::DATA_WIDTH::Bits8,
            10 => IF_CFG::DATA_WIDTH::Bits10,
            12 => IF_CFG::DATA_WIDTH::Bits12,
            _ => IF_CFG::DATA_WIDTH::Bits16,
        };
        let src = match fmt.field {
            Field::None => IF_CFG::SRC_TYPE::Progressive,
            Field::Interlaced => IF_CFG::SRC_TYPE::Interlaced,
        };
        let out = if fmt.mbus_code.is_bayer() {
            IF_CFG::OUTPUT_MODE::Raw
        } else {
            IF_CFG::OUTPUT_MODE::Yuv
        };
        self.regs.write_fields(
            off::IF_CFG,
            IF_CFG::INPUT_SEQ.val(entry.seq as u32)
                + if_mode
                + width
                + src
                + out
                + IF_CFG::CLK_POL.val(bus.pclk_rising as u32)
                + IF_CFG::HREF_POL.val(bus.hsync_high as u32)
                + IF_CFG::VREF_POL.val(bus.vsync_high as u32)
                + IF_CFG::CH_NUM.val(bus.channels.saturating_sub(1) as u32),
        );
        if bus.bus_type == BusType::Mipi {
            self.regs.write_fields(
                off::MIPI_IF_CFG,
                parser::MIPI_IF_CFG::CH_NUM.val(bus.channels.saturating_sub(1) as u32),
            );
        }
        inner.cfg = Some(cfg);
        inner.channels = bus.channels;
        inner.state = ParserState::Configured;
        debug!(code = fmt.mbus_code.code(), "parser configured");
        Ok(())
    }

    pub fn set_mode(&self, mode: StartMode) {
        self.inner.lock().mode = mode;
    }

    /// Program per-channel windows and enable the parser.
    pub fn start(&self, channel_count: usize, mode: StartMode) -> Result<()> {
        let mut inner = self.inner.lock();
        let cfg = inner
            .cfg
            .ok_or(VinError::InvalidState("parser not configured"))?;
        let (rows, cols) = arrangement(cfg.bus.bus_type, channel_count)?;
        for ch in 0..channel_count {
            let (row, col) = (ch as u32 / cols, ch as u32 % cols);
            let (hstart, vstart) = if rows * cols > 1 {
                (col * cfg.width, row * cfg.height)
            } else {
                (0, 0)
            };
            self.regs.write_fields(
                off::ch_hsize(ch),
                CH_WIN::START.val(hstart) + CH_WIN::LEN.val(cfg.width),
            );
            self.regs.write_fields(
                off::ch_vsize(ch),
                CH_WIN::START.val(vstart) + CH_WIN::LEN.val(cfg.height),
            );
        }
        let bus_en = if cfg.bus.bus_type == BusType::Mipi {
            PRS_EN::MCSIC_EN::SET
        } else {
            PRS_EN::NCSIC_EN::SET
        };
        self.regs
            .write_fields(off::EN, PRS_EN::EN::SET + PRS_EN::MODE::Normal + bus_en);
        inner.channels = channel_count;
        inner.mode = mode;
        inner.state = ParserState::Streaming;
        info!(csi = self.id, channel_count, ?mode, "parser started");
        Ok(())
    }

    pub fn capture_start(&self, ch: usize) {
        let mut inner = self.inner.lock();
        let bit = match inner.mode {
            StartMode::Snapshot => parser::cap_still_bit(ch),
            StartMode::Video => parser::cap_video_bit(ch),
        };
        self.regs.set_bit(off::CAP, bit, true);
        inner.capturing |= 1 << ch;
    }

    pub fn capture_stop(&self, ch: usize) {
        let mut inner = self.inner.lock();
        self.regs.set_bit(off::CAP, parser::cap_still_bit(ch), false);
        self.regs.set_bit(off::CAP, parser::cap_video_bit(ch), false);
        inner.capturing &= !(1 << ch);
    }

    /// Wait for the parser to go idle, then disable it.
    fn disable(&self) {
        let quiesced = poll_until(
            self.delay.as_ref(),
            self.plat.quiesce_polls,
            self.plat.quiesce_delay_us,
            || !self.regs.is_set(off::SIGNAL_STA, SIGNAL_STA::BUSY),
        );
        if !quiesced {
            warn!(csi = self.id, "parser still busy after quiesce budget, disabling anyway");
        }
        self.regs.write(off::CAP, 0);
        self.regs.write(off::EN, 0);
        let mut inner = self.inner.lock();
        inner.capturing = 0;
        inner.state = ParserState::Idle;
        inner.cfg = None;
        info!(csi = self.id, "parser disabled");
    }

    /// Fault path entry: the parser is part of a pipeline being reset.
    pub fn mark_error(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ParserState::Streaming {
            inner.state = ParserState::Error;
        }
    }

    /// Reset stop: drop the enable immediately, keep configuration.
    pub fn halt(&self) {
        self.regs.modify(off::EN, PRS_EN::EN::CLEAR);
        let mut inner = self.inner.lock();
        if matches!(inner.state, ParserState::Streaming | ParserState::Error) {
            inner.state = ParserState::Reset;
        }
    }

    /// Reset restart: back through idle to the kept configuration, then
    /// re-enable with the previous channel layout and resume every channel
    /// that was capturing.
    pub fn resume(&self) -> Result<()> {
        let (channels, mode, capturing) = {
            let mut inner = self.inner.lock();
            if inner.state == ParserState::Reset {
                inner.state = ParserState::Idle;
                if inner.cfg.is_some() {
                    inner.state = ParserState::Configured;
                }
                debug!(csi = self.id, state = ?inner.state, "parser leaving reset");
            }
            (inner.channels, inner.mode, inner.capturing)
        };
        self.start(channels, mode)?;
        for ch in 0..channels {
            if capturing & (1 << ch) != 0 {
                self.capture_start(ch);
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.is_set(off::EN, PRS_EN::EN)
    }

    pub fn signal_status(&self, ch: usize) -> SignalStatus {
        let sta = self.regs.read(off::SIGNAL_STA);
        let input = off::ch_input(ch);
        SignalStatus {
            hsync: sta & 1 != 0,
            vsync: sta & (1 << 1) != 0,
            field: sta & (1 << 2) != 0,
            width: self.regs.read_field(input, CH_INPUT::WIDTH),
            height: self.regs.read_field(input, CH_INPUT::HEIGHT),
        }
    }
}

impl Subdev for Parser {
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
        let (channels, mode) = {
            let inner = self.inner.lock();
            (inner.channels, inner.mode)
        };
        self.start(channels, mode)
    }

    fn hw_disable(&self) {
        self.disable();
    }

    /// Capture on a channel runs while at least one consumer is attached.
    fn attach(&self, consumer: Consumer) -> Result<()> {
        let ch = consumer.channel;
        if ch >= MAX_CHANNELS {
            return Err(VinError::InvalidArgument("parser channel out of range"));
        }
        let first = {
            let mut inner = self.inner.lock();
            inner.users[ch] += 1;
            inner.users[ch] == 1
        };
        if first {
            self.capture_start(ch);
        }
        Ok(())
    }

    fn detach(&self, consumer: Consumer) {
        let ch = consumer.channel;
        if ch >= MAX_CHANNELS {
            return;
        }
        let last = {
            let mut inner = self.inner.lock();
            inner.users[ch] = inner.users[ch].saturating_sub(1);
            inner.users[ch] == 0
        };
        if last {
            self.capture_stop(ch);
        }
    }
}

/// CSIC top: global enable, clocks, and the parser → ISP bridge.
pub struct CsiTop {
    regs: RegBlock,
    power: PowerHandle,
    power_gate: SharedGate,
    stream_gate: SharedGate,
}

impl CsiTop {
    pub fn new(regs: RegBlock, power: PowerHandle) -> Self {
        Self {
            regs,
            power,
            power_gate: SharedGate::new("power"),
            stream_gate: SharedGate::new("stream"),
        }
    }

    pub fn set_isp_bridge(&self, isp: usize, on: bool) {
        self.regs.set_bit(top::off::ISP_BRIDGE, isp as u32, on);
    }

    pub fn isp_bridge(&self, isp: usize) -> bool {
        self.regs.bit(top::off::ISP_BRIDGE, isp as u32)
    }

    /// Route parser `csi` through the TDM receiver.
    pub fn set_tdm_route(&self, csi: usize, on: bool) {
        self.regs.set_bit(top::off::TDM_ROUTE, csi as u32, on);
    }

    pub fn suspend(&self) {
        self.power.suspend();
    }

    pub fn resume(&self) -> Result<()> {
        self.power.resume()
    }

    pub fn is_powered(&self) -> bool {
        self.power.is_on()
    }
}

impl Subdev for CsiTop {
    fn name(&self) -> &str {
        "csic_top"
    }

    fn power_gate(&self) -> &SharedGate {
        &self.power_gate
    }

    fn stream_gate(&self) -> &SharedGate {
        &self.stream_gate
    }

    fn power_on(&self) -> Result<()> {
        self.power.on()
    }

    fn power_off(&self) {
        self.power.off();
    }

    fn hw_enable(&self) -> Result<()> {
        self.regs
            .write_fields(top::off::EN, top::TOP_EN::EN::SET + top::TOP_EN::VER_EN::SET);
        Ok(())
    }

    fn hw_disable(&self) {
        self.regs.write(top::off::EN, 0);
        self.regs.write(top::off::ISP_BRIDGE, 0);
    }
}
