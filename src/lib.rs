//! User-space core of the sunxi VIN camera capture pipeline.
//!
//! A capture pipeline runs sensor → (MIPI) → CSI parser → (TDM) → ISP →
//! scaler/VIPP → DMA. This crate models every stage as a hardware block
//! behind a register bus. A [`pipeline::MediaGraph`] brings chains of blocks
//! up and down in order, and [`device::VinDevice`] exposes the control-plane
//! verbs a consumer uses.

pub mod capture;
pub mod csi;
pub mod device;
pub mod error;
pub mod hw;
pub mod isp;
pub mod mem;
pub mod pipeline;
pub mod platform;
pub mod power;
pub mod sensor;
pub mod utils;
pub mod vipp;

use serde::{Deserialize, Serialize};

pub use capture::format::{FrameFormat, MbusCode, PixelFormat};
pub use capture::queue::CaptureMode;
pub use csi::BusType;
pub use device::VinDevice;
pub use error::{HwFault, Result, VinError};
pub use pipeline::MediaGraph;

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Platform descriptor name, see [`platform::PlatformDesc::lookup`].
    pub platform: String,
    pub sensors: Vec<SensorConfig>,
    pub video: Vec<VideoConfig>,
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub mbus_code: MbusCode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bus: BusType,
    pub lanes: u8,
    pub wdr: bool,
    pub actuator: bool,
    pub flash: bool,
}

/// Routing of one video capture node through the hardware blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub id: usize,
    pub sensor: usize,
    pub mipi: Option<usize>,
    pub csi: usize,
    pub csi_channel: usize,
    pub tdm: Option<usize>,
    pub isp: usize,
    pub isp_channel: usize,
    pub vipp: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// 0 lets the driver pick.
    pub buffer_count: u32,
    pub capture_mode: CaptureMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Depth of each event subscription channel.
    pub event_depth: usize,
    /// Number of hardware faults kept for diagnostics.
    pub fault_history: usize,
    /// Keep ping-pong buffers across a low-power suspend/resume cycle.
    pub defer_pingpong_free: bool,
    /// Enable temporal (3D) noise reduction.
    pub d3d: bool,
    /// Compression used for the 3D-NR reference frames.
    pub d3d_compression: isp::lbc::CompressionMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform: "sun8iw21".into(),
            sensors: vec![SensorConfig {
                name: "simcam".into(),
                mbus_code: MbusCode::Sbggr10_1x10,
                width: 2560,
                height: 1440,
                fps: 30,
                bus: BusType::Mipi,
                lanes: 2,
                wdr: true,
                actuator: true,
                flash: true,
            }],
            video: vec![
                VideoConfig {
                    id: 0,
                    sensor: 0,
                    mipi: Some(0),
                    csi: 0,
                    csi_channel: 0,
                    tdm: None,
                    isp: 0,
                    isp_channel: 0,
                    vipp: 0,
                },
                VideoConfig {
                    id: 1,
                    sensor: 0,
                    mipi: Some(0),
                    csi: 0,
                    csi_channel: 0,
                    tdm: None,
                    isp: 0,
                    isp_channel: 1,
                    vipp: 1,
                },
            ],
            capture: CaptureConfig {
                width: 1920,
                height: 1080,
                format: PixelFormat::Nv12,
                buffer_count: 0,
                capture_mode: CaptureMode::Video,
            },
            pipeline: PipelineConfig {
                event_depth: 32,
                fault_history: 64,
                defer_pingpong_free: true,
                d3d: true,
                d3d_compression: isp::lbc::CompressionMode::Ratio2x,
            },
        }
    }
}
