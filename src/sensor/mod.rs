//! Sensor, actuator and flash collaborators.
//!
//! The capture core never talks to a sensor bus itself. It asks the sensor
//! what it can do (formats, windows, WDR modes), programs a window, and
//! drives power and streaming through this contract.

use serde::{Deserialize, Serialize};

use crate::capture::format::MbusCode;
use crate::csi::BusInfo;
use crate::error::{Result, VinError};
use crate::power::RailSpec;

pub mod sim;

pub use sim::{SimActuator, SimFlash, SimSensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WdrMode {
    #[default]
    Linear,
    /// Two exposures fused through ping-pong buffers in DRAM.
    TwoFrame,
    /// Digital overlap, fused on the fly.
    Dol,
}

impl WdrMode {
    /// Whether the ISP needs WDR ping-pong buffers for this mode.
    pub fn needs_buffers(self) -> bool {
        matches!(self, WdrMode::TwoFrame)
    }
}

/// One sensor output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorWindow {
    pub mbus_code: MbusCode,
    pub width: u32,
    pub height: u32,
    pub hoffset: u32,
    pub voffset: u32,
    pub fps: u32,
    pub wdr: WdrMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExposureGain {
    /// Exposure in lines.
    pub exposure: u32,
    /// Gain in 1/16 steps (16 = 1x).
    pub gain: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestPattern {
    #[default]
    Off,
    ColorBars,
    Gradient,
}

pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;
    fn bus(&self) -> BusInfo;
    fn windows(&self) -> Vec<SensorWindow>;
    fn window(&self) -> SensorWindow;
    fn set_window(&self, win: &SensorWindow) -> Result<()>;

    fn exposure(&self) -> ExposureGain;
    fn set_exposure(&self, eg: ExposureGain) -> Result<()>;
    fn exposure_range(&self) -> (u32, u32);
    fn gain_range(&self) -> (u32, u32);

    /// Power rails the sensor needs, in power-on order.
    fn rails(&self) -> Vec<RailSpec>;
    fn power(&self, on: bool) -> Result<()>;
    fn standby(&self, on: bool) -> Result<()>;
    /// `cold_start` is false when exposure/gain from a previous stream can
    /// be reused.
    fn set_stream(&self, on: bool, cold_start: bool) -> Result<()>;

    fn wdr_modes(&self) -> Vec<WdrMode> {
        vec![WdrMode::Linear]
    }

    fn set_test_pattern(&self, pattern: TestPattern) -> Result<()> {
        if pattern == TestPattern::Off {
            return Ok(());
        }
        Err(VinError::Sensor {
            name: self.name().to_string(),
            reason: "no pattern generator".into(),
        })
    }
}

pub trait Actuator: Send + Sync {
    fn range(&self) -> (u32, u32);
    fn position(&self) -> u32;
    fn set_position(&self, pos: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashMode {
    #[default]
    Off,
    Torch,
    Strobe,
}

impl FlashMode {
    pub fn from_value(v: i64) -> Option<Self> {
        match v {
            0 => Some(FlashMode::Off),
            1 => Some(FlashMode::Torch),
            2 => Some(FlashMode::Strobe),
            _ => None,
        }
    }

    pub fn value(self) -> i64 {
        match self {
            FlashMode::Off => 0,
            FlashMode::Torch => 1,
            FlashMode::Strobe => 2,
        }
    }
}

pub trait Flash: Send + Sync {
    fn mode(&self) -> FlashMode;
    fn set_mode(&self, mode: FlashMode) -> Result<()>;
    fn strobe(&self, on: bool) -> Result<()>;
}

/// Pick the sensor window for a requested output size.
///
/// Prefers the smallest window that covers the request in the wanted WDR
/// mode; falls back to the largest window in that mode, then to any mode.
pub fn choose_window(
    windows: &[SensorWindow],
    width: u32,
    height: u32,
    wdr: WdrMode,
) -> Option<SensorWindow> {
    let in_mode: Vec<&SensorWindow> = windows.iter().filter(|w| w.wdr == wdr).collect();
    let pool: Vec<&SensorWindow> = if in_mode.is_empty() {
        windows.iter().collect()
    } else {
        in_mode
    };
    let area = |w: &SensorWindow| w.width as u64 * w.height as u64;
    pool.iter()
        .filter(|w| w.width >= width && w.height >= height)
        .min_by_key(|w| area(w))
        .or_else(|| pool.iter().max_by_key(|w| area(w)))
        .map(|w| **w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn win(w: u32, h: u32, wdr: WdrMode) -> SensorWindow {
        SensorWindow {
            mbus_code: MbusCode::Sbggr10_1x10,
            width: w,
            height: h,
            hoffset: 0,
            voffset: 0,
            fps: 30,
            wdr,
        }
    }

    #[test]
    fn smallest_covering_window_wins() {
        let ws = [
            win(2560, 1440, WdrMode::Linear),
            win(1280, 720, WdrMode::Linear),
            win(1920, 1080, WdrMode::TwoFrame),
        ];
        let w = choose_window(&ws, 1280, 720, WdrMode::Linear).unwrap();
        assert_eq!((w.width, w.height), (1280, 720));
        let w = choose_window(&ws, 1920, 1080, WdrMode::Linear).unwrap();
        assert_eq!(w.width, 2560);
        let w = choose_window(&ws, 4000, 3000, WdrMode::Linear).unwrap();
        assert_eq!(w.width, 2560);
        let w = choose_window(&ws, 640, 480, WdrMode::TwoFrame).unwrap();
        assert_eq!(w.wdr, WdrMode::TwoFrame);
        let w = choose_window(&ws, 640, 480, WdrMode::Dol).unwrap();
        assert_eq!(w.width, 1280);
    }
}
