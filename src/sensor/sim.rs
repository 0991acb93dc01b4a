//! Simulated sensor, lens actuator and flash.

use std::sync::Mutex;

use tracing::{debug, info};

use super::{Actuator, ExposureGain, Flash, FlashMode, Sensor, SensorWindow, TestPattern, WdrMode};
use crate::csi::{BusInfo, BusType};
use crate::error::{Result, VinError};
use crate::power::RailSpec;
use crate::SensorConfig;

/// Observable state of a [`SimSensor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimSensorState {
    pub powered: bool,
    pub standby: bool,
    pub streaming: bool,
    pub window: Option<SensorWindow>,
    pub exposure: ExposureGain,
    pub pattern: TestPattern,
    /// `cold_start` flag of every stream-on, oldest first.
    pub starts: Vec<bool>,
    /// Number of exposure writes.
    pub exposure_writes: usize,
}

pub struct SimSensor {
    name: String,
    bus: BusInfo,
    windows: Vec<SensorWindow>,
    state: Mutex<SimSensorState>,
    fail_power: Mutex<bool>,
}

impl SimSensor {
    /// Full-resolution window, a 2x2 binned window and, when enabled, a
    /// two-frame WDR window at full resolution.
    pub fn new(cfg: &SensorConfig) -> Self {
        let full = SensorWindow {
            mbus_code: cfg.mbus_code,
            width: cfg.width,
            height: cfg.height,
            hoffset: 0,
            voffset: 0,
            fps: cfg.fps,
            wdr: WdrMode::Linear,
        };
        let mut windows = vec![
            full,
            SensorWindow {
                width: cfg.width / 2,
                height: cfg.height / 2,
                fps: cfg.fps * 2,
                ..full
            },
        ];
        if cfg.wdr {
            windows.push(SensorWindow {
                wdr: WdrMode::TwoFrame,
                fps: (cfg.fps / 2).max(1),
                ..full
            });
        }
        let mut bus = BusInfo::new(cfg.bus, cfg.mbus_code.bit_depth() as u8);
        if cfg.bus == BusType::Mipi {
            bus.lanes = cfg.lanes;
        }
        Self {
            name: cfg.name.clone(),
            bus,
            windows,
            state: Mutex::new(SimSensorState {
                exposure: ExposureGain {
                    exposure: 1000,
                    gain: 16,
                },
                ..Default::default()
            }),
            fail_power: Mutex::new(false),
        }
    }

    pub fn state(&self) -> SimSensorState {
        self.lock().clone()
    }

    /// Make the next power-on fail.
    pub fn fail_power(&self, on: bool) {
        *self.fail_power.lock().unwrap_or_else(|e| e.into_inner()) = on;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimSensorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn err(&self, reason: &str) -> VinError {
        VinError::Sensor {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl Sensor for SimSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn bus(&self) -> BusInfo {
        self.bus
    }

    fn windows(&self) -> Vec<SensorWindow> {
        self.windows.clone()
    }

    fn window(&self) -> SensorWindow {
        self.lock().window.unwrap_or(self.windows[0])
    }

    fn set_window(&self, win: &SensorWindow) -> Result<()> {
        if !self.windows.contains(win) {
            return Err(self.err("unsupported window"));
        }
        let mut st = self.lock();
        if st.streaming && st.window != Some(*win) {
            return Err(VinError::Busy(self.name.clone()));
        }
        st.window = Some(*win);
        Ok(())
    }

    fn exposure(&self) -> ExposureGain {
        self.lock().exposure
    }

    fn set_exposure(&self, eg: ExposureGain) -> Result<()> {
        let (lo, hi) = self.exposure_range();
        let (glo, ghi) = self.gain_range();
        let mut st = self.lock();
        st.exposure = ExposureGain {
            exposure: eg.exposure.clamp(lo, hi),
            gain: eg.gain.clamp(glo, ghi),
        };
        st.exposure_writes += 1;
        Ok(())
    }

    fn exposure_range(&self) -> (u32, u32) {
        (1, self.window().height + 32)
    }

    fn gain_range(&self) -> (u32, u32) {
        (16, 16 * 64)
    }

    fn rails(&self) -> Vec<RailSpec> {
        [("iovdd", 1_800_000), ("avdd", 2_800_000), ("dvdd", 1_200_000)]
            .into_iter()
            .map(|(name, uv)| RailSpec {
                name: format!("{}-{name}", self.name),
                min_uv: uv,
                max_uv: uv,
            })
            .collect()
    }

    fn power(&self, on: bool) -> Result<()> {
        if on && *self.fail_power.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(self.err("power sequence failed"));
        }
        let mut st = self.lock();
        st.powered = on;
        if !on {
            st.streaming = false;
        }
        debug!(sensor = %self.name, on, "sensor power");
        Ok(())
    }

    fn standby(&self, on: bool) -> Result<()> {
        self.lock().standby = on;
        Ok(())
    }

    fn set_stream(&self, on: bool, cold_start: bool) -> Result<()> {
        let mut st = self.lock();
        if on && !st.powered {
            return Err(self.err("stream on while powered off"));
        }
        st.streaming = on;
        if on {
            st.starts.push(cold_start);
            info!(sensor = %self.name, cold_start, "sensor streaming");
        }
        Ok(())
    }

    fn wdr_modes(&self) -> Vec<WdrMode> {
        let mut modes: Vec<WdrMode> = self.windows.iter().map(|w| w.wdr).collect();
        modes.dedup();
        modes
    }

    fn set_test_pattern(&self, pattern: TestPattern) -> Result<()> {
        self.lock().pattern = pattern;
        Ok(())
    }
}

pub struct SimActuator {
    range: (u32, u32),
    pos: Mutex<u32>,
}

impl SimActuator {
    pub fn new(max: u32) -> Self {
        Self {
            range: (0, max),
            pos: Mutex::new(0),
        }
    }
}

impl Actuator for SimActuator {
    fn range(&self) -> (u32, u32) {
        self.range
    }

    fn position(&self) -> u32 {
        *self.pos.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_position(&self, pos: u32) -> Result<()> {
        if pos < self.range.0 || pos > self.range.1 {
            return Err(VinError::InvalidArgument("focus position out of range"));
        }
        *self.pos.lock().unwrap_or_else(|e| e.into_inner()) = pos;
        Ok(())
    }
}

#[derive(Default)]
pub struct SimFlash {
    mode: Mutex<FlashMode>,
    strobes: Mutex<usize>,
}

impl SimFlash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strobes(&self) -> usize {
        *self.strobes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Flash for SimFlash {
    fn mode(&self) -> FlashMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_mode(&self, mode: FlashMode) -> Result<()> {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
        Ok(())
    }

    fn strobe(&self, on: bool) -> Result<()> {
        if self.mode() != FlashMode::Strobe {
            return Err(VinError::InvalidState("flash not in strobe mode"));
        }
        if on {
            *self.strobes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn windows_follow_the_config() {
        let cfg = &Config::default().sensors[0];
        let s = SimSensor::new(cfg);
        let ws = s.windows();
        assert_eq!(ws.len(), 3);
        assert_eq!((ws[1].width, ws[1].height), (cfg.width / 2, cfg.height / 2));
        assert_eq!(s.wdr_modes(), vec![WdrMode::Linear, WdrMode::TwoFrame]);
        assert_eq!(s.bus().lanes, 2);
    }

    #[test]
    fn exposure_is_clamped_and_streaming_needs_power() {
        let s = SimSensor::new(&Config::default().sensors[0]);
        s.set_exposure(ExposureGain { exposure: 0, gain: 4096 }).unwrap();
        assert_eq!(s.exposure(), ExposureGain { exposure: 1, gain: 1024 });
        assert!(s.set_stream(true, true).is_err());
        s.power(true).unwrap();
        s.set_stream(true, true).unwrap();
        s.set_stream(true, false).unwrap();
        assert_eq!(s.state().starts, vec![true, false]);
    }

    #[test]
    fn strobe_requires_strobe_mode() {
        let f = SimFlash::new();
        assert!(f.strobe(true).is_err());
        f.set_mode(FlashMode::Strobe).unwrap();
        f.strobe(true).unwrap();
        assert_eq!(f.strobes(), 1);
    }
}
