//! MIPI CSI-2 receiver: lane count and packet data type.

use tracing::debug;

use super::{BusInfo, BusType};
use crate::capture::format::MbusCode;
use crate::error::{Result, VinError};
use crate::hw::regs::mipi::{off, CTRL, DT};
use crate::hw::RegBlock;
use crate::pipeline::{SharedGate, Subdev};

/// CSI-2 data type of a media-bus code.
pub fn data_type(code: MbusCode) -> u32 {
    match code.bit_depth() {
        _ if !code.is_bayer() => 0x1e,
        10 => 0x2b,
        12 => 0x2c,
        _ => 0x2a,
    }
}

#[derive(Debug, Clone, Copy)]
struct MipiCfg {
    lanes: u8,
    data_type: u32,
    channels: usize,
}

pub struct Mipi {
    id: usize,
    name: String,
    regs: RegBlock,
    power_gate: SharedGate,
    stream_gate: SharedGate,
    cfg: spin::Mutex<Option<MipiCfg>>,
}

impl Mipi {
    pub fn new(id: usize, regs: RegBlock) -> Self {
        Self {
            id,
            name: format!("mipi{id}"),
            regs,
            power_gate: SharedGate::new("power"),
            stream_gate: SharedGate::new("stream"),
            cfg: spin::Mutex::new(None),
        }
    }

    pub fn configure(&self, bus: &BusInfo, code: MbusCode) -> Result<()> {
        if bus.bus_type != BusType::Mipi {
            return Err(VinError::InvalidArgument("mipi receiver on a non-mipi link"));
        }
        if !(1..=4).contains(&bus.lanes) {
            return Err(VinError::InvalidArgument("mipi lane count must be 1..=4"));
        }
        let cfg = MipiCfg {
            lanes: bus.lanes,
            data_type: data_type(code),
            channels: bus.channels.max(1),
        };
        if self.stream_gate.is_held() {
            return match *self.cfg.lock() {
                Some(cur) if cur.lanes == cfg.lanes && cur.data_type == cfg.data_type => Ok(()),
                _ => Err(VinError::Busy(self.name.clone())),
            };
        }
        *self.cfg.lock() = Some(cfg);
        debug!(mipi = self.id, lanes = cfg.lanes, dt = cfg.data_type, "mipi configured");
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.is_set(off::CTRL, CTRL::EN)
    }
}

impl Subdev for Mipi {
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
        let cfg = (*self.cfg.lock()).ok_or(VinError::InvalidState("mipi not configured"))?;
        self.regs.write_fields(
            off::DT,
            DT::DATA_TYPE.val(cfg.data_type) + DT::VC_NUM.val(cfg.channels as u32 - 1),
        );
        self.regs.write_fields(
            off::CTRL,
            CTRL::EN::SET + CTRL::LANES.val(cfg.lanes as u32 - 1),
        );
        Ok(())
    }

    fn hw_disable(&self) {
        self.regs.write(off::CTRL, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockRegisters;
    use std::sync::Arc;

    #[test]
    fn data_types() {
        assert_eq!(data_type(MbusCode::Sbggr8_1x8), 0x2a);
        assert_eq!(data_type(MbusCode::Sbggr10_1x10), 0x2b);
        assert_eq!(data_type(MbusCode::Srggb12_1x12), 0x2c);
        assert_eq!(data_type(MbusCode::Uyvy8_2x8), 0x1e);
    }

    #[test]
    fn lanes_are_programmed_minus_one() {
        let mock = Arc::new(MockRegisters::new());
        let m = Mipi::new(0, RegBlock::new(mock.clone(), 0x8000, "mipi0"));
        let mut bus = BusInfo::new(BusType::Mipi, 10);
        bus.lanes = 4;
        m.configure(&bus, MbusCode::Sbggr10_1x10).unwrap();
        m.hw_enable().unwrap();
        assert_eq!(mock.peek(0x8000 + off::CTRL), 1 | (3 << 4));
        assert_eq!(mock.peek(0x8000 + off::DT) & 0x3f, 0x2b);
        bus.lanes = 5;
        assert!(m.configure(&bus, MbusCode::Sbggr10_1x10).is_err());
    }
}
