//! Error taxonomy for the capture core

use thiserror::Error;

use crate::capture::format::PixelFormat;

pub type Result<T, E = VinError> = std::result::Result<T, E>;

/// Hardware faults reported by the ISP, DMA and parser interrupt sources.
///
/// These never reach the control plane on their own: the reset protocol
/// recovers from them and only a failed reset is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwFault {
    FifoOverflow,
    DdrConflict,
    LbcDecode,
    FrameLost,
    ConfigMismatch,
    HblankShort,
}

impl std::fmt::Display for HwFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HwFault::FifoOverflow => "fifo overflow",
            HwFault::DdrConflict => "ddr read/write conflict",
            HwFault::LbcDecode => "lbc decode error",
            HwFault::FrameLost => "frame lost",
            HwFault::ConfigMismatch => "configuration mismatch",
            HwFault::HblankShort => "horizontal blank too short",
        };
        f.write_str(name)
    }
}

impl HwFault {
    /// Faults that leave the ISP pipeline in an unknown state. The others are
    /// only counted.
    pub fn needs_reset(self) -> bool {
        !matches!(self, HwFault::HblankShort)
    }
}

#[derive(Error, Debug)]
pub enum VinError {
    // Negotiation
    #[error("unsupported format: {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("unsupported media bus code {0:#06x} on this bus")]
    UnsupportedBusCode(u32),
    #[error("size {width}x{height} outside [{min_w}x{min_h}, {max_w}x{max_h}]")]
    SizeOutOfRange {
        width: u32,
        height: u32,
        min_w: u32,
        min_h: u32,
        max_w: u32,
        max_h: u32,
    },
    #[error("sub channel {sub_w}x{sub_h} larger than main channel {main_w}x{main_h}")]
    SubChannelTooLarge {
        sub_w: u32,
        sub_h: u32,
        main_w: u32,
        main_h: u32,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unknown control {0:#x}")]
    InvalidControl(u32),
    #[error("control {id:#x} value {value} outside [{min}, {max}]")]
    ControlOutOfRange { id: u32, value: i64, min: i64, max: i64 },

    // Hardware faults that escaped local recovery
    #[error("hardware fault on {block}: {fault}")]
    HardwareFault { block: String, fault: HwFault },
    #[error("reset of isp{isp} failed: {reason}")]
    ResetFailed { isp: usize, reason: String },

    // Resource exhaustion
    #[error("out of DMA memory ({requested} bytes requested)")]
    NoMemory { requested: usize },
    #[error("buffer count clamped to zero by the frame memory ceiling")]
    NoBuffers,

    // Address latch
    #[error("dma address mismatch on {plane}: wrote {written:#010x}, read back {read:#010x}")]
    AddrMismatch {
        plane: &'static str,
        written: u32,
        read: u32,
    },

    // Shared resource / state machine misuse
    #[error("{0} is busy")]
    Busy(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("no such {kind} instance {id}")]
    NoDevice { kind: &'static str, id: usize },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    // External collaborators
    #[error("clock {name}: {reason}")]
    Clock { name: String, reason: String },
    #[error("regulator {name}: {reason}")]
    Regulator { name: String, reason: String },
    #[error("sensor {name}: {reason}")]
    Sensor { name: String, reason: String },

    #[error("unknown platform {0}")]
    UnknownPlatform(String),
}

impl VinError {
    /// True for errors that come from validating caller input.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            VinError::UnsupportedFormat(_)
                | VinError::UnsupportedBusCode(_)
                | VinError::SizeOutOfRange { .. }
                | VinError::SubChannelTooLarge { .. }
                | VinError::InvalidArgument(_)
                | VinError::InvalidControl(_)
                | VinError::ControlOutOfRange { .. }
        )
    }
}
