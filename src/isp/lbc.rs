//! Line-based compression (LBC) parameters.
//!
//! The ratio and minimum-bit constants are calibrated per mode and have no
//! closed-form derivation; they are kept as a lookup table and must not be
//! recomputed. Register values derived from them are clamped to the field
//! width first and written afterwards, so an oversized value saturates
//! instead of wrapping into neighbouring fields.

use serde::{Deserialize, Serialize};

use crate::hw::regs::isp::LBC;
use crate::hw::RegBlock;
use crate::utils::align_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionMode {
    Lossless,
    Ratio1_5x,
    Ratio2x,
    Ratio2_5x,
}

/// Calibrated parameters of one compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbcParams {
    pub lossy: bool,
    /// Target bits per line as a per-mille of the uncompressed size, for
    /// luma-only (even) and luma+chroma (odd) lines.
    pub cmp_ratio_even: u32,
    pub cmp_ratio_odd: u32,
    /// Minimum bits granted to a macroblock on even and odd lines.
    pub mb_min_bit_even: u32,
    pub mb_min_bit_odd: u32,
}

const LBC_TABLE: [(CompressionMode, LbcParams); 4] = [
    (
        CompressionMode::Lossless,
        LbcParams {
            lossy: false,
            cmp_ratio_even: 1000,
            cmp_ratio_odd: 1000,
            mb_min_bit_even: 0,
            mb_min_bit_odd: 0,
        },
    ),
    (
        CompressionMode::Ratio1_5x,
        LbcParams {
            lossy: true,
            cmp_ratio_even: 670,
            cmp_ratio_odd: 658,
            mb_min_bit_even: 87,
            mb_min_bit_odd: 155,
        },
    ),
    (
        CompressionMode::Ratio2x,
        LbcParams {
            lossy: true,
            cmp_ratio_even: 600,
            cmp_ratio_odd: 450,
            mb_min_bit_even: 55,
            mb_min_bit_odd: 110,
        },
    ),
    (
        CompressionMode::Ratio2_5x,
        LbcParams {
            lossy: true,
            cmp_ratio_even: 440,
            cmp_ratio_odd: 380,
            mb_min_bit_even: 48,
            mb_min_bit_odd: 96,
        },
    ),
];

/// Pixels per compression macroblock row segment.
const MB_PIXELS: u32 = 256;
/// Target line sizes are multiples of this many bits.
const LINE_ALIGN_BITS: u32 = 512;

pub fn params(mode: CompressionMode) -> LbcParams {
    LBC_TABLE
        .iter()
        .find(|(m, _)| *m == mode)
        .map(|(_, p)| *p)
        .unwrap_or(LBC_TABLE[0].1)
}

/// Target bit budget of an even/odd line pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineGeometry {
    pub line_tar_bits: [u32; 2],
}

impl LineGeometry {
    pub fn bytes_per_line_pair(&self) -> u32 {
        (self.line_tar_bits[0] + self.line_tar_bits[1]) / 8
    }

    pub fn frame_bytes(&self, height: u32) -> u32 {
        (self.line_tar_bits[0] + self.line_tar_bits[1]) * height.div_ceil(2) / 8
    }
}

/// Line budget for a frame `stride` pixels wide at `bit_depth`.
pub fn line_geometry(mode: CompressionMode, stride: u32, bit_depth: u32) -> LineGeometry {
    let p = params(mode);
    let even = (p.cmp_ratio_even as u64 * stride as u64 * bit_depth as u64).div_ceil(1000);
    // Odd lines also carry the interleaved chroma samples.
    let odd = (p.cmp_ratio_odd as u64 * stride as u64 * bit_depth as u64 * 2).div_ceil(1000);
    LineGeometry {
        line_tar_bits: [
            align_up(even as u32, LINE_ALIGN_BITS),
            align_up(odd as u32, LINE_ALIGN_BITS),
        ],
    }
}

/// Bandwidth-limit / saturation pair for one compressed ISP buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbcRegs {
    pub bw_limit: u32,
    pub sat: u32,
    pub lossy: bool,
}

fn clamp_bits(value: u64, bits: u32) -> u32 {
    let max = (1u64 << bits) - 1;
    value.min(max) as u32
}

impl LbcRegs {
    /// Derive the register pair, clamped to `bw_bits`/`sat_bits`.
    pub fn derive(mode: CompressionMode, bit_depth: u32, bw_bits: u32, sat_bits: u32) -> Self {
        let p = params(mode);
        let bw = (MB_PIXELS as u64 * bit_depth as u64 * p.cmp_ratio_even as u64).div_ceil(1000);
        let sat = (p.mb_min_bit_even as u64 + p.mb_min_bit_odd as u64) * bit_depth as u64 / 4;
        LbcRegs {
            bw_limit: clamp_bits(bw, bw_bits),
            sat: clamp_bits(sat, sat_bits),
            lossy: p.lossy,
        }
    }

    pub fn write(&self, regs: &RegBlock, offset: u32) {
        let lossy = if self.lossy { LBC::LOSSY::SET } else { LBC::LOSSY::CLEAR };
        regs.write_fields(
            offset,
            LBC::BW_LIMIT.val(self.bw_limit) + LBC::SAT.val(self.sat) + lossy,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_preserved() {
        let p = params(CompressionMode::Ratio2x);
        assert_eq!((p.cmp_ratio_even, p.cmp_ratio_odd), (600, 450));
        assert_eq!((p.mb_min_bit_even, p.mb_min_bit_odd), (55, 110));
        assert!(!params(CompressionMode::Lossless).lossy);
    }

    #[test]
    fn registers_saturate_at_field_width() {
        // 256 * 16 * 1000 / 1000 = 4096, one past a 12-bit field.
        let r = LbcRegs::derive(CompressionMode::Lossless, 16, 12, 10);
        assert_eq!(r.bw_limit, 0xfff);
        assert!(!r.lossy);

        let r = LbcRegs::derive(CompressionMode::Ratio2x, 12, 12, 10);
        assert_eq!(r.bw_limit, 1844);
        assert_eq!(r.sat, (55 + 110) * 12 / 4);

        let r = LbcRegs::derive(CompressionMode::Ratio1_5x, 32, 12, 10);
        assert_eq!(r.sat, 0x3ff);
    }

    #[test]
    fn lines_are_512_bit_aligned() {
        for mode in [
            CompressionMode::Lossless,
            CompressionMode::Ratio1_5x,
            CompressionMode::Ratio2x,
            CompressionMode::Ratio2_5x,
        ] {
            let g = line_geometry(mode, 1920, 8);
            assert_eq!(g.line_tar_bits[0] % 512, 0);
            assert_eq!(g.line_tar_bits[1] % 512, 0);
        }
        let lossless = line_geometry(CompressionMode::Lossless, 1920, 8);
        let lossy = line_geometry(CompressionMode::Ratio2_5x, 1920, 8);
        assert!(lossy.frame_bytes(1080) < lossless.frame_bytes(1080));
    }
}
