//! Pixel formats, media-bus codes and buffer geometry.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VinError};
use crate::isp::lbc::{self, CompressionMode};
use crate::platform::PlatformDesc;
use crate::utils::{align_down, align_up};

/// Output pixel formats produced by the DMA stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,
    Nv21,
    Yuv420,
    Yvu420,
    Nv16,
    Nv61,
    Yuv422p,
    Yuyv,
    Uyvy,
    Sbggr8,
    Sbggr10,
    Sbggr12,
    /// Line-based compressed NV12, lossless.
    Lbc1x,
    Lbc1_5x,
    Lbc2x,
    Lbc2_5x,
}

/// How the planes of a format are laid out in one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneLayout {
    /// One interleaved plane with `bits` per pixel.
    Packed { bits: u32 },
    /// Y plane followed by an interleaved CbCr plane.
    SemiPlanar { chroma_v_div: u32, swap_uv: bool },
    /// Y, Cb and Cr planes back to back.
    Planar { chroma_v_div: u32, swap_uv: bool },
    /// Line-based compressed single plane.
    Compressed { mode: CompressionMode },
}

pub const ALL_FORMATS: &[PixelFormat] = &[
    PixelFormat::Nv12,
    PixelFormat::Nv21,
    PixelFormat::Yuv420,
    PixelFormat::Yvu420,
    PixelFormat::Nv16,
    PixelFormat::Nv61,
    PixelFormat::Yuv422p,
    PixelFormat::Yuyv,
    PixelFormat::Uyvy,
    PixelFormat::Sbggr8,
    PixelFormat::Sbggr10,
    PixelFormat::Sbggr12,
    PixelFormat::Lbc1x,
    PixelFormat::Lbc1_5x,
    PixelFormat::Lbc2x,
    PixelFormat::Lbc2_5x,
];

impl PixelFormat {
    pub fn layout(self) -> PlaneLayout {
        use PixelFormat::*;
        match self {
            Nv12 => PlaneLayout::SemiPlanar {
                chroma_v_div: 2,
                swap_uv: false,
            },
            Nv21 => PlaneLayout::SemiPlanar {
                chroma_v_div: 2,
                swap_uv: true,
            },
            Nv16 => PlaneLayout::SemiPlanar {
                chroma_v_div: 1,
                swap_uv: false,
            },
            Nv61 => PlaneLayout::SemiPlanar {
                chroma_v_div: 1,
                swap_uv: true,
            },
            Yuv420 => PlaneLayout::Planar {
                chroma_v_div: 2,
                swap_uv: false,
            },
            Yvu420 => PlaneLayout::Planar {
                chroma_v_div: 2,
                swap_uv: true,
            },
            Yuv422p => PlaneLayout::Planar {
                chroma_v_div: 1,
                swap_uv: false,
            },
            Yuyv | Uyvy => PlaneLayout::Packed { bits: 16 },
            Sbggr8 => PlaneLayout::Packed { bits: 8 },
            Sbggr10 | Sbggr12 => PlaneLayout::Packed { bits: 16 },
            Lbc1x => PlaneLayout::Compressed {
                mode: CompressionMode::Lossless,
            },
            Lbc1_5x => PlaneLayout::Compressed {
                mode: CompressionMode::Ratio1_5x,
            },
            Lbc2x => PlaneLayout::Compressed {
                mode: CompressionMode::Ratio2x,
            },
            Lbc2_5x => PlaneLayout::Compressed {
                mode: CompressionMode::Ratio2_5x,
            },
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        use PixelFormat::*;
        *match self {
            Nv12 => b"NV12",
            Nv21 => b"NV21",
            Yuv420 => b"YU12",
            Yvu420 => b"YV12",
            Nv16 => b"NV16",
            Nv61 => b"NV61",
            Yuv422p => b"422P",
            Yuyv => b"YUYV",
            Uyvy => b"UYVY",
            Sbggr8 => b"BA81",
            Sbggr10 => b"BG10",
            Sbggr12 => b"BG12",
            Lbc1x => b"LBC1",
            Lbc1_5x => b"LBC5",
            Lbc2x => b"LBC2",
            Lbc2_5x => b"LBC3",
        }
    }

    pub fn description(self) -> &'static str {
        use PixelFormat::*;
        match self {
            Nv12 => "Y/CbCr 4:2:0",
            Nv21 => "Y/CrCb 4:2:0",
            Yuv420 => "Planar YUV 4:2:0",
            Yvu420 => "Planar YVU 4:2:0",
            Nv16 => "Y/CbCr 4:2:2",
            Nv61 => "Y/CrCb 4:2:2",
            Yuv422p => "Planar YUV 4:2:2",
            Yuyv => "YUYV 4:2:2",
            Uyvy => "UYVY 4:2:2",
            Sbggr8 => "RAW8 BGGR",
            Sbggr10 => "RAW10 BGGR",
            Sbggr12 => "RAW12 BGGR",
            Lbc1x => "LBC lossless",
            Lbc1_5x => "LBC 1.5x",
            Lbc2x => "LBC 2.0x",
            Lbc2_5x => "LBC 2.5x",
        }
    }

    pub fn is_raw(self) -> bool {
        matches!(
            self,
            PixelFormat::Sbggr8 | PixelFormat::Sbggr10 | PixelFormat::Sbggr12
        )
    }

    pub fn is_yuv422(self) -> bool {
        matches!(
            self.layout(),
            PlaneLayout::SemiPlanar { chroma_v_div: 1, .. }
                | PlaneLayout::Planar { chroma_v_div: 1, .. }
                | PlaneLayout::Packed { bits: 16 }
        ) && !self.is_raw()
    }

    /// DMA output format code.
    pub fn dma_code(self) -> u32 {
        ALL_FORMATS.iter().position(|f| *f == self).unwrap_or(0) as u32
    }

    pub fn compression(self) -> Option<CompressionMode> {
        match self.layout() {
            PlaneLayout::Compressed { mode } => Some(mode),
            _ => None,
        }
    }
}

/// Media-bus codes the sensors and parsers agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MbusCode {
    Uyvy8_2x8 = 0x2006,
    Vyuy8_2x8 = 0x2007,
    Yuyv8_2x8 = 0x2008,
    Yvyu8_2x8 = 0x2009,
    Uyvy8_1x16 = 0x200f,
    Yuyv8_1x16 = 0x2011,
    Sbggr8_1x8 = 0x3001,
    Sgrbg8_1x8 = 0x3002,
    Sbggr10_1x10 = 0x3007,
    Sbggr12_1x12 = 0x3008,
    Srggb10_1x10 = 0x300f,
    Srggb12_1x12 = 0x301a,
}

impl MbusCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_bayer(self) -> bool {
        self.code() & 0xf000 == 0x3000
    }

    /// Bits per sample on the bus.
    pub fn bit_depth(self) -> u32 {
        use MbusCode::*;
        match self {
            Sbggr10_1x10 | Srggb10_1x10 => 10,
            Sbggr12_1x12 | Srggb12_1x12 => 12,
            Uyvy8_1x16 | Yuyv8_1x16 => 16,
            _ => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Field {
    #[default]
    None,
    Interlaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Colorspace {
    #[default]
    Rec709,
    Jpeg,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneFmt {
    pub bytesperline: u32,
    pub size: u32,
}

/// Negotiated frame format of one capture node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub mbus_code: MbusCode,
    pub field: Field,
    pub colorspace: Colorspace,
    pub planes: [PlaneFmt; 3],
    pub num_planes: usize,
    pub sizeimage: u32,
}

impl FrameFormat {
    /// Build a format with sizes clamped and geometry computed for `plat`.
    pub fn new(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        mbus_code: MbusCode,
        plat: &PlatformDesc,
    ) -> Self {
        let (width, height) = clamp_size(width, height, plat);
        let mut fmt = FrameFormat {
            width,
            height,
            pixel_format,
            mbus_code,
            field: Field::None,
            colorspace: if pixel_format.is_raw() {
                Colorspace::Raw
            } else {
                Colorspace::Rec709
            },
            planes: [PlaneFmt::default(); 3],
            num_planes: 0,
            sizeimage: 0,
        };
        fmt.compute_planes(plat.width_align);
        fmt
    }

    /// Y stride in pixels.
    pub fn stride_pixels(&self, align: u32) -> u32 {
        align_up(self.width, align)
    }

    fn compute_planes(&mut self, align: u32) {
        let w = self.stride_pixels(align);
        let h = self.height;
        let (planes, n): ([PlaneFmt; 3], usize) = match self.pixel_format.layout() {
            PlaneLayout::Packed { bits } => {
                let bpl = w * bits / 8;
                (
                    [
                        PlaneFmt {
                            bytesperline: bpl,
                            size: bpl * h,
                        },
                        PlaneFmt::default(),
                        PlaneFmt::default(),
                    ],
                    1,
                )
            }
            PlaneLayout::SemiPlanar { chroma_v_div, .. } => (
                [
                    PlaneFmt {
                        bytesperline: w,
                        size: w * h,
                    },
                    PlaneFmt {
                        bytesperline: w,
                        size: w * h / chroma_v_div,
                    },
                    PlaneFmt::default(),
                ],
                2,
            ),
            PlaneLayout::Planar { chroma_v_div, .. } => {
                let c = PlaneFmt {
                    bytesperline: w / 2,
                    size: w / 2 * h / chroma_v_div,
                };
                (
                    [
                        PlaneFmt {
                            bytesperline: w,
                            size: w * h,
                        },
                        c,
                        c,
                    ],
                    3,
                )
            }
            PlaneLayout::Compressed { mode } => {
                let geo = lbc::line_geometry(mode, w, 8);
                let size = geo.frame_bytes(h);
                (
                    [
                        PlaneFmt {
                            bytesperline: geo.bytes_per_line_pair() / 2,
                            size,
                        },
                        PlaneFmt::default(),
                        PlaneFmt::default(),
                    ],
                    1,
                )
            }
        };
        self.planes = planes;
        self.num_planes = n;
        self.sizeimage = planes[..n].iter().map(|p| p.size).sum();
    }

    /// Byte offsets of the Cb and Cr planes from the buffer start. Zero when
    /// the plane does not exist.
    pub fn chroma_offsets(&self) -> (u32, u32) {
        match self.pixel_format.layout() {
            PlaneLayout::SemiPlanar { .. } => (self.planes[0].size, 0),
            PlaneLayout::Planar { swap_uv, .. } => {
                let first = self.planes[0].size;
                let second = first + self.planes[1].size;
                if swap_uv {
                    (second, first)
                } else {
                    (first, second)
                }
            }
            PlaneLayout::Packed { .. } | PlaneLayout::Compressed { .. } => (0, 0),
        }
    }

    /// Reject sizes outside the platform bounds without adjusting them.
    pub fn validate(&self, plat: &PlatformDesc) -> Result<()> {
        if self.width < plat.min_width
            || self.width > plat.max_width
            || self.height < plat.min_height
            || self.height > plat.max_height
        {
            return Err(VinError::SizeOutOfRange {
                width: self.width,
                height: self.height,
                min_w: plat.min_width,
                min_h: plat.min_height,
                max_w: plat.max_width,
                max_h: plat.max_height,
            });
        }
        Ok(())
    }
}

/// Clamp to the platform bounds. Width is aligned down to the platform width
/// alignment, height to 2 lines for chroma subsampling.
pub fn clamp_size(width: u32, height: u32, plat: &PlatformDesc) -> (u32, u32) {
    let max_w = align_down(plat.max_width, plat.width_align);
    let min_w = align_up(plat.min_width, plat.width_align);
    let w = align_down(width.clamp(min_w, max_w), plat.width_align);
    let h = align_down(height.clamp(plat.min_height, plat.max_height), 2);
    (w.max(min_w), h.max(align_up(plat.min_height, 2)))
}

/// One entry of the format enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDesc {
    pub index: usize,
    pub pixel_format: PixelFormat,
    pub fourcc: [u8; 4],
    pub description: &'static str,
}

pub fn enumerate(index: usize) -> Option<FormatDesc> {
    ALL_FORMATS.get(index).map(|&f| FormatDesc {
        index,
        pixel_format: f,
        fourcc: f.fourcc(),
        description: f.description(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plat() -> &'static PlatformDesc {
        PlatformDesc::lookup("sun8iw21").unwrap()
    }

    #[test]
    fn nv12_1080p_geometry() {
        let f = FrameFormat::new(1920, 1080, PixelFormat::Nv12, MbusCode::Sbggr10_1x10, plat());
        assert_eq!(f.num_planes, 2);
        assert_eq!(f.planes[0].bytesperline, 1920);
        assert_eq!(f.sizeimage, 1920 * 1080 * 3 / 2);
        assert_eq!(f.chroma_offsets(), (1920 * 1080, 0));
    }

    #[test]
    fn planar_swap_puts_cr_first() {
        let f = FrameFormat::new(640, 480, PixelFormat::Yvu420, MbusCode::Yuyv8_2x8, plat());
        let y = 640 * 480;
        assert_eq!(f.chroma_offsets(), (y + y / 4, y));
        assert_eq!(f.sizeimage, y * 3 / 2);
    }

    #[test]
    fn width_aligns_to_16() {
        let f = FrameFormat::new(1000, 721, PixelFormat::Nv12, MbusCode::Yuyv8_2x8, plat());
        assert_eq!((f.width, f.height), (992, 720));
    }

    #[test]
    fn clamp_is_idempotent_everywhere() {
        let p = plat();
        for w in (0..5000).step_by(7) {
            for h in [0, 1, 31, 33, 479, 1080, 2161, 9999] {
                let (cw, ch) = clamp_size(w, h, p);
                assert!(cw >= p.min_width && cw <= p.max_width);
                assert!(ch >= p.min_height && ch <= p.max_height);
                assert_eq!(cw % 16, 0);
                assert_eq!(clamp_size(cw, ch, p), (cw, ch));
            }
        }
    }

    #[test]
    fn enumerate_stops_at_end() {
        assert_eq!(enumerate(0).unwrap().fourcc, *b"NV12");
        assert!(enumerate(ALL_FORMATS.len()).is_none());
    }

    #[test]
    fn raw_formats_use_raw_colorspace() {
        let f = FrameFormat::new(640, 480, PixelFormat::Sbggr10, MbusCode::Sbggr10_1x10, plat());
        assert_eq!(f.colorspace, Colorspace::Raw);
        assert_eq!(f.planes[0].bytesperline, 1280);
    }
}
