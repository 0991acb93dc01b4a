//! Large-image split mode.
//!
//! Frames wider than one ISP pass are processed as two halves on alternating
//! passes. Each half is widened by an overlap so the filters at the seam see
//! real neighbours.

use crate::platform::{OverlapFormula, PlatformDesc};
use crate::utils::align_up;

pub fn overlap(f: &OverlapFormula, width: u32) -> u32 {
    align_up(f.base + width / f.div.max(1), f.align.max(1)).min(f.max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitGeometry {
    pub width: u32,
    pub height: u32,
    pub overlap: u32,
}

impl SplitGeometry {
    /// Width of one pass including the overlap.
    pub fn pass_width(&self) -> u32 {
        self.width / 2 + self.overlap
    }

    /// Horizontal output start of the left or right pass.
    pub fn ob_start(&self, right: bool) -> u32 {
        if right {
            self.width / 2 - self.overlap
        } else {
            0
        }
    }
}

/// Split geometry for a `width`×`height` input, or `None` when one pass is
/// enough.
pub fn geometry(plat: &PlatformDesc, width: u32, height: u32) -> Option<SplitGeometry> {
    if !plat.needs_split(width) {
        return None;
    }
    Some(SplitGeometry {
        width,
        height,
        overlap: overlap(&plat.large_overlap, width),
    })
}
