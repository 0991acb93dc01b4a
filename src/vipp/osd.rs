//! OSD overlay compositing. Overlays are packed band by band, ordered by x
//! within a band, into the single bitmap the engine reads top to bottom.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, VinError};

pub const MAX_OVERLAYS: usize = 64;
pub const MAX_COVERS: usize = 8;
/// Bytes per overlay pixel (ARGB1555).
pub const OSD_BPP: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub alpha: u8,
    /// `width * height` ARGB1555 pixels, row major.
    pub bitmap: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cover {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// YUV fill colour, `0x00YYUUVV`.
    pub color: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsdWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub alpha: u8,
    /// Index of the overlay in the caller's list.
    pub source: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsdLayout {
    pub bitmap: Bytes,
    pub windows: Vec<OsdWindow>,
    pub covers: Vec<Cover>,
    pub bands: usize,
}

impl OsdLayout {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.covers.is_empty()
    }

    pub fn window_table(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(self.windows.len() * 12);
        for w in &self.windows {
            b.put_u32_le(w.x | (w.y << 16));
            b.put_u32_le(w.width | (w.height << 16));
            b.put_u32_le(w.alpha as u32);
        }
        b.freeze()
    }

    pub fn cover_table(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(self.covers.len() * 12);
        for c in &self.covers {
            b.put_u32_le(c.x | (c.y << 16));
            b.put_u32_le(c.width | (c.height << 16));
            b.put_u32_le(c.color);
        }
        b.freeze()
    }
}

fn inside(x: u32, y: u32, w: u32, h: u32, frame_w: u32, frame_h: u32) -> bool {
    w > 0
        && h > 0
        && x.checked_add(w).is_some_and(|r| r <= frame_w)
        && y.checked_add(h).is_some_and(|b| b <= frame_h)
}

struct Band {
    top: u32,
    bottom: u32,
    members: Vec<usize>,
}

pub fn compose(overlays: &[Overlay], covers: &[Cover], frame_w: u32, frame_h: u32) -> Result<OsdLayout> {
    if overlays.len() > MAX_OVERLAYS {
        return Err(VinError::InvalidArgument("too many overlays"));
    }
    if covers.len() > MAX_COVERS {
        return Err(VinError::InvalidArgument("too many cover windows"));
    }
    for o in overlays {
        if !inside(o.x, o.y, o.width, o.height, frame_w, frame_h) {
            return Err(VinError::InvalidArgument("overlay outside the frame"));
        }
        if o.bitmap.len() != o.width as usize * o.height as usize * OSD_BPP {
            return Err(VinError::InvalidArgument("overlay bitmap size mismatch"));
        }
    }
    for c in covers {
        if !inside(c.x, c.y, c.width, c.height, frame_w, frame_h) {
            return Err(VinError::InvalidArgument("cover outside the frame"));
        }
    }

    let mut order: Vec<usize> = (0..overlays.len()).collect();
    order.sort_by_key(|&i| (overlays[i].y, overlays[i].x));

    let mut bands: Vec<Band> = Vec::new();
    for i in order {
        let o = &overlays[i];
        match bands.last_mut() {
            Some(b) if o.y < b.bottom => {
                b.bottom = b.bottom.max(o.y + o.height);
                b.members.push(i);
            }
            _ => bands.push(Band {
                top: o.y,
                bottom: o.y + o.height,
                members: vec![i],
            }),
        }
    }

    let total: usize = overlays.iter().map(|o| o.bitmap.len()).sum();
    let mut bitmap = BytesMut::with_capacity(total);
    let mut windows = Vec::with_capacity(overlays.len());
    for band in &mut bands {
        band.members.sort_by_key(|&i| overlays[i].x);
        for pair in band.members.windows(2) {
            let (a, b) = (&overlays[pair[0]], &overlays[pair[1]]);
            if a.x + a.width > b.x {
                return Err(VinError::InvalidArgument("overlays overlap"));
            }
        }
        for row in band.top..band.bottom {
            for &i in &band.members {
                let o = &overlays[i];
                if row < o.y || row >= o.y + o.height {
                    continue;
                }
                let pitch = o.width as usize * OSD_BPP;
                let start = (row - o.y) as usize * pitch;
                bitmap.extend_from_slice(&o.bitmap[start..start + pitch]);
            }
        }
        windows.extend(band.members.iter().map(|&i| {
            let o = &overlays[i];
            OsdWindow {
                x: o.x,
                y: o.y,
                width: o.width,
                height: o.height,
                alpha: o.alpha,
                source: i,
            }
        }));
    }

    Ok(OsdLayout {
        bitmap: bitmap.freeze(),
        windows,
        covers: covers.to_vec(),
        bands: bands.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Overlay whose every pixel holds its own tag byte.
    fn ov(tag: u8, x: u32, y: u32, w: u32, h: u32) -> Overlay {
        Overlay {
            x,
            y,
            width: w,
            height: h,
            alpha: 0xff,
            bitmap: Bytes::from(vec![tag; (w * h) as usize * OSD_BPP]),
        }
    }

    #[test]
    fn scanlines_interleave_overlays_of_a_band() {
        // Two overlays side by side, the right one starting one row lower.
        let list = [ov(2, 100, 11, 2, 2), ov(1, 0, 10, 4, 2)];
        let l = compose(&list, &[], 640, 480).unwrap();
        assert_eq!(l.bands, 1);
        assert_eq!(l.windows.iter().map(|w| w.source).collect::<Vec<_>>(), vec![1, 0]);
        let row = |tag: u8, w: usize| vec![tag; w * OSD_BPP];
        let expected: Vec<u8> = [row(1, 4), row(1, 4), row(2, 2), row(2, 2)].concat();
        assert_eq!(&l.bitmap[..], &expected[..]);
    }

    #[test]
    fn disjoint_rows_make_separate_bands() {
        let list = [ov(1, 0, 0, 2, 2), ov(2, 0, 100, 2, 2), ov(3, 8, 1, 2, 4)];
        let l = compose(&list, &[], 640, 480).unwrap();
        assert_eq!(l.bands, 2);
        assert_eq!(l.windows.len(), 3);
        assert_eq!(l.bitmap.len(), (4 + 4 + 8) * OSD_BPP);
        assert_eq!(l.window_table().len(), 3 * 12);
    }

    #[test]
    fn rejects_overlap_and_out_of_frame() {
        let list = [ov(1, 0, 0, 10, 10), ov(2, 5, 5, 10, 10)];
        assert!(compose(&list, &[], 640, 480).is_err());
        assert!(compose(&[ov(1, 636, 0, 8, 2)], &[], 640, 480).is_err());
        assert!(compose(&[ov(1, 0, 0, 0, 2)], &[], 640, 480).is_err());
        let mut bad = ov(1, 0, 0, 4, 4);
        bad.bitmap = Bytes::from_static(&[0; 3]);
        assert!(compose(&[bad], &[], 640, 480).is_err());
    }

    #[test]
    fn enforces_limits() {
        let many: Vec<Overlay> = (0..65).map(|i| ov(1, 0, i * 2, 2, 1)).collect();
        assert!(compose(&many, &[], 640, 480).is_err());
        assert!(compose(&many[..64], &[], 640, 480).is_ok());
        let cover = Cover {
            x: 0,
            y: 0,
            width: 16,
            height: 16,
            color: 0x108080,
        };
        assert!(compose(&[], &[cover; 9], 640, 480).is_err());
        let l = compose(&[], &[cover; 8], 640, 480).unwrap();
        assert_eq!(l.cover_table().len(), 8 * 12);
        assert!(!l.is_empty());
    }
}
