//! Motion centroid and bounding box.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::alg::label::SIGNIFICANT_BIT;
use crate::frame::{FrameBuffers, Location};

/// Bounding-box expansion factors applied to the mean absolute deviation
/// around the centroid. The default expands further above the centroid
/// than below so that a standing person's head lands inside the box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BboxExpand {
    pub horizontal: i32,
    pub above: i32,
    pub below: i32,
}

impl Default for BboxExpand {
    fn default() -> Self {
        BboxExpand {
            horizontal: 2,
            above: 3,
            below: 2,
        }
    }
}

/// Locates the center and extent of the detected motion.
///
/// While labeling is active only pixels of significant components
/// contribute; otherwise every non-zero motion pixel does. With no
/// contributing pixels at all the result is the degenerate all-zero
/// location.
pub fn locate_center_size(bufs: &FrameBuffers, expand: BboxExpand) -> Location {
    let width = bufs.size.width as i32;
    let height = bufs.size.height as i32;
    let use_labels = bufs.labelsize_max > 0;

    let contributes = |pos: usize| {
        if use_labels {
            bufs.labels[pos] & SIGNIFICANT_BIT != 0
        } else {
            bufs.out[pos] != 0
        }
    };

    // Sums run in i64: a full-HD frame of motion overflows 32 bits.
    let mut sum_x: i64 = 0;
    let mut sum_y: i64 = 0;
    let mut centc: i64 = 0;
    let mut pos = 0;
    for y in 0..height {
        for x in 0..width {
            if contributes(pos) {
                sum_x += x as i64;
                sum_y += y as i64;
                centc += 1;
            }
            pos += 1;
        }
    }
    if centc == 0 {
        return Location::default();
    }
    let mut cent = Location {
        x: (sum_x / centc) as i32,
        y: (sum_y / centc) as i32,
        ..Location::default()
    };

    // Second pass: mean absolute deviation around the centroid.
    let mut xdist: i64 = 0;
    let mut ydist: i64 = 0;
    let mut pos = 0;
    for y in 0..height {
        for x in 0..width {
            if contributes(pos) {
                xdist += (x - cent.x).abs() as i64;
                ydist += (y - cent.y).abs() as i64;
            }
            pos += 1;
        }
    }

    let xdev = (xdist / centc) as i32;
    let ydev = (ydist / centc) as i32;
    cent.minx = (cent.x - xdev * expand.horizontal).clamp(0, width - 1);
    cent.maxx = (cent.x + xdev * expand.horizontal).clamp(0, width - 1);
    cent.miny = (cent.y - ydev * expand.above).clamp(0, height - 1);
    cent.maxy = (cent.y + ydev * expand.below).clamp(0, height - 1);

    cent.width = cent.maxx - cent.minx;
    cent.height = cent.maxy - cent.miny;

    // Re-center y to the midpoint of the (upward-biased) final box.
    cent.y = (cent.miny + cent.maxy) / 2;

    cent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::label::{DEFAULT_STACK_LIMIT, label_image};
    use crate::frame::FrameSize;

    #[test]
    fn still_scene_is_degenerate() {
        let bufs = FrameBuffers::new(FrameSize::new(8, 4));
        let loc = locate_center_size(&bufs, BboxExpand::default());
        assert_eq!(loc, Location::default());
    }

    #[test]
    fn single_blip_centroid() {
        let mut bufs = FrameBuffers::new(FrameSize::new(8, 4));
        bufs.out[2 * 8 + 1] = 255;
        let loc = locate_center_size(&bufs, BboxExpand::default());
        assert_eq!((loc.x, loc.y), (1, 2));
        assert_eq!((loc.minx, loc.maxx, loc.miny, loc.maxy), (1, 1, 2, 2));
    }

    #[test]
    fn bbox_stays_inside_frame() {
        let (w, h) = (8, 4);
        let mut bufs = FrameBuffers::new(FrameSize::new(w, h));
        // motion hugging the corners forces large deviations
        for &(x, y) in &[(0, 0), (7, 0), (0, 3), (7, 3)] {
            bufs.out[y * w + x] = 255;
        }
        let loc = locate_center_size(&bufs, BboxExpand::default());
        assert!(loc.minx >= 0 && loc.maxx <= w as i32 - 1);
        assert!(loc.miny >= 0 && loc.maxy <= h as i32 - 1);
        assert!(loc.minx <= loc.maxx && loc.miny <= loc.maxy);
    }

    #[test]
    fn vertical_bias_lifts_box_top() {
        let (w, h) = (9, 31);
        let mut bufs = FrameBuffers::new(FrameSize::new(w, h));
        // vertical bar centered at y=15, deviation 5
        for y in 10..21 {
            bufs.out[y * w + 4] = 255;
        }
        let loc = locate_center_size(&bufs, BboxExpand::default());
        // dy = 30/11 = 2 after integer division
        assert_eq!(loc.miny, 15 - 2 * 3);
        assert_eq!(loc.maxy, 15 + 2 * 2);
        assert_eq!(loc.y, (loc.miny + loc.maxy) / 2);
    }

    #[test]
    fn labeling_restricts_to_significant_component() {
        let (w, h) = (8, 4);
        let mut bufs = FrameBuffers::new(FrameSize::new(w, h));
        // 3-px component on the left, 1-px speckle on the right
        for &(x, y) in &[(1, 1), (2, 1), (1, 2), (6, 3)] {
            bufs.out[y * w + x] = 255;
        }
        let mut total = 0;
        label_image(&mut bufs, 2, DEFAULT_STACK_LIMIT, &mut total);
        let loc = locate_center_size(&bufs, BboxExpand::default());
        // the speckle at (6,3) must not drag the centroid right
        assert!(loc.x <= 2);
    }

    #[test]
    fn single_row_frame() {
        let mut bufs = FrameBuffers::new(FrameSize::new(5, 1));
        bufs.out[2] = 255;
        let loc = locate_center_size(&bufs, BboxExpand::default());
        assert_eq!((loc.x, loc.y), (2, 0));
        assert_eq!((loc.miny, loc.maxy), (0, 0));
    }
}
