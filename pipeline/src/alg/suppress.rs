//! Whole-scene change suppressors: lightswitch and switchfilter.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::frame::FrameBuffers;

/// True when the share of changed pixels exceeds the configured
/// percentage, indicating a light being switched or the camera being
/// knocked rather than genuine motion. The caller zeroes the frame's
/// diffs, damps detection for a few frames and resets the reference.
pub fn lightswitch(diffs: i32, motion_size: usize, percent: i32) -> bool {
    let percent = percent.clamp(0, 100);
    diffs > (motion_size as i64 * percent as i64 / 100) as i32
}

/// Row-profile heuristic for a video signal switch (camera swap). Counts
/// per-row motion totals: `vertlines` rows carry more than `W/18` motion
/// pixels, `lines` rows more than twice the per-row average. A
/// switch-like profile suppresses the frame entirely; anything else
/// passes the diff count through unchanged.
pub fn switchfilter(bufs: &FrameBuffers, diffs: i32) -> i32 {
    let width = bufs.size.width;
    let height = bufs.size.height;
    let linediff = diffs / height as i32;

    let mut lines = 0i32;
    let mut vertlines = 0i32;
    for y in 0..height {
        let row = &bufs.out[y * width..(y + 1) * width];
        let line = row.iter().filter(|&&v| v != 0).count() as i32;
        if line > width as i32 / 18 {
            vertlines += 1;
        }
        if line > linediff * 2 {
            lines += 1;
        }
    }

    let switched = vertlines > height as i32 / 10
        && lines < vertlines / 3
        && (vertlines > height as i32 / 4 || lines - vertlines > lines / 2);
    if switched { 0 } else { diffs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuffers, FrameSize};

    #[test]
    fn lightswitch_percentage_boundary() {
        // 32 pixels, 50%: strictly more than 16 changed pixels trips it
        assert!(!lightswitch(16, 32, 50));
        assert!(lightswitch(17, 32, 50));
    }

    #[test]
    fn lightswitch_percent_is_clamped() {
        assert!(!lightswitch(32, 32, 1000)); // clamped to 100%: 32 > 32 fails
        assert!(lightswitch(1, 32, -5)); // clamped to 0%: any diff trips
    }

    #[test]
    fn whole_frame_flip_is_a_switch() {
        let (w, h) = (36, 20);
        let mut bufs = FrameBuffers::new(FrameSize::new(w, h));
        for i in 0..w * h {
            bufs.out[i] = 200;
        }
        let diffs = (w * h) as i32;
        // every row is a vertline; per-row average equals the row count so
        // no row exceeds twice the average
        assert_eq!(switchfilter(&bufs, diffs), 0);
    }

    #[test]
    fn compact_blob_passes_through() {
        let (w, h) = (36, 20);
        let mut bufs = FrameBuffers::new(FrameSize::new(w, h));
        let mut diffs = 0;
        for y in 8..12 {
            for x in 10..14 {
                bufs.out[y * w + x] = 200;
                diffs += 1;
            }
        }
        assert_eq!(switchfilter(&bufs, diffs), diffs);
    }
}
