//! Smart-mask learner: per-pixel sensitivity memory.
//!
//! Pixels that keep getting flagged as motion between events (wind-blown
//! branches, flickering signs) accumulate mask value and are eventually
//! blocked from the differ; calm pixels decay back to full sensitivity.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::alg::morph::{erode5, erode9};
use crate::frame::FrameBuffers;

/// Ceiling for the raw mask value.
const SMARTMASK_MAX: u8 = 80;

/// Raw mask values above this are blocked in the thresholded copy.
const SMARTMASK_TRIGGER: u8 = 20;

/// Learner sensitivity divisor for the given frame rate and speed.
pub fn sensitivity(lastrate: i32, speed: u8) -> i32 {
    (lastrate * (11 - speed as i32)).max(1)
}

/// One learner pass: decays the raw mask, folds in the accumulator,
/// rebuilds the thresholded copy and expands the blocked region.
///
/// The worker calls this every `5 * sensitivity` frames while no event is
/// in progress.
pub fn tune_smartmask(bufs: &mut FrameBuffers, lastrate: i32, speed: u8) {
    let n = bufs.size.motion_size();
    let sensitivity = sensitivity(lastrate, speed);

    for i in 0..n {
        if bufs.smartmask[i] > 0 {
            bufs.smartmask[i] -= 1;
        }
        let inc = bufs.smartmask_buffer[i] / sensitivity;
        if inc > 0 {
            bufs.smartmask[i] = bufs
                .smartmask[i]
                .saturating_add(inc.min(i32::from(u8::MAX)) as u8)
                .min(SMARTMASK_MAX);
            bufs.smartmask_buffer[i] %= sensitivity;
        }
        bufs.smartmask_final[i] = if bufs.smartmask[i] > SMARTMASK_TRIGGER {
            0
        } else {
            255
        };
    }

    // The final mask is inverted (0 = blocked), so eroding it with an open
    // border expands the blocked region.
    let (width, height) = (bufs.size.width, bufs.size.height);
    erode9(&mut bufs.smartmask_final, width, height, 255);
    erode5(&mut bufs.smartmask_final, width, height, 255);
}

/// Drops all learned state; used when the feature is switched off.
pub fn clear_smartmask(bufs: &mut FrameBuffers) {
    bufs.smartmask.fill(0);
    bufs.smartmask_final.fill(255);
    bufs.smartmask_buffer.fill(0);
}
