//! Detection algorithms: differencing, morphology, labeling, locating,
//! the reference model, the smartmask learner, tuners and suppressors.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

pub mod differ;
pub mod label;
pub mod locate;
pub mod morph;
pub mod reference;
pub mod smartmask;
pub mod suppress;
pub mod tune;

use crate::frame::FrameBuffers;
use morph::{DespeckleOp, dilate5, dilate9, erode5, erode9};

/// Runs the configured despeckle sequence over the motion image and
/// returns the resulting diff count.
///
/// An erode that leaves no pixels standing short-circuits the rest of the
/// sequence. A labeling step terminates it and switches the effective diff
/// count to the summed size of significant components; without one,
/// labeling stays disabled for the frame. An empty sequence passes
/// `old_diffs` through untouched.
pub fn despeckle(
    bufs: &mut FrameBuffers,
    ops: &[DespeckleOp],
    threshold: i32,
    old_diffs: i32,
    label_stack_limit: usize,
    total_labels: &mut i32,
) -> i32 {
    let width = bufs.size.width;
    let height = bufs.size.height;
    let mut diffs = 0;
    let mut labeled = false;
    let mut ran = false;

    for op in ops {
        ran = true;
        match op {
            DespeckleOp::Erode9 => {
                diffs = erode9(&mut bufs.out, width, height, 0);
                if diffs == 0 {
                    break;
                }
            }
            DespeckleOp::Erode5 => {
                diffs = erode5(&mut bufs.out, width, height, 0);
                if diffs == 0 {
                    break;
                }
            }
            DespeckleOp::Dilate9 => {
                diffs = dilate9(&mut bufs.out, width, height);
            }
            DespeckleOp::Dilate5 => {
                diffs = dilate5(&mut bufs.out, width, height);
            }
            DespeckleOp::Label => {
                diffs = label::label_image(bufs, threshold, label_stack_limit, total_labels);
                labeled = true;
                break;
            }
        }
    }

    if !labeled {
        bufs.labelsize_max = 0; // labeling disabled for this frame
    }
    if ran { diffs } else { old_diffs }
}
