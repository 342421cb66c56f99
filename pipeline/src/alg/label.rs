//! Connected-component labeling over the motion image.
//!
//! Scanline flood fill after Heckbert, 4-connected. Components larger than
//! the frame-level threshold are re-flooded with bit 15 set so later stages
//! can select "significant" pixels cheaply.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::frame::FrameBuffers;

/// Label value marking background (no motion) pixels.
pub const BACKGROUND_LABEL: i32 = 1;

/// Added to a component's label when its size clears the threshold.
pub const SIGNIFICANT_BIT: i32 = 0x8000;

/// Segment stack bound. Floods that outgrow it leave the remaining pixels
/// unlabeled; component sizes are then under-reported, never fatal.
pub const DEFAULT_STACK_LIMIT: usize = 10_000;

struct Segment {
    y: i32,
    xl: i32,
    xr: i32,
    dy: i32,
}

fn push(stack: &mut Vec<Segment>, limit: usize, height: i32, y: i32, xl: i32, xr: i32, dy: i32) {
    if stack.len() < limit && y + dy >= 0 && y + dy < height {
        stack.push(Segment { y, xl, xr, dy });
    }
}

/// Floods one component, relabeling pixels that hold `old_value` and are
/// non-zero in `out`. Returns the number of pixels touched.
fn flood(
    out: &[u8],
    labels: &mut [i32],
    width: i32,
    height: i32,
    seed_x: i32,
    seed_y: i32,
    new_value: i32,
    old_value: i32,
    stack_limit: usize,
) -> i32 {
    if seed_x < 0 || seed_x >= width || seed_y < 0 || seed_y >= height {
        return 0;
    }
    let at = |x: i32, y: i32| (y * width + x) as usize;
    let fillable = |labels: &[i32], x: i32, y: i32| {
        out[at(x, y)] != 0 && labels[at(x, y)] == old_value
    };

    let mut count = 0;
    let mut stack: Vec<Segment> = Vec::with_capacity(64);
    push(&mut stack, stack_limit, height, seed_y, seed_x, seed_x, 1);
    push(&mut stack, stack_limit, height, seed_y + 1, seed_x, seed_x, -1);

    while let Some(seg) = stack.pop() {
        let dy = seg.dy;
        let y = seg.y + dy;
        let x1 = seg.xl;
        let x2 = seg.xr;

        // Extend left from x1 over fillable pixels.
        let mut x = x1;
        while x >= 0 && fillable(labels, x, y) {
            labels[at(x, y)] = new_value;
            count += 1;
            x -= 1;
        }

        let (mut l, mut entered_filled) = if x < x1 {
            let leftmost = x + 1;
            if leftmost < x1 {
                push(&mut stack, stack_limit, height, y, leftmost, x1 - 1, -dy);
            }
            x = x1 + 1;
            (leftmost, true)
        } else {
            // left scan found nothing; jump straight to the gap skip
            (x1, false)
        };

        loop {
            if entered_filled {
                while x < width && fillable(labels, x, y) {
                    labels[at(x, y)] = new_value;
                    count += 1;
                    x += 1;
                }
                push(&mut stack, stack_limit, height, y, l, x - 1, dy);
                if x > x2 + 1 {
                    push(&mut stack, stack_limit, height, y, x2 + 1, x - 1, -dy);
                }
            }
            entered_filled = true;

            // Skip the gap of unfillable pixels.
            x += 1;
            while x <= x2 && !fillable(labels, x, y) {
                x += 1;
            }
            l = x;
            if x > x2 {
                break;
            }
        }
    }
    count
}

/// Labels the whole motion image. Background pixels get label 1,
/// components are numbered from 2 in row-major discovery order; ties for
/// the largest component go to the first one found. Returns the summed
/// size of all significant components (the effective diff count while
/// labeling is active) and stores the component statistics in `bufs`.
pub fn label_image(
    bufs: &mut FrameBuffers,
    threshold: i32,
    stack_limit: usize,
    total_labels: &mut i32,
) -> i32 {
    let width = bufs.size.width as i32;
    let height = bufs.size.height as i32;
    let n = bufs.size.motion_size();

    *total_labels = 0;
    bufs.labelsize_max = 0;
    bufs.largest_label = 0;
    bufs.labelgroup_max = 0;
    bufs.labels_above = 0;
    bufs.labels[..n].fill(0);

    let mut current_label = 2;
    for iy in 0..height {
        for ix in 0..width {
            let pos = (iy * width + ix) as usize;
            if bufs.out[pos] == 0 {
                bufs.labels[pos] = BACKGROUND_LABEL;
                continue;
            }
            if bufs.labels[pos] > 0 {
                continue; // already visited by a flood
            }
            let labelsize = flood(
                &bufs.out,
                &mut bufs.labels,
                width,
                height,
                ix,
                iy,
                current_label,
                0,
                stack_limit,
            );
            if labelsize > 0 {
                if labelsize > threshold {
                    let resize = flood(
                        &bufs.out,
                        &mut bufs.labels,
                        width,
                        height,
                        ix,
                        iy,
                        current_label + SIGNIFICANT_BIT,
                        current_label,
                        stack_limit,
                    );
                    bufs.labelgroup_max += resize;
                    bufs.labels_above += 1;
                }
                if bufs.labelsize_max < labelsize {
                    bufs.labelsize_max = labelsize;
                    bufs.largest_label = current_label;
                }
                *total_labels += 1;
                current_label += 1;
            }
        }
    }
    bufs.labelgroup_max
}
