//! Adaptive reference-frame model.
//!
//! Moving objects are kept out of the reference for a bounded time so a
//! parked object eventually merges into the background while a walking
//! person never does.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::frame::FrameBuffers;

/// Seconds a changed pixel may stay dynamic before it is accepted into
/// the reference as a new static object.
const ACCEPT_STATIC_OBJECT_TIME: i32 = 10;

/// Pixels whose difference stays below this share of the noise floor are
/// adopted immediately.
const EXCLUDE_LEVEL_PERCENT: i32 = 20;

/// Re-seeds the reference from the current virgin frame and clears all
/// dynamic-object ages. Also used to initialize the model at camera start.
pub fn reset_reference(bufs: &mut FrameBuffers) {
    let n = bufs.size.motion_size();
    let (reference, virgin) = (&mut bufs.reference, &bufs.virgin);
    reference.copy_from_slice(&virgin[..n]);
    bufs.ref_dyn.fill(0);
}

/// Per-pixel reference update.
///
/// A pixel whose difference exceeds the exclusion threshold and is not
/// smart-masked is tracked by `ref_dyn`: freshly seen pixels get one
/// probation frame, pixels stale past `accept_timer` are adopted outright,
/// pixels still flagged as motion keep aging, and quiet ones are eased in
/// by averaging. Everything else is copied straight from the virgin frame.
pub fn update_reference(bufs: &mut FrameBuffers, noise: i32, lastrate: i32) {
    let mut accept_timer = lastrate * ACCEPT_STATIC_OBJECT_TIME;
    if lastrate > 5 {
        accept_timer /= lastrate / 3;
    }
    let threshold_ref = noise * EXCLUDE_LEVEL_PERCENT / 100;

    let n = bufs.size.motion_size();
    for i in 0..n {
        let virgin = bufs.virgin[i];
        let reference = bufs.reference[i];
        let diff = (reference as i32 - virgin as i32).abs();

        if diff > threshold_ref && bufs.smartmask_final[i] != 0 {
            if bufs.ref_dyn[i] == 0 {
                // first sight; give the pixel a chance
                bufs.ref_dyn[i] = 1;
            } else if bufs.ref_dyn[i] > accept_timer {
                // static long enough, accept into the reference
                bufs.ref_dyn[i] = 0;
                bufs.reference[i] = virgin;
            } else if bufs.out[i] != 0 {
                // still moving, keep excluding
                bufs.ref_dyn[i] += 1;
            } else {
                // quiet again, ease it in
                bufs.ref_dyn[i] = 0;
                bufs.reference[i] = ((reference as u16 + virgin as u16) / 2) as u8;
            }
        } else {
            bufs.ref_dyn[i] = 0;
            bufs.reference[i] = virgin;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameSize;

    fn bufs() -> FrameBuffers {
        FrameBuffers::new(FrameSize::new(8, 4))
    }

    #[test]
    fn reset_copies_virgin_and_clears_ages() {
        let mut b = bufs();
        for (i, v) in b.virgin.iter_mut().enumerate() {
            *v = i as u8;
        }
        b.ref_dyn.fill(9);
        reset_reference(&mut b);
        assert_eq!(&b.reference[..], &b.virgin[..32]);
        assert!(b.ref_dyn.iter().all(|&v| v == 0));
    }

    #[test]
    fn double_reset_is_idempotent() {
        let mut b = bufs();
        for (i, v) in b.virgin.iter_mut().enumerate() {
            *v = (i * 7) as u8;
        }
        reset_reference(&mut b);
        let first = b.reference.clone();
        reset_reference(&mut b);
        assert_eq!(first, b.reference);
    }

    #[test]
    fn calm_pixels_are_adopted() {
        let mut b = bufs();
        b.reference.fill(100);
        b.virgin.fill(102); // diff 2, below noise*20%
        update_reference(&mut b, 50, 5);
        assert!(b.reference.iter().all(|&v| v == 102));
        assert!(b.ref_dyn.iter().all(|&v| v == 0));
    }

    #[test]
    fn moving_pixel_is_held_out_then_accepted() {
        let mut b = bufs();
        b.reference.fill(100);
        b.virgin.fill(200);
        b.out[5] = 200; // pixel 5 flagged as motion
        let lastrate = 5;
        let accept_timer = lastrate * 10;

        update_reference(&mut b, 50, lastrate);
        assert_eq!(b.ref_dyn[5], 1);
        assert_eq!(b.reference[5], 100); // still excluded

        for _ in 0..accept_timer {
            update_reference(&mut b, 50, lastrate);
        }
        assert_eq!(b.ref_dyn[5], accept_timer + 1);

        // one more pass pushes it over the timer and adopts it
        update_reference(&mut b, 50, lastrate);
        assert_eq!(b.ref_dyn[5], 0);
        assert_eq!(b.reference[5], 200);
    }

    #[test]
    fn quiet_changed_pixel_eases_in() {
        let mut b = bufs();
        b.reference.fill(100);
        b.virgin.fill(200);
        // no out flag: pixel changed but not in motion
        update_reference(&mut b, 50, 5); // first sight
        update_reference(&mut b, 50, 5); // quiet, average
        assert_eq!(b.reference[0], 150);
        assert_eq!(b.ref_dyn[0], 0);
    }

    #[test]
    fn smartmasked_pixels_follow_virgin() {
        let mut b = bufs();
        b.reference.fill(100);
        b.virgin.fill(200);
        b.smartmask_final.fill(0);
        update_reference(&mut b, 50, 5);
        assert!(b.reference.iter().all(|&v| v == 200));
    }

    #[test]
    fn accept_timer_respects_rate_limit() {
        // lastrate 30: timer = 300 / (30/3) = 30
        let mut b = bufs();
        b.reference.fill(0);
        b.virgin.fill(255);
        b.out[0] = 255;
        update_reference(&mut b, 50, 30);
        let mut rounds = 1;
        while b.ref_dyn[0] != 0 {
            update_reference(&mut b, 50, 30);
            rounds += 1;
            assert!(rounds < 100, "pixel never accepted");
        }
        assert_eq!(b.reference[0], 255);
        assert_eq!(rounds, 32); // 1 (first sight) + 30 (aging) + 1 (accept)
    }
}
