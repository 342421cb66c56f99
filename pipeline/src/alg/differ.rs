//! Per-pixel frame differencing.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::frame::NEUTRAL_CHROMA;

/// Increment applied to the smartmask accumulator when a pixel is flagged
/// outside an event.
const SMARTMASK_SENSITIVITY_INCR: i32 = 5;

/// How many pixels the wide kernel handles per batch.
const LANES: usize = 8;

/// Borrowed view of everything one differencing pass reads and writes.
///
/// `out` is the full YUV buffer; the luma plane is zeroed and sparsely
/// repopulated, the chroma half-plane is reset to neutral so the motion
/// image stays renderable.
pub struct DiffFrame<'a> {
    pub reference: &'a [u8],
    pub new: &'a [u8],
    pub mask: Option<&'a [u8]>,
    pub smartmask_final: &'a [u8],
    pub smartmask_buffer: &'a mut [i32],
    pub out: &'a mut [u8],
    pub noise: i32,
    pub smartmask_speed: u8,
    /// True while no event is in progress; only then does the differ feed
    /// the smartmask accumulator.
    pub accumulate_smartmask: bool,
}

/// A differencing implementation. The scalar and wide kernels must produce
/// bit-identical `out` buffers and diff counts; neither touches any state
/// beyond what `DiffFrame` exposes.
pub trait DiffKernel: Send {
    fn diff(&self, frame: DiffFrame<'_>) -> i32;
}

/// Kernel used unless a caller asks for a specific one.
pub fn default_kernel() -> Box<dyn DiffKernel> {
    Box::new(WideDiff)
}

fn reset_motion_image(out: &mut [u8], motion_size: usize) {
    out[..motion_size].fill(0);
    out[motion_size..].fill(NEUTRAL_CHROMA);
}

/// Straightforward pixel-at-a-time reference implementation.
pub struct ScalarDiff;

impl DiffKernel for ScalarDiff {
    fn diff(&self, frame: DiffFrame<'_>) -> i32 {
        let n = frame.reference.len();
        reset_motion_image(frame.out, n);
        diff_range(frame, 0, n)
    }
}

/// Batched implementation working eight lanes at a time, mirroring the
/// layout an 8-wide SIMD unit would use. In the unmasked case differences
/// are scaled by 255 with a shift instead of a multiply, which is what
/// keeps the two kernels bit-identical.
pub struct WideDiff;

impl DiffKernel for WideDiff {
    fn diff(&self, frame: DiffFrame<'_>) -> i32 {
        let n = frame.reference.len();
        reset_motion_image(frame.out, n);

        let noise255 = ((frame.noise as u32) << 8) - frame.noise as u32;
        let mut diffs = 0;
        let wide_end = n - n % LANES;

        let mut i = 0;
        while i < wide_end {
            let mut d = [0u32; LANES];
            for lane in 0..LANES {
                let r = frame.reference[i + lane] as i32;
                let v = frame.new[i + lane] as i32;
                d[lane] = (r - v).unsigned_abs();
            }

            // Motion flag per lane. Without a mask, compare d*255 against
            // noise*255 via shift-and-subtract.
            let mut flagged = [false; LANES];
            match frame.mask {
                Some(mask) => {
                    for lane in 0..LANES {
                        let dm = d[lane] * mask[i + lane] as u32 / 255;
                        flagged[lane] = (dm as i32) > frame.noise;
                    }
                }
                None => {
                    for lane in 0..LANES {
                        let d255 = (d[lane] << 8) - d[lane];
                        flagged[lane] = d255 > noise255;
                    }
                }
            }

            if frame.smartmask_speed != 0 {
                for lane in 0..LANES {
                    if flagged[lane] {
                        if frame.accumulate_smartmask {
                            frame.smartmask_buffer[i + lane] += SMARTMASK_SENSITIVITY_INCR;
                        }
                        if frame.smartmask_final[i + lane] == 0 {
                            flagged[lane] = false;
                        }
                    }
                }
            }

            for lane in 0..LANES {
                if flagged[lane] {
                    frame.out[i + lane] = frame.new[i + lane];
                    diffs += 1;
                }
            }
            i += LANES;
        }

        diffs + diff_range(frame, wide_end, n)
    }
}

/// Shared per-pixel tail used by the scalar kernel and the wide kernel's
/// remainder handling.
fn diff_range(frame: DiffFrame<'_>, start: usize, end: usize) -> i32 {
    let mut diffs = 0;
    for i in start..end {
        let d = (frame.reference[i] as i32 - frame.new[i] as i32).abs();
        let mut curdiff = match frame.mask {
            Some(mask) => d * mask[i] as i32 / 255,
            None => d,
        };
        if frame.smartmask_speed != 0 && curdiff > frame.noise {
            if frame.accumulate_smartmask {
                frame.smartmask_buffer[i] += SMARTMASK_SENSITIVITY_INCR;
            }
            if frame.smartmask_final[i] == 0 {
                curdiff = 0;
            }
        }
        if curdiff > frame.noise {
            frame.out[i] = frame.new[i];
            diffs += 1;
        }
    }
    diffs
}

/// Strided pre-check gating the full differ: samples every `step`-th pixel
/// and reports true as soon as enough of them clear the noise floor.
pub fn diff_fast(reference: &[u8], new: &[u8], noise: i32, max_changes: i32) -> bool {
    let n = reference.len();
    let mut step = n / 10_000;
    if step % 2 == 0 {
        step += 1;
    }
    let max = max_changes / (2 * step as i32);

    let mut diffs = 0;
    let mut i = 0;
    while i < n {
        let d = (reference[i] as i32 - new[i] as i32).abs();
        if d > noise {
            diffs += 1;
            if diffs > max {
                return true;
            }
        }
        i += step;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuffers, FrameSize};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn run_kernel(
        kernel: &dyn DiffKernel,
        bufs: &mut FrameBuffers,
        new: &[u8],
        noise: i32,
        smartmask_speed: u8,
        accumulate: bool,
    ) -> i32 {
        let n = bufs.size.motion_size();
        kernel.diff(DiffFrame {
            reference: &bufs.reference[..n],
            new: &new[..n],
            mask: bufs.mask.as_deref(),
            smartmask_final: &bufs.smartmask_final,
            smartmask_buffer: &mut bufs.smartmask_buffer,
            out: &mut bufs.out,
            noise,
            smartmask_speed,
            accumulate_smartmask: accumulate,
        })
    }

    #[test]
    fn single_blip() {
        let size = FrameSize::new(8, 4);
        let mut bufs = FrameBuffers::new(size);
        bufs.reference.fill(128);
        let mut new = vec![128u8; size.yuv420_size()];
        new[17] = 255;
        let diffs = run_kernel(&ScalarDiff, &mut bufs, &new, 50, 0, false);
        assert_eq!(diffs, 1);
        assert_eq!(bufs.out[17], 255);
        assert_eq!(bufs.out.iter().take(32).filter(|&&v| v != 0).count(), 1);
    }

    #[test]
    fn diffs_matches_nonzero_population() {
        let size = FrameSize::new(13, 7);
        let mut rng = StdRng::seed_from_u64(7);
        let mut bufs = FrameBuffers::new(size);
        rng.fill(&mut bufs.reference[..]);
        let mut new = vec![0u8; size.yuv420_size()];
        rng.fill(&mut new[..]);
        // keep luma away from zero so out[i] != 0 exactly where flagged
        for v in new[..size.motion_size()].iter_mut() {
            *v = v.saturating_add(1);
        }
        let diffs = run_kernel(&WideDiff, &mut bufs, &new, 20, 0, false);
        let populated = bufs.out[..size.motion_size()]
            .iter()
            .filter(|&&v| v != 0)
            .count() as i32;
        assert_eq!(diffs, populated);
    }

    #[test]
    fn chroma_stays_neutral() {
        let size = FrameSize::new(8, 4);
        let mut bufs = FrameBuffers::new(size);
        bufs.reference.fill(0);
        let new = vec![255u8; size.yuv420_size()];
        run_kernel(&ScalarDiff, &mut bufs, &new, 10, 0, false);
        assert!(bufs.out[size.motion_size()..].iter().all(|&v| v == NEUTRAL_CHROMA));
    }

    #[test]
    fn scalar_and_wide_are_bit_identical() {
        let size = FrameSize::new(37, 11); // deliberately not a lane multiple
        let mut rng = StdRng::seed_from_u64(42);

        for use_mask in [false, true] {
            for smartmask_speed in [0u8, 5] {
                for accumulate in [false, true] {
                    let mut a = FrameBuffers::new(size);
                    rng.fill(&mut a.reference[..]);
                    let mut new = vec![0u8; size.yuv420_size()];
                    rng.fill(&mut new[..]);
                    if use_mask {
                        let mut mask = vec![0u8; size.motion_size()];
                        rng.fill(&mut mask[..]);
                        a.set_mask(mask);
                    }
                    for v in a.smartmask_final.iter_mut() {
                        *v = if rng.gen_bool(0.3) { 0 } else { 255 };
                    }

                    let mut b = FrameBuffers::new(size);
                    b.reference.copy_from_slice(&a.reference);
                    b.mask = a.mask.clone();
                    b.smartmask_final.copy_from_slice(&a.smartmask_final);

                    let noise = rng.gen_range(0..64);
                    let da =
                        run_kernel(&ScalarDiff, &mut a, &new, noise, smartmask_speed, accumulate);
                    let db =
                        run_kernel(&WideDiff, &mut b, &new, noise, smartmask_speed, accumulate);

                    assert_eq!(da, db);
                    assert_eq!(a.out, b.out);
                    assert_eq!(a.smartmask_buffer, b.smartmask_buffer);
                }
            }
        }
    }

    #[test]
    fn smartmask_blocks_flagged_pixels() {
        let size = FrameSize::new(8, 4);
        let mut bufs = FrameBuffers::new(size);
        bufs.reference.fill(0);
        bufs.smartmask_final.fill(0); // everything blocked
        let new = vec![255u8; size.yuv420_size()];
        let diffs = run_kernel(&ScalarDiff, &mut bufs, &new, 10, 5, true);
        assert_eq!(diffs, 0);
        assert!(bufs.out[..32].iter().all(|&v| v == 0));
        // the accumulator still saw the raw motion
        assert!(bufs.smartmask_buffer.iter().all(|&v| v == 5));
    }

    #[test]
    fn out_implies_open_smartmask() {
        let size = FrameSize::new(16, 8);
        let mut rng = StdRng::seed_from_u64(3);
        let mut bufs = FrameBuffers::new(size);
        rng.fill(&mut bufs.reference[..]);
        for v in bufs.smartmask_final.iter_mut() {
            *v = if rng.gen_bool(0.5) { 0 } else { 255 };
        }
        let mut new = vec![0u8; size.yuv420_size()];
        rng.fill(&mut new[..]);
        run_kernel(&WideDiff, &mut bufs, &new, 5, 5, false);
        for i in 0..size.motion_size() {
            if bufs.out[i] != 0 {
                assert_ne!(bufs.smartmask_final[i], 0);
            }
        }
    }

    #[test]
    fn extreme_noise_levels() {
        let size = FrameSize::new(8, 4);
        let mut bufs = FrameBuffers::new(size);
        bufs.reference.fill(0);
        let new = vec![255u8; size.yuv420_size()];
        // noise 255: |0-255| = 255 is never strictly above 255
        assert_eq!(run_kernel(&ScalarDiff, &mut bufs, &new, 255, 0, false), 0);
        // noise 0: every changed pixel counts
        assert_eq!(run_kernel(&ScalarDiff, &mut bufs, &new, 0, 0, false), 32);
    }

    #[test]
    fn fast_precheck_gates() {
        let n = 32usize;
        let reference = vec![128u8; n];
        let mut new = vec![128u8; n];
        assert!(!diff_fast(&reference, &new, 10, 100));
        for v in new.iter_mut() {
            *v = 255;
        }
        assert!(diff_fast(&reference, &new, 10, 100));
    }
}
