//! Capture-device abstraction consumed by the camera workers.
//!
//! Real device I/O lives outside the engine; anything that can hand over
//! YUV 4:2:0 frames implements `CaptureDevice`. The crate ships a
//! deterministic synthetic source used by setup mode and the tests.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::frame::FrameSize;
use thiserror::Error;

/// Seconds of failed reads tolerated before the worker substitutes a grey
/// frame and reports the camera lost.
pub const MISSING_FRAMES_TIMEOUT: i64 = 30;

/// Seconds between reopen attempts on a closed device.
pub const CAPTURE_RETRY_SECS: i64 = 10;

/// Pixel layouts a device may deliver. The engine consumes planar
/// YUV 4:2:0 only; drivers convert before handing frames over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Palette {
    Yuv420Planar,
}

/// Negotiated stream format, reported once at device start.
#[derive(Clone, Copy, Debug)]
pub struct CaptureFormat {
    pub palette: Palette,
    pub size: FrameSize,
}

/// Per-frame capture failures. Transient errors keep the worker loop
/// alive; fatal ones close the device; a resolution change makes the
/// worker exit so the supervisor can restart it with fresh buffers.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("transient capture failure: {0}")]
    Transient(String),
    #[error("fatal capture failure: {0}")]
    Fatal(String),
    #[error("camera resolution changed to {width}x{height}")]
    ResolutionChanged { width: usize, height: usize },
}

/// A source of raw frames for one camera.
pub trait CaptureDevice: Send {
    /// Opens the device and reports the negotiated format.
    fn start(&mut self) -> Result<CaptureFormat, CaptureError>;

    /// Fills `buf` (sized `W*H*3/2`) with the next frame.
    fn next(&mut self, buf: &mut [u8]) -> Result<(), CaptureError>;

    fn close(&mut self);
}

/// Deterministic test source: a flat grey scene with a bright block
/// patrolling horizontally. Useful for exercising the whole detection
/// path without hardware.
pub struct SyntheticCapture {
    size: FrameSize,
    frame_nr: u64,
    /// Frames per horizontal step; higher values mean slower motion.
    step_every: u64,
    block: usize,
    open: bool,
}

impl SyntheticCapture {
    pub fn new(size: FrameSize) -> Self {
        SyntheticCapture {
            size,
            frame_nr: 0,
            step_every: 1,
            block: (size.width / 8).max(1),
            open: false,
        }
    }

    pub fn with_step_every(mut self, step_every: u64) -> Self {
        self.step_every = step_every.max(1);
        self
    }
}

impl CaptureDevice for SyntheticCapture {
    fn start(&mut self) -> Result<CaptureFormat, CaptureError> {
        self.open = true;
        Ok(CaptureFormat {
            palette: Palette::Yuv420Planar,
            size: self.size,
        })
    }

    fn next(&mut self, buf: &mut [u8]) -> Result<(), CaptureError> {
        if !self.open {
            return Err(CaptureError::Transient("device not started".into()));
        }
        let expected = self.size.yuv420_size();
        if buf.len() != expected {
            return Err(CaptureError::Fatal(format!(
                "frame buffer is {} bytes, expected {expected}",
                buf.len()
            )));
        }
        let n = self.size.motion_size();
        buf[..n].fill(0x40);
        buf[n..].fill(0x80);

        let span = self.size.width.saturating_sub(self.block).max(1);
        let x0 = ((self.frame_nr / self.step_every) as usize) % span;
        let y0 = self.size.height / 3;
        for y in y0..(y0 + self.block).min(self.size.height) {
            for x in x0..x0 + self.block {
                buf[y * self.size.width + x] = 0xE0;
            }
        }
        self.frame_nr += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_frames_move() {
        let size = FrameSize::new(64, 32);
        let mut dev = SyntheticCapture::new(size);
        dev.start().unwrap();
        let mut a = vec![0u8; size.yuv420_size()];
        let mut b = vec![0u8; size.yuv420_size()];
        dev.next(&mut a).unwrap();
        dev.next(&mut b).unwrap();
        assert_ne!(a, b);
        assert!(a[size.motion_size()..].iter().all(|&v| v == 0x80));
    }

    #[test]
    fn wrong_buffer_size_is_fatal() {
        let mut dev = SyntheticCapture::new(FrameSize::new(64, 32));
        dev.start().unwrap();
        let mut short = vec![0u8; 10];
        assert!(matches!(
            dev.next(&mut short),
            Err(CaptureError::Fatal(_))
        ));
    }

    #[test]
    fn closed_device_fails_transiently() {
        let size = FrameSize::new(64, 32);
        let mut dev = SyntheticCapture::new(size);
        dev.start().unwrap();
        dev.close();
        let mut buf = vec![0u8; size.yuv420_size()];
        assert!(matches!(
            dev.next(&mut buf),
            Err(CaptureError::Transient(_))
        ));
    }
}
