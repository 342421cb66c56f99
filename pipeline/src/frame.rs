//! Per-camera image buffers and ring-slot metadata.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use chrono::{DateTime, Local};
use serde::Serialize;

/// Neutral chroma byte; motion images keep their chroma half-plane at this
/// value so they stay renderable as YUV 4:2:0.
pub const NEUTRAL_CHROMA: u8 = 0x80;

/// Grey luma used for placeholder frames (lost signal, fresh ring slots).
pub const GREY: u8 = 0x80;

/// Ring-slot flags. A slot accumulates flags as the event engine classifies
/// the frame it holds.
pub const IMAGE_MOTION: u16 = 0x01;
pub const IMAGE_TRIGGER: u16 = 0x02;
pub const IMAGE_SAVE: u16 = 0x04;
pub const IMAGE_SAVED: u16 = 0x08;
pub const IMAGE_PRECAP: u16 = 0x10;
pub const IMAGE_POSTCAP: u16 = 0x20;

/// Spatial dimensions of the processed frames (post-rotation).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrameSize {
    pub width: usize,
    pub height: usize,
}

impl FrameSize {
    pub fn new(width: usize, height: usize) -> Self {
        FrameSize { width, height }
    }

    /// Number of luma pixels; the detection algorithms only look at these.
    pub fn motion_size(&self) -> usize {
        self.width * self.height
    }

    /// Full YUV 4:2:0 frame size in bytes.
    pub fn yuv420_size(&self) -> usize {
        self.width * self.height * 3 / 2
    }
}

/// Centroid and bounding box of the located motion.
///
/// `y` is re-centered to the vertical midpoint of the final box, which is
/// expanded further upward than downward so heads stay inside it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Location {
    pub x: i32,
    pub y: i32,
    pub minx: i32,
    pub maxx: i32,
    pub miny: i32,
    pub maxy: i32,
    pub width: i32,
    pub height: i32,
}

/// All pixel buffers owned by one camera worker. Nothing here is shared
/// across threads; the worker has exclusive access for the camera lifetime.
pub struct FrameBuffers {
    pub size: FrameSize,
    /// Adaptive reference frame, luma only.
    pub reference: Vec<u8>,
    /// Last captured frame before any overlays, full YUV.
    pub virgin: Vec<u8>,
    /// Motion image: 0 where quiet, original pixel value where flagged.
    /// Full YUV; chroma kept neutral.
    pub out: Vec<u8>,
    /// Optional fixed mask, multiplicative weight per pixel.
    pub mask: Option<Vec<u8>>,
    /// Learned sensitivity memory, 0..=80 per pixel.
    pub smartmask: Vec<u8>,
    /// Thresholded smartmask consumed by the differ; 0 means blocked.
    pub smartmask_final: Vec<u8>,
    /// Accumulator feeding the smartmask learner.
    pub smartmask_buffer: Vec<i32>,
    /// Dynamic-object age per pixel for the reference model.
    pub ref_dyn: Vec<i32>,
    /// Connected-component ids; bit 15 marks significant components.
    pub labels: Vec<i32>,
    pub labelsize_max: i32,
    pub largest_label: i32,
    pub labelgroup_max: i32,
    pub labels_above: i32,
}

impl FrameBuffers {
    pub fn new(size: FrameSize) -> Self {
        let n = size.motion_size();
        let full = size.yuv420_size();
        FrameBuffers {
            size,
            reference: vec![GREY; n],
            virgin: vec![GREY; full],
            out: vec![0; full],
            mask: None,
            smartmask: vec![0; n],
            smartmask_final: vec![255; n],
            smartmask_buffer: vec![0; n],
            ref_dyn: vec![0; n],
            labels: vec![0; n],
            labelsize_max: 0,
            largest_label: 0,
            labelgroup_max: 0,
            labels_above: 0,
        }
    }

    /// Installs a fixed mask. The caller has already validated dimensions.
    pub fn set_mask(&mut self, mask: Vec<u8>) {
        debug_assert_eq!(mask.len(), self.size.motion_size());
        self.mask = Some(mask);
    }

    /// Luma plane of the last captured frame.
    pub fn virgin_luma(&self) -> &[u8] {
        &self.virgin[..self.size.motion_size()]
    }
}

/// One slot of the pre-capture ring: an owned frame plus everything the
/// event engine decided about it.
#[derive(Clone)]
pub struct RingSlot {
    pub image: Vec<u8>,
    pub timestamp: DateTime<Local>,
    pub shot: i32,
    pub diffs: i32,
    pub flags: u16,
    pub location: Location,
    pub total_labels: i32,
    /// Squared distance of the motion centroid from the frame center, used
    /// by the `center` preview selection mode.
    pub cent_dist: u64,
}

impl RingSlot {
    pub fn new(yuv_size: usize) -> Self {
        RingSlot {
            image: vec![GREY; yuv_size],
            timestamp: Local::now(),
            shot: 0,
            diffs: 0,
            flags: 0,
            location: Location::default(),
            total_labels: 0,
            cent_dist: 0,
        }
    }

    /// Clears per-frame metadata before the slot is filled with a new frame.
    pub fn reset(&mut self, timestamp: DateTime<Local>, shot: i32) {
        self.timestamp = timestamp;
        self.shot = shot;
        self.diffs = 0;
        self.flags = 0;
        self.location = Location::default();
        self.total_labels = 0;
        self.cent_dist = 0;
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u16) {
        self.flags |= flag;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420_sizes() {
        let size = FrameSize::new(8, 4);
        assert_eq!(size.motion_size(), 32);
        assert_eq!(size.yuv420_size(), 48);
    }

    #[test]
    fn fresh_buffers_are_open() {
        let bufs = FrameBuffers::new(FrameSize::new(8, 4));
        assert!(bufs.smartmask_final.iter().all(|&v| v == 255));
        assert!(bufs.smartmask.iter().all(|&v| v == 0));
        assert!(bufs.mask.is_none());
    }

    #[test]
    fn slot_reset_clears_classification() {
        let mut slot = RingSlot::new(48);
        slot.set_flag(IMAGE_MOTION | IMAGE_SAVE);
        slot.diffs = 42;
        slot.reset(Local::now(), 3);
        assert_eq!(slot.flags, 0);
        assert_eq!(slot.diffs, 0);
        assert_eq!(slot.shot, 3);
    }
}
