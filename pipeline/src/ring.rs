//! Pre-capture ring buffer.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::frame::{IMAGE_MOTION, IMAGE_SAVE, RingSlot};

/// Circular buffer of frames sized `pre_capture + minimum_motion_frames`.
///
/// `in_idx` always points at the slot currently being filled; after the
/// frame is classified the worker advances it. When `in_idx` catches
/// `out_idx` the oldest unconsumed slot is dropped.
pub struct PrecapRing {
    slots: Vec<RingSlot>,
    pub in_idx: usize,
    pub out_idx: usize,
}

impl PrecapRing {
    pub fn new(len: usize, yuv_size: usize) -> Self {
        let len = len.max(1);
        PrecapRing {
            slots: (0..len).map(|_| RingSlot::new(yuv_size)).collect(),
            in_idx: 0,
            out_idx: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, idx: usize) -> &RingSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut RingSlot {
        &mut self.slots[idx]
    }

    /// The slot currently being filled.
    pub fn current(&self) -> &RingSlot {
        &self.slots[self.in_idx]
    }

    pub fn current_mut(&mut self) -> &mut RingSlot {
        &mut self.slots[self.in_idx]
    }

    /// Moves `in_idx` to the next slot to fill, dropping the oldest
    /// unconsumed slot if the ring is full.
    pub fn advance_in(&mut self) {
        self.in_idx = (self.in_idx + 1) % self.slots.len();
        if self.in_idx == self.out_idx {
            self.out_idx = (self.out_idx + 1) % self.slots.len();
        }
    }

    pub fn advance_out(&mut self) {
        self.out_idx = (self.out_idx + 1) % self.slots.len();
    }

    /// Flags every slot for saving (pre-roll flush on event trigger).
    pub fn mark_all_save(&mut self) {
        for slot in &mut self.slots {
            slot.set_flag(IMAGE_SAVE);
        }
    }

    /// Counts motion-flagged frames among the trailing `count` slots,
    /// walking backwards from the slot currently being filled.
    pub fn count_trailing_motion(&self, count: usize) -> usize {
        let mut pos = self.in_idx;
        let mut found = 0;
        for _ in 0..count.min(self.slots.len()) {
            if self.slots[pos].flags & IMAGE_MOTION != 0 {
                found += 1;
            }
            pos = if pos == 0 { self.slots.len() - 1 } else { pos - 1 };
        }
        found
    }

    /// Whether `in_idx` sits at the last slot of the smaller of the current
    /// and requested sizes, the only safe moment to regrow or shrink.
    pub fn resize_safe(&self, new_size: usize) -> bool {
        let smallest = new_size.min(self.slots.len());
        smallest == 0 || self.in_idx == smallest - 1
    }

    /// Rebuilds the ring at `new_size`, preserving the first
    /// `min(old, new)` slots. Callers gate this on `resize_safe` and on not
    /// being inside an event.
    pub fn resize(&mut self, new_size: usize, yuv_size: usize) {
        let new_size = new_size.max(1);
        let smallest = new_size.min(self.slots.len());
        let mut slots: Vec<RingSlot> = Vec::with_capacity(new_size);
        slots.extend(self.slots.drain(..smallest));
        while slots.len() < new_size {
            slots.push(RingSlot::new(yuv_size));
        }
        self.slots = slots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_drops_oldest_when_full() {
        let mut ring = PrecapRing::new(3, 48);
        assert_eq!(ring.out_idx, 0);
        ring.advance_in(); // in=1
        ring.advance_in(); // in=2
        ring.advance_in(); // in=0, catches out
        assert_eq!(ring.in_idx, 0);
        assert_eq!(ring.out_idx, 1);
    }

    #[test]
    fn trailing_motion_counts_wrap() {
        let mut ring = PrecapRing::new(4, 48);
        ring.slot_mut(3).set_flag(IMAGE_MOTION);
        ring.slot_mut(0).set_flag(IMAGE_MOTION);
        ring.in_idx = 0;
        assert_eq!(ring.count_trailing_motion(2), 2);
        assert_eq!(ring.count_trailing_motion(1), 1);
    }

    #[test]
    fn resize_mid_idle_preserves_prefix() {
        let mut ring = PrecapRing::new(4, 48);
        for i in 0..4 {
            ring.slot_mut(i).diffs = i as i32 + 1;
        }
        ring.in_idx = 3; // last slot of the smaller buffer
        assert!(ring.resize_safe(7));
        ring.resize(7, 48);
        assert_eq!(ring.len(), 7);
        for i in 0..4 {
            assert_eq!(ring.slot(i).diffs, i as i32 + 1);
        }
        assert_eq!(ring.slot(4).diffs, 0);
        assert!(ring.in_idx < ring.len() && ring.out_idx < ring.len());
    }

    #[test]
    fn resize_not_safe_mid_buffer() {
        let mut ring = PrecapRing::new(4, 48);
        ring.in_idx = 1;
        assert!(!ring.resize_safe(7));
    }
}
