//! Event kinds, writer sinks, and the per-camera event state machine that
//! drives pre-roll, triggering and post-roll.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::frame::{
    FrameSize, IMAGE_MOTION, IMAGE_POSTCAP, IMAGE_PRECAP, IMAGE_SAVE, IMAGE_TRIGGER,
};
use crate::ring::PrecapRing;
use chrono::{DateTime, Local};
use crossbeam_channel::{Sender, TrySendError};
use log::debug;
use serde::Serialize;
use std::sync::Arc;

/// Everything the engine can tell the outside world about. Writer plugins
/// subscribe to these; the engine itself persists nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EventKind {
    FirstMotion,
    Motion,
    ImageDetected,
    ImagemDetected,
    ImageSnapshot,
    Image,
    Imagem,
    Webcam,
    Timelapse,
    TimelapseEnd,
    EndMotion,
    AreaDetected,
    CameraLost,
    Stop,
}

/// One emitted event. The image, when present, is a full YUV 4:2:0 frame
/// at the camera's resolution.
#[derive(Clone)]
pub struct EventMessage {
    pub camera_id: usize,
    pub kind: EventKind,
    pub image: Option<Arc<Vec<u8>>>,
    /// Dimensions of `image` when present.
    pub size: FrameSize,
    pub filename: Option<String>,
    pub timestamp: DateTime<Local>,
}

/// Consumer interface for writer plugins. Implementations must not block
/// the worker; slow writers should buffer or drop.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: EventMessage);
}

/// Sink that forwards events into a bounded channel and drops on
/// backpressure, so a stalled writer can never wedge the capture loop.
pub struct ChannelSink {
    tx: Sender<EventMessage>,
}

impl ChannelSink {
    pub fn new(tx: Sender<EventMessage>) -> Self {
        ChannelSink { tx }
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: EventMessage) {
        if let Err(TrySendError::Full(ev)) = self.tx.try_send(event) {
            debug!(
                "event queue full; dropped {:?} from camera {}",
                ev.kind, ev.camera_id
            );
        }
    }
}

/// Sink discarding everything; handy for tests and benchmarks.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: EventMessage) {}
}

/// What the classification step decided about the frame being filled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    /// The frame carries motion (possibly not yet sustained).
    pub motion: bool,
    /// The frame triggered (or re-armed) an event.
    pub trigger: bool,
}

/// Per-camera event bookkeeping: counters and timers that decide when an
/// event starts, which frames get saved, and when the event closes.
pub struct EventEngine {
    pub event_nr: u32,
    pub prev_event: u32,
    pub detecting_motion: bool,
    pub postcap: i32,
    /// Unix seconds of the last frame flagged for saving.
    pub lasttime: i64,
    /// Unix seconds of the first trigger of the current event.
    pub eventtime: i64,
    /// Damping counter; while non-zero the frame's diffs are forced to 0
    /// (camera settling after a lightswitch or PTZ move).
    pub moved: i32,
    /// Frames still suppressed after worker start.
    pub startup_frames: i32,
    /// Consecutive frames with motion, for micro-lightswitch detection.
    pub lightswitch_framecounter: i32,
    /// Expanded `text_event` string of the current event (%C).
    pub text_event: String,
    /// Event number that already fired an area detection.
    pub area_once: u32,
}

impl EventEngine {
    pub fn new(startup_frames: i32) -> Self {
        EventEngine {
            event_nr: 1,
            prev_event: 0,
            detecting_motion: false,
            postcap: 0,
            lasttime: 0,
            eventtime: 0,
            moved: 0,
            startup_frames,
            lightswitch_framecounter: 0,
            text_event: String::new(),
            area_once: 0,
        }
    }

    /// True while an event is in progress (a trigger has been seen and
    /// the event has not closed yet).
    pub fn in_event(&self) -> bool {
        self.event_nr == self.prev_event
    }

    /// Classifies the slot at `ring.in_idx` and updates the ring and the
    /// engine counters. The slot's diff count and the frame threshold
    /// decide the `MOTION` flag; sustained motion flips the whole ring to
    /// `SAVE` (pre-roll flush) and arms the post-roll counter.
    pub fn classify(
        &mut self,
        ring: &mut PrecapRing,
        threshold: i32,
        minimum_motion_frames: i32,
        post_capture: i32,
        output_all: bool,
    ) -> Classification {
        let mut result = Classification::default();
        let startup = self.startup_frames > 0;

        {
            let slot = ring.current_mut();
            if slot.diffs > threshold {
                slot.set_flag(IMAGE_MOTION);
                self.lightswitch_framecounter += 1;
            } else {
                self.lightswitch_framecounter = 0;
            }
            result.motion = slot.has_flag(IMAGE_MOTION);
        }

        if output_all && !startup {
            self.detecting_motion = true;
            self.postcap = post_capture;
            let slot = ring.current_mut();
            slot.set_flag(IMAGE_TRIGGER | IMAGE_SAVE);
            result.trigger = true;
        } else if result.motion && !startup {
            let sustained =
                ring.count_trailing_motion(minimum_motion_frames as usize)
                    >= minimum_motion_frames as usize;
            if sustained {
                self.detecting_motion = true;
                self.postcap = post_capture;
                ring.current_mut().set_flag(IMAGE_TRIGGER | IMAGE_SAVE);
                ring.mark_all_save();
                result.trigger = true;
            } else if self.postcap > 0 {
                ring.current_mut().set_flag(IMAGE_POSTCAP | IMAGE_SAVE);
                self.postcap -= 1;
            } else {
                ring.current_mut().set_flag(IMAGE_PRECAP);
            }
        } else if self.postcap > 0 {
            ring.current_mut().set_flag(IMAGE_POSTCAP | IMAGE_SAVE);
            self.postcap -= 1;
        } else {
            ring.current_mut().set_flag(IMAGE_PRECAP);
            self.detecting_motion = false;
        }

        let slot = ring.current();
        if slot.has_flag(IMAGE_SAVE) {
            self.lasttime = slot.timestamp.timestamp();
        }
        result
    }

    /// Marks the start of a new event if this trigger frame is its first.
    /// Returns true exactly once per event.
    pub fn begin_event(&mut self, timestamp: i64, text_event: String) -> bool {
        if self.in_event() {
            return false;
        }
        self.prev_event = self.event_nr;
        self.eventtime = timestamp;
        self.text_event = text_event;
        true
    }

    /// Whether the current event should close: the quiet gap expired, the
    /// recording hit its maximum length, or an external request came in.
    pub fn should_close(&self, now: i64, gap: i64, max_movie_time: i64, makemovie: bool) -> bool {
        if !self.in_event() && !makemovie {
            return false;
        }
        if makemovie {
            return true;
        }
        if max_movie_time > 0 && now - self.eventtime >= max_movie_time {
            return true;
        }
        gap > 0 && now - self.lasttime >= gap
    }

    /// Closes the current event and advances the event number.
    pub fn finish_event(&mut self) {
        self.postcap = 0;
        self.event_nr += 1;
        self.lightswitch_framecounter = 0;
        self.text_event.clear();
    }
}
