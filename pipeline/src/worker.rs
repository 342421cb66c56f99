//! Per-camera motion worker: the frame-pacing loop that drives capture,
//! detection, tuning, the reference model and the event engine.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::alg::despeckle;
use crate::alg::differ::{DiffFrame, DiffKernel, default_kernel, diff_fast};
use crate::alg::label::DEFAULT_STACK_LIMIT;
use crate::alg::locate::locate_center_size;
use crate::alg::morph::{DespeckleOp, parse_despeckle};
use crate::alg::reference::{reset_reference, update_reference};
use crate::alg::smartmask::{clear_smartmask, tune_smartmask};
use crate::alg::suppress::{lightswitch, switchfilter};
use crate::alg::tune::{ThresholdTuner, noise_tune};
use crate::capture::{CAPTURE_RETRY_SECS, CaptureDevice, CaptureError, MISSING_FRAMES_TIMEOUT};
use crate::config::{CameraConfig, PreviewMode, TimelapseMode};
use crate::error::EngineError;
use crate::event::{EventEngine, EventKind, EventMessage, EventSink};
use crate::frame::{
    FrameBuffers, FrameSize, GREY, IMAGE_MOTION, IMAGE_SAVE, IMAGE_SAVED, IMAGE_TRIGGER, RingSlot,
};
use crate::mask::load_mask;
use crate::pathspec::{SpecContext, expand};
use crate::ring::PrecapRing;
use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use log::{debug, error, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Watchdog preset written at the top of every loop pass; the supervisor
/// decrements it once a second.
pub const WATCHDOG_TMO: i32 = 30;

/// Watchdog value signalling that the worker is gone for good.
pub const WATCHDOG_OFF: i32 = -127;

/// Watchdog level at which the supervisor gives up on a graceful stop.
pub const WATCHDOG_KILL: i32 = -60;

/// Ring slots drained to the writers on an ordinary frame; event close
/// flushes everything.
const RING_DRAIN_PER_FRAME: usize = 2;

/// Control and liveness flags for one worker. Single-word atomics: the
/// supervisor reads them without locking and tolerates one tick of
/// staleness.
pub struct WorkerFlags {
    pub running: AtomicBool,
    pub finish: AtomicBool,
    pub restart: AtomicBool,
    pub makemovie: AtomicBool,
    pub pause: AtomicBool,
    pub snapshot: AtomicBool,
    pub watchdog: AtomicI32,
}

impl Default for WorkerFlags {
    fn default() -> Self {
        WorkerFlags {
            running: AtomicBool::new(false),
            finish: AtomicBool::new(false),
            restart: AtomicBool::new(true),
            makemovie: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            snapshot: AtomicBool::new(false),
            watchdog: AtomicI32::new(WATCHDOG_TMO),
        }
    }
}

/// Rolling window over inter-frame intervals (microseconds) used to steer
/// the pacing sleep toward the configured frame rate.
pub struct RollingAverage {
    samples: Vec<i64>,
    next: usize,
}

impl RollingAverage {
    /// Presets the whole window so the average starts at the target.
    pub fn new(limit: usize, preset: i64) -> Self {
        RollingAverage {
            samples: vec![preset; limit.max(1)],
            next: 0,
        }
    }

    pub fn push(&mut self, sample: i64) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % self.samples.len();
    }

    pub fn average(&self) -> i64 {
        self.samples.iter().sum::<i64>() / self.samples.len() as i64
    }
}

/// One camera's worker. Owns every image buffer exclusively; nothing in
/// here is shared with other cameras.
pub struct MotionWorker {
    cfg: CameraConfig,
    flags: Arc<WorkerFlags>,
    sink: Arc<dyn EventSink>,
    device: Box<dyn CaptureDevice>,
}

impl MotionWorker {
    pub fn new(
        cfg: CameraConfig,
        flags: Arc<WorkerFlags>,
        sink: Arc<dyn EventSink>,
        device: Box<dyn CaptureDevice>,
    ) -> Self {
        MotionWorker {
            cfg,
            flags,
            sink,
            device,
        }
    }

    /// Runs the worker to completion. Exits when `finish` is observed or
    /// the device reports a resolution change (the supervisor restarts the
    /// worker with fresh buffers in that case).
    pub fn run(mut self) {
        self.flags.running.store(true, Ordering::SeqCst);
        info!("[cam {}] worker starting", self.cfg.camera_id);

        if let Err(e) = self.run_loop() {
            error!("[cam {}] worker failed: {e}", self.cfg.camera_id);
        }

        self.device.close();
        self.sink.on_event(EventMessage {
            camera_id: self.cfg.camera_id,
            kind: EventKind::Stop,
            image: None,
            size: FrameSize::new(self.cfg.width, self.cfg.height),
            filename: None,
            timestamp: Local::now(),
        });
        info!("[cam {}] worker exiting", self.cfg.camera_id);

        if !self.flags.restart.load(Ordering::SeqCst) {
            self.flags.watchdog.store(WATCHDOG_OFF, Ordering::SeqCst);
        }
        self.flags.running.store(false, Ordering::SeqCst);
        self.flags.finish.store(false, Ordering::SeqCst);
    }

    fn run_loop(&mut self) -> Result<(), EngineError> {
        // Open the device; an initial failure is not fatal, the loop keeps
        // retrying while feeding grey frames.
        let (mut device_open, size) = match self.device.start() {
            Ok(format) => (true, format.size),
            Err(e) => {
                error!("[cam {}] cannot open capture device: {e}", self.cfg.camera_id);
                (false, FrameSize::new(self.cfg.width, self.cfg.height))
            }
        };

        let mut session = Session::new(
            self.cfg.clone(),
            size,
            self.sink.clone(),
            self.flags.clone(),
        )?;

        let required_frame_time = 1_000_000i64 / self.cfg.frame_limit as i64;
        let mut rolling = RollingAverage::new(
            (10 * self.cfg.frame_limit) as usize,
            required_frame_time,
        );
        let epoch = Instant::now();
        let mut timebefore: i64 = 0;
        let mut first_pass = true;
        let mut first_frame = true;
        let mut missing_frame_counter: i64 = 0;
        let mut lost_connection = false;
        // primed so the very first second captures a frame
        let mut minimum_frame_downcounter = 1;

        while !self.flags.finish.load(Ordering::SeqCst)
            || self.flags.makemovie.load(Ordering::SeqCst)
        {
            self.flags.watchdog.store(WATCHDOG_TMO, Ordering::SeqCst);

            let loop_start = Instant::now();
            let timenow = epoch.elapsed().as_micros() as i64;
            let now = Local::now();
            let get_image = session.tick_second(now, &mut minimum_frame_downcounter);

            if get_image {
                session.begin_frame(now);

                // Closed device: retry every few seconds, once per second.
                if !device_open
                    && now.timestamp() % CAPTURE_RETRY_SECS == 0
                    && session.shots == 0
                {
                    info!("[cam {}] retrying capture device", self.cfg.camera_id);
                    match self.device.start() {
                        Ok(format) => {
                            if format.size != session.size {
                                info!(
                                    "[cam {}] capture resolution changed, restarting worker",
                                    self.cfg.camera_id
                                );
                                return Ok(());
                            }
                            device_open = true;
                        }
                        Err(e) => debug!("[cam {}] reopen failed: {e}", self.cfg.camera_id),
                    }
                }

                let rc = if device_open {
                    self.device.next(&mut session.ring.current_mut().image)
                } else {
                    Err(CaptureError::Transient("device closed".into()))
                };

                match rc {
                    Ok(()) => {
                        if missing_frame_counter
                            >= MISSING_FRAMES_TIMEOUT * self.cfg.frame_limit as i64
                        {
                            info!("[cam {}] video signal re-acquired", self.cfg.camera_id);
                        }
                        missing_frame_counter = 0;
                        lost_connection = false;
                        session.store_virgin();
                        if first_frame {
                            // seed the reference model from the first frame
                            reset_reference(&mut session.bufs);
                            first_frame = false;
                        }
                    }
                    Err(CaptureError::ResolutionChanged { width, height }) => {
                        info!(
                            "[cam {}] resolution changed to {width}x{height}, restarting worker",
                            self.cfg.camera_id
                        );
                        return Ok(());
                    }
                    Err(CaptureError::Fatal(reason)) => {
                        error!(
                            "[cam {}] fatal capture error, closing device: {reason}",
                            self.cfg.camera_id
                        );
                        self.device.close();
                        device_open = false;
                        lost_connection = true;
                        session.reuse_virgin();
                    }
                    Err(CaptureError::Transient(reason)) => {
                        missing_frame_counter += 1;
                        let horizon = MISSING_FRAMES_TIMEOUT * self.cfg.frame_limit as i64;
                        if device_open && missing_frame_counter < horizon {
                            // duplicate the last good frame silently
                            session.reuse_virgin();
                        } else {
                            lost_connection = true;
                            session.grey_frame();
                            if missing_frame_counter == horizon {
                                error!(
                                    "[cam {}] video signal lost ({reason}), feeding grey frames",
                                    self.cfg.camera_id
                                );
                                session.emit(EventKind::CameraLost, None, None, now);
                            }
                            if device_open && missing_frame_counter == horizon * 4 {
                                error!(
                                    "[cam {}] video signal still lost, closing device",
                                    self.cfg.camera_id
                                );
                                self.device.close();
                                device_open = false;
                            }
                        }
                    }
                }

                session.process_frame(lost_connection, now);
            }

            session.snapshot_and_timelapse(now);
            session.stream_current(get_image);

            // Pacing: steer the sleep with the rolling inter-frame average.
            if first_pass {
                first_pass = false;
            } else {
                rolling.push(timenow - timebefore);
            }
            timebefore = timenow;

            let elapsed = loop_start.elapsed().as_micros() as i64;
            let mut frame_delay =
                required_frame_time - elapsed - (rolling.average() - required_frame_time);
            if frame_delay > 0 {
                frame_delay = frame_delay.min(required_frame_time);
                thread::sleep(Duration::from_micros(frame_delay as u64));
            }
        }

        // Finishing: flush whatever the ring still holds.
        session.flush_ring();
        Ok(())
    }
}

/// All mutable per-camera runtime state. Built once per worker run and
/// torn down with it; a restart (resolution change) rebuilds everything.
struct Session {
    cfg: CameraConfig,
    size: FrameSize,
    bufs: FrameBuffers,
    ring: PrecapRing,
    preview: RingSlot,
    engine: EventEngine,
    kernel: Box<dyn DiffKernel>,
    despeckle_ops: Vec<DespeckleOp>,
    threshold_tuner: ThresholdTuner,
    sink: Arc<dyn EventSink>,
    flags: Arc<WorkerFlags>,

    noise: i32,
    threshold: i32,
    /// Measured frames per second over the previous wall-clock second.
    lastrate: i32,
    /// Frame index within the current second.
    shots: i32,
    last_frame_secs: i64,
    prev_secs: i64,

    smartmask_speed: u8,
    smartmask_count: i32,
    smartmask_ratio: i32,
    smartmask_lastrate: i32,

    ref_frame_limit: i32,
    previous_diffs: i32,
    previous_location: (i32, i32),
    olddiffs: i32,
}

impl Session {
    fn new(
        cfg: CameraConfig,
        size: FrameSize,
        sink: Arc<dyn EventSink>,
        flags: Arc<WorkerFlags>,
    ) -> Result<Self, EngineError> {
        let mut bufs = FrameBuffers::new(size);

        if let Some(path) = &cfg.mask_file {
            match load_mask(path, size) {
                Ok(mask) => bufs.set_mask(mask),
                Err(e) => {
                    // mask trouble disables the feature for the session
                    error!("[cam {}] {e}; running without mask", cfg.camera_id);
                }
            }
        }

        let despeckle_ops = parse_despeckle(&cfg.despeckle)?;
        let ring = PrecapRing::new(cfg.ring_size(), size.yuv420_size());
        let engine = EventEngine::new(2 * cfg.frame_limit);

        Ok(Session {
            noise: cfg.noise,
            threshold: cfg.max_changes,
            lastrate: cfg.frame_limit.min(25),
            shots: 0,
            last_frame_secs: 0,
            prev_secs: 0,
            smartmask_speed: cfg.smart_mask_speed,
            smartmask_count: 20,
            smartmask_ratio: 5 * cfg.frame_limit.min(25) * (11 - cfg.smart_mask_speed as i32),
            smartmask_lastrate: 0,
            ref_frame_limit: 0,
            previous_diffs: 0,
            previous_location: (0, 0),
            olddiffs: 0,
            preview: RingSlot::new(size.yuv420_size()),
            threshold_tuner: ThresholdTuner::new(),
            kernel: default_kernel(),
            despeckle_ops,
            engine,
            ring,
            bufs,
            sink,
            flags,
            cfg,
            size,
        })
    }

    /// Once-per-second bookkeeping: updates the measured rate, re-checks
    /// config-driven parameters, and decides whether this pass captures a
    /// frame at all (sub-1fps operation via `minimum_frame_time`).
    fn tick_second(&mut self, now: DateTime<Local>, min_frame_downcounter: &mut i32) -> bool {
        let secs = now.timestamp();
        let mut get_image = self.cfg.minimum_frame_time == 0;

        if self.last_frame_secs != secs {
            self.lastrate = self.shots + 1;
            self.shots = -1;
            self.last_frame_secs = secs;

            if self.cfg.minimum_frame_time > 0 {
                *min_frame_downcounter -= 1;
                if *min_frame_downcounter <= 0 {
                    *min_frame_downcounter = self.cfg.minimum_frame_time;
                    get_image = true;
                }
            }
            self.refresh_per_second();
        }
        self.shots += 1;

        if self.engine.startup_frames > 0 {
            self.engine.startup_frames -= 1;
        }
        get_image
    }

    /// Applies config values that may be toggled while running: smartmask
    /// speed and the tuner fallbacks.
    fn refresh_per_second(&mut self) {
        if self.cfg.smart_mask_speed != self.smartmask_speed
            || self.smartmask_lastrate != self.lastrate
        {
            if self.cfg.smart_mask_speed == 0 {
                clear_smartmask(&mut self.bufs);
            }
            self.smartmask_lastrate = self.lastrate;
            self.smartmask_speed = self.cfg.smart_mask_speed;
            self.smartmask_ratio =
                5 * self.lastrate.max(1) * (11 - self.smartmask_speed as i32);
        }
    }

    /// Advances the ring onto a fresh slot and re-checks the ring size
    /// against the configuration.
    fn begin_frame(&mut self, now: DateTime<Local>) {
        let wanted = self.cfg.ring_size();
        if self.ring.len() != wanted
            && !self.engine.in_event()
            && self.ring.resize_safe(wanted)
        {
            info!(
                "[cam {}] resizing pre-capture buffer to {wanted} slots",
                self.cfg.camera_id
            );
            self.ring.resize(wanted, self.size.yuv420_size());
        }

        self.ring.advance_in();
        let shots = self.shots;
        self.ring.current_mut().reset(now, shots);
    }

    /// Saves the newly captured frame as the virgin copy consulted by the
    /// detection algorithms.
    fn store_virgin(&mut self) {
        self.bufs.virgin.copy_from_slice(&self.ring.current().image);
    }

    /// Re-feeds the last good frame after a short capture hiccup.
    fn reuse_virgin(&mut self) {
        let virgin = &self.bufs.virgin;
        self.ring.current_mut().image.copy_from_slice(virgin);
    }

    /// Substitutes a flat grey frame once the signal is declared lost.
    fn grey_frame(&mut self) {
        self.ring.current_mut().image.fill(GREY);
        self.bufs.virgin.fill(GREY);
    }

    /// The per-frame pipeline after capture: differencing, suppressors,
    /// despeckle, tuners, locator, reference update and event control.
    fn process_frame(&mut self, lost_connection: bool, now: DateTime<Local>) {
        self.detect(lost_connection);
        self.tune_frame();
        self.locate_frame();
        self.update_reference_frame();
        self.event_control(now);
        self.setup_report();
    }

    fn detect(&mut self, lost_connection: bool) {
        let n = self.size.motion_size();
        let paused = self.flags.pause.load(Ordering::SeqCst);
        let mut diffs = 0;

        if self.threshold > 0 && !paused {
            // The strided pre-check only gates the full differ while no
            // motion is being tracked; setup mode always runs the full one.
            let run_full = self.engine.detecting_motion
                || self.cfg.setup_mode
                || diff_fast(
                    &self.bufs.reference,
                    &self.bufs.virgin[..n],
                    self.noise,
                    self.cfg.max_changes,
                );
            if run_full {
                diffs = self.kernel.diff(DiffFrame {
                    reference: &self.bufs.reference,
                    new: &self.bufs.virgin[..n],
                    mask: self.bufs.mask.as_deref(),
                    smartmask_final: &self.bufs.smartmask_final,
                    smartmask_buffer: &mut self.bufs.smartmask_buffer,
                    out: &mut self.bufs.out,
                    noise: self.noise,
                    smartmask_speed: self.smartmask_speed,
                    accumulate_smartmask: !self.engine.in_event(),
                });
            }

            // Lightswitch first; when it fires the switchfilter never runs.
            let mut lightswitch_fired = false;
            if self.cfg.lightswitch > 0
                && !lost_connection
                && lightswitch(diffs, n, self.cfg.lightswitch)
            {
                info!("[cam {}] lightswitch detected", self.cfg.camera_id);
                if self.engine.moved < 5 {
                    self.engine.moved = 5;
                }
                diffs = 0;
                reset_reference(&mut self.bufs);
                lightswitch_fired = true;
            }
            if !lightswitch_fired && self.cfg.switchfilter && diffs > self.threshold {
                let filtered = switchfilter(&self.bufs, diffs);
                if filtered <= self.threshold {
                    info!("[cam {}] switchfilter suppressed frame", self.cfg.camera_id);
                    diffs = 0;
                }
            }

            let mut total_labels = 0;
            self.olddiffs = diffs;
            if !self.despeckle_ops.is_empty() && diffs > 0 {
                diffs = despeckle(
                    &mut self.bufs,
                    &self.despeckle_ops,
                    self.threshold,
                    diffs,
                    DEFAULT_STACK_LIMIT,
                    &mut total_labels,
                );
            } else if self.bufs.labelsize_max != 0 {
                self.bufs.labelsize_max = 0;
            }
            self.ring.current_mut().total_labels = total_labels;
        } else if !self.cfg.setup_mode {
            diffs = 0;
        }

        self.ring.current_mut().diffs = diffs;
    }

    fn tune_frame(&mut self) {
        // Smartmask learner cadence, active only between events.
        if self.smartmask_speed != 0 && !self.engine.in_event() {
            self.smartmask_count -= 1;
            if self.smartmask_count <= 0 {
                tune_smartmask(&mut self.bufs, self.lastrate.max(1), self.smartmask_speed);
                self.smartmask_count = self.smartmask_ratio;
            }
        }

        // Camera-motion damping (lightswitch settle, PTZ moves).
        if self.engine.moved > 0 {
            self.engine.moved -= 1;
            self.ring.current_mut().diffs = 0;
        }

        let diffs = self.ring.current().diffs;
        if self.cfg.noise_tune && self.shots == 0 {
            if !self.engine.detecting_motion && diffs <= self.threshold {
                let n = self.size.motion_size();
                noise_tune(&self.bufs, &self.bufs.virgin[..n], &mut self.noise);
            }
        } else if !self.cfg.noise_tune {
            self.noise = self.cfg.noise;
        }

        if self.cfg.threshold_tune {
            self.threshold_tuner.tune(
                &mut self.threshold,
                diffs,
                self.engine.detecting_motion,
                self.cfg.max_changes,
            );
        } else {
            self.threshold = self.cfg.max_changes;
        }
    }

    fn locate_frame(&mut self) {
        if self.ring.current().diffs > self.threshold {
            let location = locate_center_size(&self.bufs, self.cfg.bbox_expand);
            self.ring.current_mut().location = location;
        }
    }

    /// Reference model update, rate-limited to roughly three runs per
    /// second. A micro-lightswitch (stable diffs and centroid inside a
    /// two-second window) resets the model instead and discards the frame.
    fn update_reference_frame(&mut self) {
        self.ref_frame_limit += 1;
        if self.ref_frame_limit < self.lastrate / 3 {
            return;
        }
        self.ref_frame_limit = 0;

        let diffs = self.ring.current().diffs;
        let location = self.ring.current().location;
        let micro = diffs > self.threshold
            && self.engine.lightswitch_framecounter < self.lastrate * 2
            && (self.previous_diffs - diffs).abs() < self.previous_diffs / 15
            && (location.x - self.previous_location.0).abs() <= self.size.width as i32 / 150
            && (location.y - self.previous_location.1).abs() <= self.size.height as i32 / 150;

        if micro {
            debug!("[cam {}] micro-lightswitch, resetting reference", self.cfg.camera_id);
            reset_reference(&mut self.bufs);
            self.ring.current_mut().diffs = 0;
            self.engine.lightswitch_framecounter = 0;
        } else {
            update_reference(&mut self.bufs, self.noise, self.lastrate);
        }

        self.previous_diffs = self.ring.current().diffs;
        self.previous_location = (location.x, location.y);
    }

    fn event_control(&mut self, now: DateTime<Local>) {
        let class = self.engine.classify(
            &mut self.ring,
            self.threshold,
            self.cfg.minimum_motion_frames,
            self.cfg.post_capture,
            self.cfg.output_all,
        );

        if class.motion || class.trigger {
            self.motion_detected(now);
        }
        self.area_detect(now);

        // Event termination: quiet gap, maximum length, or external ask.
        let makemovie = self.flags.makemovie.load(Ordering::SeqCst);
        if self
            .engine
            .should_close(now.timestamp(), self.cfg.gap, self.cfg.max_movie_time, makemovie)
        {
            self.flush_ring();
            self.save_preview(now);
            self.emit(EventKind::EndMotion, None, None, now);
            if self.cfg.setup_mode {
                info!("[cam {}] end of event {}", self.cfg.camera_id, self.engine.event_nr);
            }
            self.engine.finish_event();
            self.flags.makemovie.store(false, Ordering::SeqCst);
        }

        self.drain_ring(RING_DRAIN_PER_FRAME);
    }

    /// Side effects of a frame carrying motion: preview bookkeeping,
    /// event-start notifications and the motion-image feed.
    fn motion_detected(&mut self, now: DateTime<Local>) {
        if self.cfg.output_normal == PreviewMode::Center {
            let slot = self.ring.current_mut();
            let dx = (self.size.width as i32 / 2 - slot.location.x).unsigned_abs() as u64;
            let dy = (self.size.height as i32 / 2 - slot.location.y).unsigned_abs() as u64;
            slot.cent_dist = dx * dx + dy * dy;
        }

        if self.ring.current().has_flag(IMAGE_TRIGGER) {
            let text = {
                let ctx = self.spec_context("");
                expand(&self.cfg.text_event, &now, &ctx)
            };
            if self.engine.begin_event(now.timestamp(), text) {
                if self.cfg.setup_mode {
                    info!(
                        "[cam {}] motion detected, starting event {}",
                        self.cfg.camera_id, self.engine.event_nr
                    );
                }
                let image = Arc::new(self.ring.current().image.clone());
                self.emit(EventKind::FirstMotion, Some(image), None, now);
                if matches!(
                    self.cfg.output_normal,
                    PreviewMode::First | PreviewMode::Best | PreviewMode::Center
                ) {
                    self.save_as_preview(self.ring.in_idx);
                }
            }
            self.emit(EventKind::Motion, None, None, now);
        }

        // Motion-image feed, once per second worth of frames.
        if self.ring.current().shot < self.cfg.frame_limit {
            let out = Arc::new(self.bufs.out.clone());
            self.emit(EventKind::ImagemDetected, Some(out), None, now);
        }
    }

    /// `area_detect` cells are a 3x3 grid numbered 1..9 row-major; the
    /// event fires once per event when a trigger centroid lands inside a
    /// configured cell.
    fn area_detect(&mut self, now: DateTime<Local>) {
        if self.cfg.area_detect.is_empty()
            || self.engine.area_once == self.engine.event_nr
            || !self.ring.current().has_flag(IMAGE_TRIGGER)
        {
            return;
        }
        let (w3, h3) = (self.size.width as i32 / 3, self.size.height as i32 / 3);
        let loc = self.ring.current().location;
        for c in self.cfg.area_detect.chars() {
            let Some(z) = c.to_digit(10).map(|d| d as i32 - 1) else {
                continue;
            };
            if !(0..9).contains(&z) {
                continue;
            }
            let (minx, miny) = ((z % 3) * w3, (z / 3) * h3);
            let (maxx, maxy) = (
                if z % 3 == 2 { self.size.width as i32 } else { minx + w3 },
                if z / 3 == 2 { self.size.height as i32 } else { miny + h3 },
            );
            if loc.x > minx && loc.x < maxx && loc.y > miny && loc.y < maxy {
                self.emit(EventKind::AreaDetected, None, None, now);
                self.engine.area_once = self.engine.event_nr;
                debug!("[cam {}] motion in area {}", self.cfg.camera_id, z + 1);
                break;
            }
        }
    }

    /// Copies a ring slot into the preview buffer.
    fn save_as_preview(&mut self, idx: usize) {
        let slot = self.ring.slot(idx);
        self.preview.image.copy_from_slice(&slot.image);
        self.preview.timestamp = slot.timestamp;
        self.preview.shot = slot.shot;
        self.preview.flags = slot.flags;
        self.preview.location = slot.location;
        self.preview.total_labels = slot.total_labels;
        self.preview.cent_dist = slot.cent_dist;
        // a zero-diff preview would never be written out at event end
        self.preview.diffs = slot.diffs.max(1);
    }

    /// Emits the pending preview shot at event end.
    fn save_preview(&mut self, now: DateTime<Local>) {
        if self.preview.diffs == 0 {
            return;
        }
        let filename = {
            let mut ctx = self.spec_context(&self.engine.text_event);
            ctx.shot = self.preview.shot;
            ctx.diffs = self.preview.diffs;
            expand(&self.cfg.image_path, &self.preview.timestamp.clone(), &ctx)
        };
        let image = Arc::new(self.preview.image.clone());
        self.emit(EventKind::Image, Some(image), Some(filename), now);
        self.preview.diffs = 0;
    }

    /// Sends saved-but-unwritten slots to the writers, oldest first.
    fn drain_ring(&mut self, max_images: usize) {
        let mut remaining = max_images;
        loop {
            let out_idx = self.ring.out_idx;
            {
                let slot = self.ring.slot(out_idx);
                if slot.flags & (IMAGE_SAVE | IMAGE_SAVED) != IMAGE_SAVE {
                    break;
                }
            }

            if self.ring.slot(out_idx).shot < self.cfg.frame_limit {
                let (filename, image, timestamp) = {
                    let slot = self.ring.slot(out_idx);
                    let mut ctx = self.spec_context(&self.engine.text_event);
                    ctx.shot = slot.shot;
                    ctx.diffs = slot.diffs;
                    ctx.centroid_x = slot.location.x;
                    ctx.centroid_y = slot.location.y;
                    ctx.total_labels = slot.total_labels;
                    (
                        expand(&self.cfg.image_path, &slot.timestamp, &ctx),
                        Arc::new(slot.image.clone()),
                        slot.timestamp,
                    )
                };
                self.sink.on_event(EventMessage {
                    camera_id: self.cfg.camera_id,
                    kind: EventKind::ImageDetected,
                    image: Some(image),
                    size: self.size,
                    filename: Some(filename),
                    timestamp,
                });
            }

            self.ring.slot_mut(out_idx).set_flag(IMAGE_SAVED);

            // Preview upgrades only consider frames that carried motion.
            if self.ring.slot(out_idx).has_flag(IMAGE_MOTION) {
                match self.cfg.output_normal {
                    PreviewMode::Best
                        if self.ring.slot(out_idx).diffs > self.preview.diffs =>
                    {
                        self.save_as_preview(out_idx)
                    }
                    PreviewMode::Center
                        if self.ring.slot(out_idx).cent_dist < self.preview.cent_dist =>
                    {
                        self.save_as_preview(out_idx)
                    }
                    _ => {}
                }
            }

            self.ring.advance_out();
            if self.ring.out_idx == self.ring.in_idx {
                break;
            }
            if remaining != usize::MAX {
                remaining -= 1;
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    fn flush_ring(&mut self) {
        self.drain_ring(usize::MAX);
    }

    /// Snapshot and timelapse cadences, evaluated once per second.
    fn snapshot_and_timelapse(&mut self, now: DateTime<Local>) {
        let secs = now.timestamp();
        let prev = self.prev_secs;
        self.prev_secs = secs;
        if prev == 0 {
            return;
        }

        let manual = self.flags.snapshot.swap(false, Ordering::SeqCst);
        if (self.cfg.snapshot_interval > 0
            && self.shots == 0
            && secs % self.cfg.snapshot_interval <= prev % self.cfg.snapshot_interval
            && secs != prev)
            || manual
        {
            let filename = {
                let ctx = self.spec_context(&self.engine.text_event);
                expand(&self.cfg.snapshot_path, &now, &ctx)
            };
            let image = Arc::new(self.ring.current().image.clone());
            self.emit(EventKind::ImageSnapshot, Some(image), Some(filename), now);
        }

        if self.cfg.timelapse > 0 {
            if now.minute() == 0 && self.shots == 0 && secs % 60 < prev % 60 {
                let rollover = match self.cfg.timelapse_mode {
                    TimelapseMode::Manual => false,
                    TimelapseMode::Daily => now.hour() == 0,
                    TimelapseMode::Hourly => true,
                    TimelapseMode::WeeklySunday => {
                        now.weekday() == Weekday::Sun && now.hour() == 0
                    }
                    TimelapseMode::WeeklyMonday => {
                        now.weekday() == Weekday::Mon && now.hour() == 0
                    }
                    TimelapseMode::Monthly => now.day() == 1 && now.hour() == 0,
                };
                if rollover {
                    self.emit(EventKind::TimelapseEnd, None, None, now);
                }
            }
            if self.shots == 0
                && secs % self.cfg.timelapse <= prev % self.cfg.timelapse
                && secs != prev
            {
                let image = Arc::new(self.ring.current().image.clone());
                self.emit(EventKind::Timelapse, Some(image), None, now);
            }
        }
    }

    /// Per-frame stream feed: the latest image (or the motion image in
    /// setup mode) plus the motion image pipe.
    fn stream_current(&mut self, fresh_frame: bool) {
        if !fresh_frame {
            return;
        }
        let now = self.ring.current().timestamp;
        if self.cfg.setup_mode {
            let out = Arc::new(self.bufs.out.clone());
            self.emit(EventKind::Image, Some(out.clone()), None, now);
            self.emit(EventKind::Webcam, Some(out), None, now);
        } else {
            let image = Arc::new(self.ring.current().image.clone());
            self.emit(EventKind::Image, Some(image.clone()), None, now);
            if !self.cfg.webcam_motion || self.shots == 1 {
                self.emit(EventKind::Webcam, Some(image), None, now);
            }
        }
        let out = Arc::new(self.bufs.out.clone());
        self.emit(EventKind::Imagem, Some(out), None, now);
    }

    fn setup_report(&self) {
        if !self.cfg.setup_mode {
            return;
        }
        let slot = self.ring.current();
        let mut msg = if self.despeckle_ops.is_empty() {
            format!("changes: {}", slot.diffs)
        } else {
            format!(
                "raw changes: {} - changes after '{}': {}",
                self.olddiffs, self.cfg.despeckle, slot.diffs
            )
        };
        if self.despeckle_ops.contains(&DespeckleOp::Label) {
            msg.push_str(&format!(" - labels: {}", slot.total_labels));
        }
        if self.cfg.noise_tune {
            msg.push_str(&format!(" - noise level: {}", self.noise));
        }
        if self.cfg.threshold_tune {
            msg.push_str(&format!(" - threshold: {}", self.threshold));
        }
        info!("[cam {}] {msg}", self.cfg.camera_id);
    }

    fn spec_context<'a>(&'a self, event_text: &'a str) -> SpecContext<'a> {
        let slot = self.ring.current();
        SpecContext {
            camera_id: self.cfg.camera_id,
            event_nr: self.engine.event_nr,
            shot: slot.shot,
            diffs: slot.diffs,
            noise: self.noise,
            threshold: self.threshold,
            width: self.size.width,
            height: self.size.height,
            centroid_x: slot.location.x,
            centroid_y: slot.location.y,
            total_labels: slot.total_labels,
            event_text,
            filename: None,
            filetype: None,
        }
    }

    fn emit(
        &self,
        kind: EventKind,
        image: Option<Arc<Vec<u8>>>,
        filename: Option<String>,
        timestamp: DateTime<Local>,
    ) {
        self.sink.on_event(EventMessage {
            camera_id: self.cfg.camera_id,
            kind,
            image,
            size: self.size,
            filename,
            timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullSink;
    use std::sync::Mutex;

    struct CollectingSink {
        events: Mutex<Vec<EventMessage>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(CollectingSink {
                events: Mutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    impl EventSink for CollectingSink {
        fn on_event(&self, event: EventMessage) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn test_config(width: usize, height: usize) -> CameraConfig {
        CameraConfig {
            width,
            height,
            frame_limit: 10,
            max_changes: 10,
            noise: 20,
            noise_tune: false,
            threshold_tune: false,
            gap: 60,
            minimum_motion_frames: 1,
            pre_capture: 1,
            post_capture: 1,
            lightswitch: 0,
            ..CameraConfig::default()
        }
    }

    fn session(cfg: CameraConfig) -> Session {
        let size = FrameSize::new(cfg.width, cfg.height);
        let mut s = Session::new(
            cfg,
            size,
            Arc::new(NullSink),
            Arc::new(WorkerFlags::default()),
        )
        .unwrap();
        s.engine.startup_frames = 0;
        s
    }

    fn feed_frame(s: &mut Session, luma: u8, now: DateTime<Local>) {
        s.begin_frame(now);
        let n = s.size.motion_size();
        s.ring.current_mut().image[..n].fill(luma);
        s.store_virgin();
        s.process_frame(false, now);
    }

    #[test]
    fn rolling_average_converges() {
        let mut avg = RollingAverage::new(10, 100_000);
        for _ in 0..10 {
            avg.push(50_000);
        }
        assert_eq!(avg.average(), 50_000);
        avg.push(60_000);
        assert!((avg.average() - 51_000).abs() < 1_000);
    }

    #[test]
    fn still_scene_stays_quiet() {
        let mut s = session(test_config(8, 4));
        let now = Local::now();
        s.bufs.virgin.fill(128);
        reset_reference(&mut s.bufs);
        for _ in 0..5 {
            feed_frame(&mut s, 128, now);
            assert_eq!(s.ring.current().diffs, 0);
        }
        assert!(!s.engine.detecting_motion);
        assert!(!s.engine.in_event());
    }

    #[test]
    fn lightswitch_resets_reference_and_zeroes_diffs() {
        let mut cfg = test_config(8, 4);
        cfg.lightswitch = 50;
        let mut s = session(cfg);
        let now = Local::now();

        s.bufs.virgin.fill(128);
        reset_reference(&mut s.bufs);

        // whole frame flips 128 -> 200
        feed_frame(&mut s, 200, now);
        assert_eq!(s.ring.current().diffs, 0);
        assert!(s.engine.moved >= 4); // 5 minus this frame's decrement
        // the reference followed the flip, so the next frame is quiet
        assert!(s.bufs.reference.iter().all(|&v| v == 200));
    }

    #[test]
    fn motion_trigger_fires_first_motion_event() {
        let sink = CollectingSink::new();
        let cfg = test_config(8, 4);
        let size = FrameSize::new(8, 4);
        let mut s = Session::new(cfg, size, sink.clone(), Arc::new(WorkerFlags::default()))
            .unwrap();
        s.engine.startup_frames = 0;
        let now = Local::now();

        s.bufs.virgin.fill(30);
        reset_reference(&mut s.bufs);
        feed_frame(&mut s, 250, now);

        let kinds = sink.kinds();
        assert!(kinds.contains(&EventKind::FirstMotion));
        assert!(kinds.contains(&EventKind::Motion));
        assert!(s.engine.in_event());
    }

    #[test]
    fn event_closes_after_gap_and_flushes() {
        let sink = CollectingSink::new();
        let mut cfg = test_config(8, 4);
        cfg.gap = 1;
        let size = FrameSize::new(8, 4);
        let mut s = Session::new(cfg, size, sink.clone(), Arc::new(WorkerFlags::default()))
            .unwrap();
        s.engine.startup_frames = 0;

        let t0 = Local::now();
        s.bufs.virgin.fill(30);
        reset_reference(&mut s.bufs);
        feed_frame(&mut s, 250, t0);
        assert!(s.engine.in_event());

        // quiet frame consumes the post-roll, a second one sits past the gap
        feed_frame(&mut s, 30, t0 + chrono::Duration::seconds(5));
        feed_frame(&mut s, 30, t0 + chrono::Duration::seconds(10));
        let kinds = sink.kinds();
        assert!(kinds.contains(&EventKind::EndMotion));
        assert!(!s.engine.in_event());
    }

    #[test]
    fn moved_counter_suppresses_diffs() {
        let mut s = session(test_config(8, 4));
        let now = Local::now();
        s.bufs.virgin.fill(30);
        reset_reference(&mut s.bufs);
        s.engine.moved = 3;
        feed_frame(&mut s, 250, now);
        assert_eq!(s.ring.current().diffs, 0);
        assert_eq!(s.engine.moved, 2);
    }

    #[test]
    fn worker_runs_and_stops() {
        use crate::capture::SyntheticCapture;
        let mut cfg = test_config(64, 32);
        cfg.frame_limit = 50;
        let flags = Arc::new(WorkerFlags::default());
        let sink = CollectingSink::new();
        let device = Box::new(SyntheticCapture::new(FrameSize::new(64, 32)));
        let worker = MotionWorker::new(cfg, flags.clone(), sink.clone(), device);

        let handle = thread::spawn(move || worker.run());
        thread::sleep(Duration::from_millis(300));
        flags.restart.store(false, Ordering::SeqCst);
        flags.finish.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        assert!(!flags.running.load(Ordering::SeqCst));
        assert_eq!(flags.watchdog.load(Ordering::SeqCst), WATCHDOG_OFF);
        let kinds = sink.kinds();
        assert!(kinds.contains(&EventKind::Stop));
        assert!(kinds.contains(&EventKind::Image));
    }
}
