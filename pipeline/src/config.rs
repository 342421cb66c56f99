//! Daemon and per-camera configuration.
//!
//! The config file is a line-based `key value` format; `#` and `;` start
//! comments. A `thread <file>` directive loads a per-camera overlay file:
//! the camera starts from the global settings and the overlay rewrites
//! whatever it names.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::alg::locate::BboxExpand;
use crate::error::EngineError;
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};

/// How the preview shot for an event is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PreviewMode {
    #[default]
    Off,
    /// Every saved image, no preview selection.
    On,
    /// Keep the first trigger frame.
    First,
    /// Keep the frame with the most changed pixels.
    Best,
    /// Keep the frame whose motion is closest to the frame center.
    Center,
}

/// Rollover cadence for timelapse recordings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimelapseMode {
    #[default]
    Manual,
    Daily,
    Hourly,
    WeeklySunday,
    WeeklyMonday,
    Monthly,
}

/// Settings for one camera worker. Constructed from the global section of
/// the config file, then overridden by a per-camera `thread` file.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub camera_id: usize,
    pub video_device: String,
    pub width: usize,
    pub height: usize,
    pub frame_limit: i32,
    /// Seconds between captures when limiting below 1 fps; 0 disables.
    pub minimum_frame_time: i32,
    pub max_changes: i32,
    pub threshold_tune: bool,
    pub noise: i32,
    pub noise_tune: bool,
    pub despeckle: String,
    pub smart_mask_speed: u8,
    /// Percentage of the frame that must change to call a lightswitch;
    /// 0 disables the detector.
    pub lightswitch: i32,
    pub switchfilter: bool,
    pub minimum_motion_frames: i32,
    pub pre_capture: i32,
    pub post_capture: i32,
    /// Seconds of quiet that terminate an event; 0 disables gap closing.
    pub gap: i64,
    pub max_movie_time: i64,
    /// Save and trigger on every frame regardless of motion.
    pub output_all: bool,
    pub output_normal: PreviewMode,
    pub snapshot_interval: i64,
    pub timelapse: i64,
    pub timelapse_mode: TimelapseMode,
    /// Digits 1-9 naming cells of a 3x3 grid; motion centered in a named
    /// cell fires an area event once per event.
    pub area_detect: String,
    pub mask_file: Option<PathBuf>,
    pub text_event: String,
    pub image_path: String,
    pub snapshot_path: String,
    pub webcam_motion: bool,
    pub setup_mode: bool,
    pub bbox_expand: BboxExpand,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            camera_id: 0,
            video_device: "synthetic".to_string(),
            width: 352,
            height: 288,
            frame_limit: 100,
            minimum_frame_time: 0,
            max_changes: 1500,
            threshold_tune: false,
            noise: 32,
            noise_tune: true,
            despeckle: String::new(),
            smart_mask_speed: 0,
            lightswitch: 0,
            switchfilter: false,
            minimum_motion_frames: 1,
            pre_capture: 0,
            post_capture: 0,
            gap: 60,
            max_movie_time: 3600,
            output_all: false,
            output_normal: PreviewMode::Off,
            snapshot_interval: 0,
            timelapse: 0,
            timelapse_mode: TimelapseMode::Daily,
            area_detect: String::new(),
            mask_file: None,
            text_event: "%Y%m%d%H%M%S".to_string(),
            image_path: "%v-%Y%m%d%H%M%S-%q".to_string(),
            snapshot_path: "%v-%Y%m%d%H%M%S-snapshot".to_string(),
            webcam_motion: false,
            setup_mode: false,
            bbox_expand: BboxExpand::default(),
        }
    }
}

impl CameraConfig {
    /// Applies one `key value` pair. Unknown keys are warned about and
    /// skipped so that a newer config file still loads.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        let bad = |key: &str, value: &str| {
            EngineError::Config(format!("invalid value '{value}' for '{key}'"))
        };
        match key {
            "videodevice" => self.video_device = value.to_string(),
            "width" => self.width = value.parse().map_err(|_| bad(key, value))?,
            "height" => self.height = value.parse().map_err(|_| bad(key, value))?,
            "framerate" => self.frame_limit = value.parse().map_err(|_| bad(key, value))?,
            "minimum_frame_time" => {
                self.minimum_frame_time = value.parse().map_err(|_| bad(key, value))?
            }
            "threshold" => self.max_changes = value.parse().map_err(|_| bad(key, value))?,
            "threshold_tune" => self.threshold_tune = parse_bool(value).ok_or_else(|| bad(key, value))?,
            "noise_level" => self.noise = value.parse().map_err(|_| bad(key, value))?,
            "noise_tune" => self.noise_tune = parse_bool(value).ok_or_else(|| bad(key, value))?,
            "despeckle" => self.despeckle = value.to_string(),
            "smart_mask_speed" => {
                self.smart_mask_speed = value.parse().map_err(|_| bad(key, value))?
            }
            "lightswitch" => self.lightswitch = value.parse().map_err(|_| bad(key, value))?,
            "switchfilter" => self.switchfilter = parse_bool(value).ok_or_else(|| bad(key, value))?,
            "minimum_motion_frames" => {
                self.minimum_motion_frames = value.parse().map_err(|_| bad(key, value))?
            }
            "pre_capture" => self.pre_capture = value.parse().map_err(|_| bad(key, value))?,
            "post_capture" => self.post_capture = value.parse().map_err(|_| bad(key, value))?,
            "gap" => self.gap = value.parse().map_err(|_| bad(key, value))?,
            "max_mpeg_time" => self.max_movie_time = value.parse().map_err(|_| bad(key, value))?,
            "output_all" => self.output_all = parse_bool(value).ok_or_else(|| bad(key, value))?,
            "output_normal" => {
                self.output_normal = match value {
                    "off" => PreviewMode::Off,
                    "on" => PreviewMode::On,
                    "first" => PreviewMode::First,
                    "best" => PreviewMode::Best,
                    "center" => PreviewMode::Center,
                    _ => return Err(bad(key, value)),
                }
            }
            "snapshot_interval" => {
                self.snapshot_interval = value.parse().map_err(|_| bad(key, value))?
            }
            "timelapse" => self.timelapse = value.parse().map_err(|_| bad(key, value))?,
            "timelapse_mode" => {
                self.timelapse_mode = match value {
                    "manual" => TimelapseMode::Manual,
                    "daily" => TimelapseMode::Daily,
                    "hourly" => TimelapseMode::Hourly,
                    "weekly-sunday" => TimelapseMode::WeeklySunday,
                    "weekly-monday" => TimelapseMode::WeeklyMonday,
                    "monthly" => TimelapseMode::Monthly,
                    _ => return Err(bad(key, value)),
                }
            }
            "area_detect" => self.area_detect = value.to_string(),
            "mask_file" => self.mask_file = Some(PathBuf::from(value)),
            "text_event" => self.text_event = value.to_string(),
            "jpeg_filename" => self.image_path = value.to_string(),
            "snapshot_filename" => self.snapshot_path = value.to_string(),
            "webcam_motion" => self.webcam_motion = parse_bool(value).ok_or_else(|| bad(key, value))?,
            "setup_mode" => self.setup_mode = parse_bool(value).ok_or_else(|| bad(key, value))?,
            "locate_expand_x" => {
                self.bbox_expand.horizontal = value.parse().map_err(|_| bad(key, value))?
            }
            "locate_expand_up" => {
                self.bbox_expand.above = value.parse().map_err(|_| bad(key, value))?
            }
            "locate_expand_down" => {
                self.bbox_expand.below = value.parse().map_err(|_| bad(key, value))?
            }
            other => warn!("ignoring unknown config option '{other}'"),
        }
        Ok(())
    }

    /// Clamps values the main loop depends on into their working ranges,
    /// the way the original daemon sanity-checks before each frame.
    pub fn sanitize(&mut self) {
        self.frame_limit = self.frame_limit.clamp(2, 100);
        self.minimum_motion_frames = self.minimum_motion_frames.max(1);
        self.pre_capture = self.pre_capture.max(0);
        self.post_capture = self.post_capture.max(0);
        if self.smart_mask_speed > 10 {
            warn!("smart_mask_speed out of range, disabling smartmask");
            self.smart_mask_speed = 0;
        }
        self.lightswitch = self.lightswitch.clamp(0, 100);
    }

    /// Ring length for the pre-capture buffer.
    pub fn ring_size(&self) -> usize {
        (self.pre_capture + self.minimum_motion_frames) as usize
    }
}

/// Whole-daemon configuration: global flags plus one entry per camera.
#[derive(Clone, Debug, Default)]
pub struct DaemonConfig {
    pub daemon: bool,
    pub pid_file: Option<PathBuf>,
    pub target_dir: PathBuf,
    pub cameras: Vec<CameraConfig>,
}

impl DaemonConfig {
    /// Parses the main config file. `thread` directives are resolved
    /// relative to the main file's directory. Without any `thread` lines
    /// the global section itself describes a single camera.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut daemon = false;
        let mut pid_file = None;
        let mut target_dir = PathBuf::from(".");
        let mut global = CameraConfig::default();
        let mut thread_files: Vec<PathBuf> = Vec::new();

        for (key, value) in config_lines(&text) {
            match key.as_str() {
                "daemon" => {
                    daemon = parse_bool(&value)
                        .ok_or_else(|| EngineError::Config(format!("invalid daemon '{value}'")))?
                }
                "process_id_file" => pid_file = Some(PathBuf::from(&value)),
                "target_dir" => target_dir = PathBuf::from(&value),
                "thread" => thread_files.push(base.join(&value)),
                _ => global.apply(&key, &value)?,
            }
        }

        let mut cameras = Vec::new();
        if thread_files.is_empty() {
            let mut cam = global.clone();
            cam.camera_id = 0;
            cam.sanitize();
            cameras.push(cam);
        } else {
            for (id, file) in thread_files.iter().enumerate() {
                let overlay = fs::read_to_string(file)
                    .map_err(|e| EngineError::Config(format!("{}: {e}", file.display())))?;
                let mut cam = global.clone();
                cam.camera_id = id;
                for (key, value) in config_lines(&overlay) {
                    cam.apply(&key, &value)?;
                }
                cam.sanitize();
                cameras.push(cam);
            }
        }

        Ok(DaemonConfig {
            daemon,
            pid_file,
            target_dir,
            cameras,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "on" | "yes" | "true" | "1" => Some(true),
        "off" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Iterates `key value` pairs, skipping blanks and comment lines.
fn config_lines(text: &str) -> impl Iterator<Item = (String, String)> + '_ {
    text.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            return None;
        }
        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((k, v)) => (k, v.trim()),
            None => (line, ""),
        };
        Some((key.to_string(), value.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("vigil-test-{}-{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_global_single_camera() {
        let path = write_temp(
            "single.conf",
            "# comment\n\
             width 320\n\
             height 240\n\
             framerate 10\n\
             threshold 900\n\
             despeckle EedDl\n\
             output_normal center\n\
             ; another comment\n\
             gap 30\n",
        );
        let cfg = DaemonConfig::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(cfg.cameras.len(), 1);
        let cam = &cfg.cameras[0];
        assert_eq!((cam.width, cam.height), (320, 240));
        assert_eq!(cam.frame_limit, 10);
        assert_eq!(cam.max_changes, 900);
        assert_eq!(cam.output_normal, PreviewMode::Center);
        assert_eq!(cam.gap, 30);
    }

    #[test]
    fn thread_files_overlay_globals() {
        let overlay = write_temp("cam1.conf", "width 640\nheight 480\n");
        let main = write_temp(
            "main.conf",
            &format!("width 320\nheight 240\nnoise_level 20\nthread {}\n", overlay.display()),
        );
        let cfg = DaemonConfig::from_file(&main).unwrap();
        fs::remove_file(&main).unwrap();
        fs::remove_file(&overlay).unwrap();
        assert_eq!(cfg.cameras.len(), 1);
        let cam = &cfg.cameras[0];
        assert_eq!((cam.width, cam.height), (640, 480));
        assert_eq!(cam.noise, 20); // inherited from the global section
    }

    #[test]
    fn sanitize_clamps_working_ranges() {
        let mut cam = CameraConfig {
            frame_limit: 0,
            minimum_motion_frames: 0,
            pre_capture: -3,
            smart_mask_speed: 99,
            lightswitch: 250,
            ..CameraConfig::default()
        };
        cam.sanitize();
        assert_eq!(cam.frame_limit, 2);
        assert_eq!(cam.minimum_motion_frames, 1);
        assert_eq!(cam.pre_capture, 0);
        assert_eq!(cam.smart_mask_speed, 0);
        assert_eq!(cam.lightswitch, 100);
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut cam = CameraConfig::default();
        assert!(cam.apply("width", "banana").is_err());
        assert!(cam.apply("output_normal", "sideways").is_err());
        // unknown keys only warn
        assert!(cam.apply("some_future_option", "1").is_ok());
    }
}
