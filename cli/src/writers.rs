//! Built-in event writers: a JSON event log plus greyscale snapshots for
//! the image-bearing events. Heavier writers (JPEG/MPEG encoders, stream
//! servers) subscribe to the same channel from their own crates.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crossbeam_channel::Receiver;
use image::GrayImage;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use vigil_motion::event::{EventKind, EventMessage};

/// One line of the `events.jsonl` log.
#[derive(Serialize)]
struct EventRecord<'a> {
    camera: usize,
    kind: EventKind,
    filename: Option<&'a str>,
    timestamp: String,
}

pub struct EventWriter {
    target_dir: PathBuf,
}

impl EventWriter {
    pub fn new(target_dir: PathBuf) -> Self {
        EventWriter { target_dir }
    }

    /// Drains the event channel until every worker has dropped its sender.
    pub fn run(self, rx: Receiver<EventMessage>) {
        if let Err(e) = fs::create_dir_all(&self.target_dir) {
            error!("cannot create target dir {}: {e}", self.target_dir.display());
            return;
        }
        while let Ok(event) = rx.recv() {
            self.handle(&event);
        }
        debug!("event writer draining finished");
    }

    fn handle(&self, event: &EventMessage) {
        match event.kind {
            EventKind::ImageDetected | EventKind::ImageSnapshot | EventKind::Image => {
                if let (Some(image), Some(filename)) = (&event.image, event.filename.as_deref()) {
                    self.save_grey(image, event, filename);
                }
                self.log_record(event);
            }
            // high-rate stream feeds are not persisted by the built-in writer
            EventKind::Imagem | EventKind::Webcam | EventKind::ImagemDetected => {}
            _ => self.log_record(event),
        }
    }

    /// Writes the luma plane of a frame as a PGM next to the event log.
    fn save_grey(&self, image: &[u8], event: &EventMessage, filename: &str) {
        let n = event.size.motion_size();
        if image.len() < n {
            warn!("camera {}: truncated frame, not saving", event.camera_id);
            return;
        }
        let Some(grey) = GrayImage::from_raw(
            event.size.width as u32,
            event.size.height as u32,
            image[..n].to_vec(),
        ) else {
            warn!("camera {}: frame does not match its size", event.camera_id);
            return;
        };
        let path = self.target_dir.join(format!("{filename}.pgm"));
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match grey.save(&path) {
            Ok(()) => debug!("saved {}", path.display()),
            Err(e) => warn!("image save failed {}: {e}", path.display()),
        }
    }

    fn log_record(&self, event: &EventMessage) {
        let record = EventRecord {
            camera: event.camera_id,
            kind: event.kind,
            filename: event.filename.as_deref(),
            timestamp: event.timestamp.to_rfc3339(),
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("cannot encode event record: {e}");
                return;
            }
        };
        if let Err(e) = append_line(&self.target_dir.join("events.jsonl"), &line) {
            warn!("cannot append event log: {e}");
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
