//! Vigil motion daemon entry point.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

mod writers;

use anyhow::{Context, bail};
use crossbeam_channel::bounded;
use docopt::Docopt;
use log::LevelFilter;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::fs;
use std::process::exit;
use std::sync::{Arc, Mutex};
use std::thread;
use vigil_motion::capture::SyntheticCapture;
use vigil_motion::config::{CameraConfig, DaemonConfig};
use vigil_motion::event::ChannelSink;
use vigil_motion::frame::FrameSize;
use vigil_motion::supervisor::{DeviceFactory, Supervisor};

use crate::writers::EventWriter;

const USAGE: &str = "
Vigil motion daemon: watches camera streams, detects motion against an
adaptive reference frame, and emits event-structured frame sequences
(pre-roll, trigger, post-roll) to writer plugins.

Usage:
  vigil-motion [options]
  vigil-motion (--help | -h)

Options:
    -c FILE       Configuration file [default: vigil-motion.conf]
    -d LEVEL      Debug level 0-9
    -n            Stay in the foreground even if the config asks for a daemon
    -s            Setup mode: log per-frame detection detail
    -h, --help    Show this help
";

#[derive(Debug, Clone, Deserialize)]
struct Args {
    flag_c: String,
    flag_d: Option<u8>,
    flag_n: bool,
    flag_s: bool,
}

fn main() {
    let version = env!("CARGO_PKG_NAME").to_string() + ", version: " + env!("CARGO_PKG_VERSION");
    let args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .map(|d| d.version(Some(version)))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    init_logging(args.flag_d);

    if let Err(e) = run(&args) {
        error!("fatal: {e:#}");
        exit(1);
    }
}

fn init_logging(debug_level: Option<u8>) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(level) = debug_level {
        builder.filter_level(match level {
            0 | 1 => LevelFilter::Error,
            2 | 3 => LevelFilter::Warn,
            4 | 5 => LevelFilter::Info,
            6 | 7 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        });
    }
    builder.init();
}

/// Builds the capture device for a camera from its `videodevice` setting.
/// Hardware drivers live outside this crate and plug in through the
/// `CaptureDevice` trait; the built-in `synthetic` source exists so the
/// whole pipeline can run (and be tuned in setup mode) without hardware.
fn device_factory(cam: &CameraConfig) -> anyhow::Result<DeviceFactory> {
    let size = FrameSize::new(cam.width, cam.height);
    match cam.video_device.as_str() {
        "synthetic" => Ok(Box::new(move || Box::new(SyntheticCapture::new(size)))),
        "synthetic-slow" => Ok(Box::new(move || {
            Box::new(SyntheticCapture::new(size).with_step_every(4))
        })),
        other => bail!(
            "no capture driver for videodevice '{other}'; \
             link one in through vigil_motion::capture::CaptureDevice"
        ),
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    // The signal thread outlives supervisor generations (HUP restarts);
    // it always talks to the current one through this slot.
    let current: Arc<Mutex<Option<Arc<Supervisor>>>> = Arc::new(Mutex::new(None));
    spawn_signal_thread(current.clone())?;

    let mut pid_path = None;
    loop {
        let config = DaemonConfig::from_file(args.flag_c.as_ref())
            .with_context(|| format!("loading {}", args.flag_c))?;
        if config.cameras.is_empty() {
            bail!("no cameras configured");
        }

        if config.daemon && !args.flag_n && pid_path.is_none() {
            // Process supervision is left to the service manager; the pid
            // file is still written for tooling that expects it.
            info!("daemon mode requested; running under the service manager");
            let path = config
                .pid_file
                .clone()
                .unwrap_or_else(|| "vigil-motion.pid".into());
            fs::write(&path, format!("{}\n", std::process::id()))
                .with_context(|| format!("writing pid file {}", path.display()))?;
            pid_path = Some(path);
        }

        let (tx, rx) = bounded(256);
        let sink = Arc::new(ChannelSink::new(tx));
        let writer = EventWriter::new(config.target_dir.clone());
        let writer_thread = thread::spawn(move || writer.run(rx));

        let supervisor = Arc::new(Supervisor::new());
        for mut cam in config.cameras.clone() {
            if args.flag_s {
                cam.setup_mode = true;
            }
            info!(
                "camera {}: {}x{} device '{}'",
                cam.camera_id, cam.width, cam.height, cam.video_device
            );
            let factory = device_factory(&cam)?;
            supervisor.add_camera(cam, factory, sink.clone());
        }

        *current.lock().unwrap() = Some(supervisor.clone());
        supervisor.run();
        *current.lock().unwrap() = None;

        // Dropping the last sink closes the channel and lets the writer
        // finish flushing.
        drop(sink);
        let restart = supervisor.restart_requested();
        drop(supervisor);
        writer_thread
            .join()
            .map_err(|_| anyhow::anyhow!("event writer panicked"))?;

        if restart {
            info!("restart requested, reloading configuration");
            continue;
        }
        break;
    }

    if let Some(path) = pid_path {
        let _ = fs::remove_file(&path);
        info!("removed pid file {}", path.display());
    }
    info!("terminating");
    Ok(())
}

fn spawn_signal_thread(
    current: Arc<Mutex<Option<Arc<Supervisor>>>>,
) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP, SIGUSR1])
        .context("installing signal handlers")?;
    thread::spawn(move || {
        for signal in signals.forever() {
            let supervisor = current.lock().unwrap().clone();
            let Some(supervisor) = supervisor else {
                continue;
            };
            match signal {
                SIGHUP => {
                    info!("SIGHUP: finishing events and restarting");
                    supervisor.request_restart();
                }
                SIGINT | SIGTERM | SIGQUIT => {
                    info!("shutdown signal received, finishing events");
                    supervisor.request_finish();
                }
                SIGUSR1 => {
                    info!("SIGUSR1: closing current events");
                    supervisor.request_makemovie();
                }
                _ => {}
            }
        }
    });
    Ok(())
}
