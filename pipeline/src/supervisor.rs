//! Worker supervision: spawning, watchdogs, restarts and shutdown.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::capture::CaptureDevice;
use crate::config::CameraConfig;
use crate::event::EventSink;
use crate::worker::{MotionWorker, WATCHDOG_KILL, WATCHDOG_OFF, WorkerFlags};
use log::{error, info};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Builds a fresh capture device for a camera; called again on every
/// worker restart so a reopened device starts from a clean slate.
pub type DeviceFactory = Box<dyn Fn() -> Box<dyn CaptureDevice> + Send + Sync>;

struct CameraRuntime {
    config: CameraConfig,
    flags: Arc<WorkerFlags>,
    factory: DeviceFactory,
    sink: Arc<dyn EventSink>,
    join: Option<JoinHandle<()>>,
}

/// Owns every camera worker. The only cross-thread state is the worker
/// registry behind one mutex plus the per-worker atomic flags, which the
/// supervisor reads lock-free and tolerates stale by one tick.
pub struct Supervisor {
    cameras: Mutex<Vec<CameraRuntime>>,
    threads_running: Arc<AtomicUsize>,
    finish: AtomicBool,
    restart: AtomicBool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            cameras: Mutex::new(Vec::new()),
            threads_running: Arc::new(AtomicUsize::new(0)),
            finish: AtomicBool::new(false),
            restart: AtomicBool::new(false),
        }
    }

    /// Registers a camera. Workers start on `run`.
    pub fn add_camera(
        &self,
        config: CameraConfig,
        factory: DeviceFactory,
        sink: Arc<dyn EventSink>,
    ) -> Arc<WorkerFlags> {
        let flags = Arc::new(WorkerFlags::default());
        self.cameras.lock().unwrap().push(CameraRuntime {
            config,
            flags: flags.clone(),
            factory,
            sink,
            join: None,
        });
        flags
    }

    fn spawn(runtime: &mut CameraRuntime, threads_running: &Arc<AtomicUsize>) {
        let worker = MotionWorker::new(
            runtime.config.clone(),
            runtime.flags.clone(),
            runtime.sink.clone(),
            (runtime.factory)(),
        );
        let counter = threads_running.clone();
        counter.fetch_add(1, Ordering::SeqCst);
        let camera_id = runtime.config.camera_id;
        runtime.join = Some(thread::spawn(move || {
            worker.run();
            counter.fetch_sub(1, Ordering::SeqCst);
        }));
        info!("started worker for camera {camera_id}");
    }

    /// Spawns all workers and ticks the watchdog loop once a second until
    /// every worker is gone and shutdown (or restart) was requested.
    pub fn run(&self) {
        {
            let mut cameras = self.cameras.lock().unwrap();
            for runtime in cameras.iter_mut() {
                Self::spawn(runtime, &self.threads_running);
            }
        }

        loop {
            thread::sleep(Duration::from_secs(1));

            let mut workers_alive = 0;
            {
                let mut cameras = self.cameras.lock().unwrap();
                for runtime in cameras.iter_mut() {
                    let running = runtime.flags.running.load(Ordering::SeqCst);
                    let wants_restart = runtime.flags.restart.load(Ordering::SeqCst);

                    if running || wants_restart {
                        workers_alive += 1;
                    }

                    // A worker that exited but still wants to run again
                    // (resolution change, transient fatal) is respawned.
                    if !running && wants_restart && !self.finish.load(Ordering::SeqCst) {
                        if let Some(join) = runtime.join.take() {
                            let _ = join.join();
                        }
                        info!("restarting worker for camera {}", runtime.config.camera_id);
                        Self::spawn(runtime, &self.threads_running);
                        continue;
                    }

                    // Watchdog: decremented every tick; a wedged worker is
                    // first asked to finish, then written off entirely.
                    let watchdog = runtime.flags.watchdog.load(Ordering::SeqCst);
                    if watchdog > WATCHDOG_OFF {
                        let watchdog = watchdog - 1;
                        runtime.flags.watchdog.store(watchdog, Ordering::SeqCst);
                        if watchdog == 0 {
                            error!(
                                "camera {} watchdog timeout, requesting graceful stop",
                                runtime.config.camera_id
                            );
                            runtime.flags.finish.store(true, Ordering::SeqCst);
                        }
                        if watchdog == WATCHDOG_KILL {
                            error!(
                                "camera {} ignored the watchdog, abandoning its thread",
                                runtime.config.camera_id
                            );
                            // Threads cannot be cancelled from outside;
                            // detach it, clear the slot, and carry on. The
                            // thread decrements the running counter itself
                            // if it ever comes back.
                            runtime.join.take();
                            runtime.flags.restart.store(false, Ordering::SeqCst);
                            runtime.flags.running.store(false, Ordering::SeqCst);
                            runtime
                                .flags
                                .watchdog
                                .store(WATCHDOG_OFF, Ordering::SeqCst);
                        }
                    }
                }
            }

            let finishing = self.finish.load(Ordering::SeqCst);
            if (workers_alive == 0 && finishing)
                || (workers_alive == 0 && self.threads_running.load(Ordering::SeqCst) == 0)
            {
                break;
            }
        }

        // Collect whatever is left so worker teardown completes.
        let mut cameras = self.cameras.lock().unwrap();
        for runtime in cameras.iter_mut() {
            if let Some(join) = runtime.join.take() {
                let _ = join.join();
            }
        }
        info!("supervisor finished");
    }

    /// Asks every worker to wrap up its event and exit. INT/TERM/QUIT.
    pub fn request_finish(&self) {
        self.finish.store(true, Ordering::SeqCst);
        let cameras = self.cameras.lock().unwrap();
        for runtime in cameras.iter() {
            runtime.flags.makemovie.store(true, Ordering::SeqCst);
            runtime.flags.finish.store(true, Ordering::SeqCst);
            runtime.flags.restart.store(false, Ordering::SeqCst);
        }
    }

    /// Finish plus a process-level restart request. HUP.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
        self.request_finish();
    }

    /// Whether a restart was requested before the last shutdown.
    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    /// Asks every worker to close its current event. USR1.
    pub fn request_makemovie(&self) {
        let cameras = self.cameras.lock().unwrap();
        for runtime in cameras.iter() {
            runtime.flags.makemovie.store(true, Ordering::SeqCst);
        }
    }

    /// Triggers a snapshot on every camera.
    pub fn request_snapshot(&self) {
        let cameras = self.cameras.lock().unwrap();
        for runtime in cameras.iter() {
            runtime.flags.snapshot.store(true, Ordering::SeqCst);
        }
    }
}
