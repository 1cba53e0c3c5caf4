//! Synchronized multi-stream sampler
//!
//! Emits one [`SensorFrame`] per tick at the configured rate, combining the
//! arm positions published by the teleop loop with the latest decoded frame
//! of each camera. Sources are never waited on: a camera that has nothing
//! new keeps its previous frame, and once that frame is older than the
//! staleness bound the tick is flagged instead of being delayed or dropped.

use super::buffer::EpisodeBuffer;
use super::config::SamplerConfig;
use super::slot::LatestSlot;
use super::state::{SessionEvent, StatusBoard};
use super::teleop::ArmSnapshot;
use crate::capture::CameraSource;
use crate::episode::{CameraFrame, FrameFlags, SensorFrame};
use crate::utils::{ErrorResponse, SessionError, SharedClock, TickTiming, Ticker};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// The episode buffer frames are currently delivered to, if any.
///
/// The controller swaps buffers under this lock, so each frame lands in at
/// most one episode.
pub type ArmedBuffer = Arc<Mutex<Option<EpisodeBuffer>>>;

/// Shared state the sampler reads from and reports to
#[derive(Clone)]
pub struct SamplerLinks {
    pub arms: Arc<LatestSlot<ArmSnapshot>>,
    pub armed: ArmedBuffer,
    pub board: Arc<StatusBoard>,
    pub events: tokio::sync::broadcast::Sender<SessionEvent>,
}

struct HeldFrame {
    seq: u64,
    frame: Arc<CameraFrame>,
    ticks_since_new: u32,
}

struct CameraTrack {
    source: Arc<dyn CameraSource>,
    blank: Arc<CameraFrame>,
    held: Option<HeldFrame>,
    /// Fault already reported; camera faults stay latched for the session
    faulted: bool,
}

struct CameraReading {
    frame: Arc<CameraFrame>,
    stale: bool,
    fault: bool,
}

impl CameraTrack {
    fn age(&mut self) {
        if let Some(held) = &mut self.held {
            held.ticks_since_new = held.ticks_since_new.saturating_add(1);
        }
    }

    fn read(&mut self, staleness_ticks: u32, links: &SamplerLinks) -> CameraReading {
        let camera = self.source.camera();
        let mut fault = false;

        match self.source.latest_or_none() {
            Ok(Some(captured)) => match &mut self.held {
                Some(held) if held.seq == captured.seq => {
                    held.ticks_since_new = held.ticks_since_new.saturating_add(1);
                }
                _ => {
                    self.held = Some(HeldFrame {
                        seq: captured.seq,
                        frame: captured.frame,
                        ticks_since_new: 0,
                    });
                }
            },
            Ok(None) => self.age(),
            Err(source_fault) => {
                fault = true;
                self.age();
                if !self.faulted {
                    self.faulted = true;
                    tracing::error!("{} faulted, marking its frames: {}", camera, source_fault);
                    let message = source_fault.to_string();
                    links
                        .board
                        .update(|s| s.faults.camera_faults[camera.index()] = Some(message));
                    let error = ErrorResponse::from(&SessionError::Source(source_fault));
                    let _ = links.events.send(SessionEvent::Fault(error));
                }
            }
        }

        match &self.held {
            Some(held) => CameraReading {
                frame: held.frame.clone(),
                stale: held.ticks_since_new > staleness_ticks,
                fault,
            },
            None => CameraReading {
                frame: self.blank.clone(),
                stale: true,
                fault,
            },
        }
    }
}

pub struct SyncSampler {
    config: SamplerConfig,
    clock: SharedClock,
    cameras: [CameraTrack; 2],
    links: SamplerLinks,
    last_timestamp: Option<f64>,
    emitted: u64,
    overruns: u64,
}

impl SyncSampler {
    /// `resolutions` size the placeholder raster used before a camera's first frame
    pub fn new(
        config: SamplerConfig,
        clock: SharedClock,
        cameras: [Arc<dyn CameraSource>; 2],
        resolutions: [(u32, u32); 2],
        links: SamplerLinks,
    ) -> Self {
        let [camera_1, camera_2] = cameras;
        let track = |source: Arc<dyn CameraSource>, (width, height): (u32, u32)| CameraTrack {
            source,
            blank: Arc::new(CameraFrame::blank(width, height)),
            held: None,
            faulted: false,
        };

        Self {
            config,
            clock,
            cameras: [track(camera_1, resolutions[0]), track(camera_2, resolutions[1])],
            links,
            last_timestamp: None,
            emitted: 0,
            overruns: 0,
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    fn next_timestamp(&mut self) -> f64 {
        let mut timestamp = self.clock.now().as_secs_f64();
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                timestamp = last + 1e-6;
            }
        }
        self.last_timestamp = Some(timestamp);
        timestamp
    }

    /// Sample every source once. Returns `None` until the arms have reported.
    pub fn tick(&mut self, timing: TickTiming) -> Option<SensorFrame> {
        let (_, arms) = self.links.arms.latest()?;

        let timestamp = self.next_timestamp();
        let staleness = self.config.camera_staleness_ticks;
        let [c1, c2] = [
            self.cameras[0].read(staleness, &self.links),
            self.cameras[1].read(staleness, &self.links),
        ];

        if timing.overrun {
            self.overruns += 1;
            tracing::debug!(
                "Sampler tick started {:?} late ({} skipped)",
                timing.lateness(),
                timing.skipped
            );
        }

        let frame = SensorFrame {
            timestamp,
            leader: arms.leader,
            follower: arms.follower,
            camera_1: c1.frame,
            camera_2: c2.frame,
            flags: FrameFlags {
                leader_stale: arms.leader_stale,
                arm_fault: arms.arm_fault,
                camera_stale: [c1.stale, c2.stale],
                camera_fault: [c1.fault, c2.fault],
                overrun: timing.overrun,
            },
        };
        self.emitted += 1;

        let recorded = self
            .links
            .armed
            .lock()
            .as_mut()
            .map(|buffer| {
                buffer.push(frame.clone());
                buffer.len() as u64
            });

        let (emitted, overruns) = (self.emitted, self.overruns);
        self.links.board.update(|status| {
            status.frames_emitted = emitted;
            status.overruns = overruns;
            if let Some(recorded) = recorded {
                status.frames_recorded = recorded;
            }
        });

        Some(frame)
    }

    /// Run on a dedicated thread until `running` is cleared
    pub fn spawn(mut self, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<SyncSampler>> {
        let mut ticker = Ticker::from_rate(
            self.clock.clone(),
            self.config.fps,
            self.config.overrun_threshold(),
        );
        std::thread::Builder::new()
            .name("sync-sampler".to_string())
            .spawn(move || {
                tracing::info!("Sync sampler started at {} fps", self.config.fps);
                while running.load(Ordering::SeqCst) {
                    let timing = ticker.wait();
                    self.tick(timing);
                }
                tracing::info!(
                    "Sync sampler stopped: {} frames emitted, {} overruns",
                    self.emitted,
                    self.overruns
                );
                self
            })
    }
}
