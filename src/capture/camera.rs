//! Threaded camera decode path
//!
//! Each camera runs its own capture thread that polls the SDK at the camera's
//! native rate, timestamps every new image and publishes it as the latest
//! frame. Readers never block the decode thread for longer than a clone of
//! an `Arc`.

use super::traits::{CameraSdk, CameraSource, CapturedFrame, Sample, SampleResult};
use crate::episode::{CameraFrame, CameraId};
use crate::recorder::config::CameraConfig;
use crate::utils::{SharedClock, SourceFault, Ticker};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Default)]
struct Published {
    latest: Option<CapturedFrame>,
    seq: u64,
    fault: Option<SourceFault>,
}

#[derive(Default)]
struct Shared {
    published: Mutex<Published>,
    fresh: Condvar,
}

impl Shared {
    fn publish(&self, frame: CameraFrame) {
        let mut published = self.published.lock();
        published.seq += 1;
        published.latest = Some(CapturedFrame {
            seq: published.seq,
            frame: Arc::new(frame),
        });
        self.fresh.notify_all();
    }

    fn fail(&self, fault: SourceFault) {
        self.published.lock().fault = Some(fault);
        self.fresh.notify_all();
    }
}

/// A camera whose decode path runs on a dedicated thread
pub struct ThreadedCamera {
    camera: CameraId,
    config: CameraConfig,
    clock: SharedClock,
    sdk: Arc<Mutex<Box<dyn CameraSdk>>>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedCamera {
    pub fn new(
        camera: CameraId,
        sdk: Box<dyn CameraSdk>,
        config: CameraConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            camera,
            config,
            clock,
            sdk: Arc::new(Mutex::new(sdk)),
            shared: Arc::new(Shared::default()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct DecodeLoop {
    camera: CameraId,
    width: u32,
    height: u32,
    clock: SharedClock,
    sdk: Arc<Mutex<Box<dyn CameraSdk>>>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    ticker: Ticker,
}

impl DecodeLoop {
    fn run(mut self) {
        tracing::info!(
            "{} decode thread started ({}x{} @ {:.1} fps)",
            self.camera,
            self.width,
            self.height,
            1.0 / self.ticker.period().as_secs_f64()
        );

        while self.running.load(Ordering::SeqCst) {
            self.ticker.wait();
            if let Err(fault) = self.poll() {
                tracing::error!("{} decode path faulted: {}", self.camera, fault);
                self.running.store(false, Ordering::SeqCst);
                self.shared.fail(fault);
                break;
            }
        }

        tracing::info!("{} decode thread stopped", self.camera);
    }

    fn poll(&mut self) -> Result<(), SourceFault> {
        let image = match self.sdk.lock().latest_frame(self.camera)? {
            Some(image) => image,
            None => return Ok(()),
        };

        if image.width != self.width || image.height != self.height {
            return Err(SourceFault::new(
                self.camera.name(),
                format!(
                    "resolution changed to {}x{}, expected {}x{}",
                    image.width, image.height, self.width, self.height
                ),
            ));
        }

        let captured_at = self.clock.now().as_secs_f64();
        let frame = CameraFrame::new(image.width, image.height, image.rgb, captured_at)
            .map_err(|e| SourceFault::new(self.camera.name(), e.to_string()))?;
        self.shared.publish(frame);
        Ok(())
    }
}

impl CameraSource for ThreadedCamera {
    fn camera(&self) -> CameraId {
        self.camera
    }

    fn start(&self) -> Result<(), SourceFault> {
        let mut worker = self.worker.lock();
        if worker.is_some() && self.is_running() {
            return Ok(());
        }
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }

        // A restart clears the latched fault and any frame from the previous run
        {
            let mut published = self.shared.published.lock();
            published.fault = None;
            published.latest = None;
        }
        self.running.store(true, Ordering::SeqCst);

        let decode = DecodeLoop {
            camera: self.camera,
            width: self.config.width,
            height: self.config.height,
            clock: self.clock.clone(),
            sdk: self.sdk.clone(),
            shared: self.shared.clone(),
            running: self.running.clone(),
            ticker: Ticker::from_rate(self.clock.clone(), self.config.fps, Duration::MAX),
        };

        let handle = std::thread::Builder::new()
            .name(format!("{}-decode", self.camera))
            .spawn(move || decode.run())
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                SourceFault::new(self.camera.name(), format!("cannot spawn decode thread: {e}"))
            })?;
        *worker = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("{} decode thread panicked", self.camera);
            }
        }
    }

    fn sample(&self, timeout: Duration) -> SampleResult<CapturedFrame> {
        let deadline = Instant::now() + timeout;
        let mut published = self.shared.published.lock();
        let seen = published.seq;

        loop {
            if let Some(fault) = &published.fault {
                return Err(fault.clone());
            }
            if published.seq > seen {
                if let Some(latest) = &published.latest {
                    return Ok(Sample::Ready(latest.clone()));
                }
            }
            if self
                .shared
                .fresh
                .wait_until(&mut published, deadline)
                .timed_out()
            {
                return Ok(Sample::Unavailable);
            }
        }
    }

    fn latest_or_none(&self) -> Result<Option<CapturedFrame>, SourceFault> {
        let published = self.shared.published.lock();
        if let Some(fault) = &published.fault {
            return Err(fault.clone());
        }
        Ok(published.latest.clone())
    }
}

impl Drop for ThreadedCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::SimulatedCameras;
    use crate::utils::MonotonicClock;

    fn camera(cameras: &SimulatedCameras, id: CameraId) -> ThreadedCamera {
        let config = CameraConfig {
            device: "sim".to_string(),
            width: 8,
            height: 6,
            fps: 200.0,
        };
        ThreadedCamera::new(id, Box::new(cameras.sdk()), config, MonotonicClock::shared())
    }

    #[test]
    fn test_publishes_increasing_frames() {
        let cameras = SimulatedCameras::new(8, 6);
        let cam = camera(&cameras, CameraId::Camera1);
        assert_eq!(cam.latest_or_none().unwrap(), None);

        cam.start().unwrap();
        let first = cam.sample(Duration::from_secs(2)).unwrap().ready().unwrap();
        let second = cam.sample(Duration::from_secs(2)).unwrap().ready().unwrap();
        cam.stop();

        assert!(second.seq > first.seq);
        assert_eq!(first.frame.width(), 8);
        assert!(first.frame.captured_at().unwrap() <= second.frame.captured_at().unwrap());
        assert!(cam.latest_or_none().unwrap().is_some());
    }

    #[test]
    fn test_sample_times_out_without_frames() {
        let cameras = SimulatedCameras::new(8, 6);
        let cam = camera(&cameras, CameraId::Camera2);
        // Not started: nothing is ever published
        let sample = cam.sample(Duration::from_millis(20)).unwrap();
        assert_eq!(sample, Sample::Unavailable);
    }

    #[test]
    fn test_fault_latches_until_restart() {
        let cameras = SimulatedCameras::new(8, 6);
        let cam = camera(&cameras, CameraId::Camera1);
        cameras.inject_fault(CameraId::Camera1, "usb reset");

        cam.start().unwrap();
        let fault = cam.sample(Duration::from_secs(2)).unwrap_err();
        assert_eq!(fault.source_name, "camera_1");
        assert!(cam.latest_or_none().is_err());

        cameras.clear_fault(CameraId::Camera1);
        cam.start().unwrap();
        assert!(cam.sample(Duration::from_secs(2)).unwrap().is_ready());
        cam.stop();
    }

    #[test]
    fn test_restart_drops_previous_frame() {
        let cameras = SimulatedCameras::new(8, 6);
        let cam = camera(&cameras, CameraId::Camera2);
        cam.start().unwrap();
        assert!(cam.sample(Duration::from_secs(2)).unwrap().is_ready());
        cam.stop();
        assert!(cam.latest_or_none().unwrap().is_some());

        cameras.skip_frames(CameraId::Camera2, u32::MAX);
        cam.start().unwrap();
        assert_eq!(cam.latest_or_none().unwrap(), None);
        assert_eq!(cam.sample(Duration::from_millis(50)).unwrap(), Sample::Unavailable);
        cam.stop();
    }

    #[test]
    fn test_resolution_change_faults() {
        let cameras = SimulatedCameras::new(4, 4);
        let cam = camera(&cameras, CameraId::Camera1);
        cam.start().unwrap();
        let fault = cam.sample(Duration::from_secs(2)).unwrap_err();
        assert!(fault.message.contains("resolution"));
        cam.stop();
    }
}
