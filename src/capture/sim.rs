//! Simulated arms and cameras
//!
//! Stand-ins for the motor bus and the camera SDK, used by the demo binary
//! when no hardware is attached and by the session tests. Both expose
//! handles for scripting motion and injecting unavailable reads or faults.

use super::camera::ThreadedCamera;
use super::joint::BusArm;
use super::traits::{ArmId, CameraSdk, CameraSource, MotorBus, RawImage, Sample, SampleResult};
use crate::episode::{CameraId, JointPosition};
use crate::recorder::{SessionConfig, SessionHardware};
use crate::utils::{SharedClock, SourceFault};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct SimArm {
    position: JointPosition,
    unavailable_reads: u32,
    fault: Option<String>,
    reads: u64,
    writes: u64,
    prepared: bool,
}

impl SimArm {
    fn centered() -> Self {
        Self {
            position: JointPosition::new([2048.0; 6]),
            unavailable_reads: 0,
            fault: None,
            reads: 0,
            writes: 0,
            prepared: false,
        }
    }
}

#[derive(Debug)]
struct RigState {
    arms: [SimArm; 2],
}

impl RigState {
    fn arm(&mut self, arm: ArmId) -> &mut SimArm {
        match arm {
            ArmId::Leader => &mut self.arms[0],
            ArmId::Follower => &mut self.arms[1],
        }
    }
}

/// A simulated leader/follower pair. Cloning yields another handle to the same rig.
#[derive(Debug, Clone)]
pub struct SimulatedRig {
    state: Arc<Mutex<RigState>>,
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRig {
    /// Both arms start centered at 2048 ticks
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RigState {
                arms: [SimArm::centered(), SimArm::centered()],
            })),
        }
    }

    /// A bus handle for either arm
    pub fn bus(&self) -> SimulatedBus {
        SimulatedBus { rig: self.clone() }
    }

    /// Move an arm as if by hand
    pub fn set_position(&self, arm: ArmId, position: JointPosition) {
        self.state.lock().arm(arm).position = position;
    }

    pub fn position(&self, arm: ArmId) -> JointPosition {
        self.state.lock().arm(arm).position
    }

    /// The next `reads` reads of `arm` time out
    pub fn drop_reads(&self, arm: ArmId, reads: u32) {
        self.state.lock().arm(arm).unavailable_reads = reads;
    }

    /// Every bus access to `arm` fails until cleared
    pub fn inject_fault(&self, arm: ArmId, message: impl Into<String>) {
        self.state.lock().arm(arm).fault = Some(message.into());
    }

    pub fn clear_fault(&self, arm: ArmId) {
        self.state.lock().arm(arm).fault = None;
    }

    pub fn reads(&self, arm: ArmId) -> u64 {
        self.state.lock().arm(arm).reads
    }

    /// Successful position commands received
    pub fn writes(&self, arm: ArmId) -> u64 {
        self.state.lock().arm(arm).writes
    }

    pub fn is_prepared(&self, arm: ArmId) -> bool {
        self.state.lock().arm(arm).prepared
    }
}

/// Motor bus backed by a [`SimulatedRig`]
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    rig: SimulatedRig,
}

fn check_fault(arm: ArmId, state: &SimArm) -> Result<(), SourceFault> {
    match &state.fault {
        Some(message) => Err(SourceFault::new(arm.name(), message.clone())),
        None => Ok(()),
    }
}

impl MotorBus for SimulatedBus {
    fn prepare(&mut self, arm: ArmId) -> Result<(), SourceFault> {
        let mut state = self.rig.state.lock();
        let sim = state.arm(arm);
        check_fault(arm, sim)?;
        sim.prepared = true;
        Ok(())
    }

    fn read_positions(&mut self, arm: ArmId, _timeout: Duration) -> SampleResult<JointPosition> {
        let mut state = self.rig.state.lock();
        let sim = state.arm(arm);
        check_fault(arm, sim)?;
        sim.reads += 1;
        if sim.unavailable_reads > 0 {
            sim.unavailable_reads -= 1;
            return Ok(Sample::Unavailable);
        }
        Ok(Sample::Ready(sim.position))
    }

    fn write_positions(&mut self, arm: ArmId, position: &JointPosition) -> Result<(), SourceFault> {
        let mut state = self.rig.state.lock();
        let sim = state.arm(arm);
        check_fault(arm, sim)?;
        sim.position = *position;
        sim.writes += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct SimCamera {
    skip: u32,
    fault: Option<String>,
    served: u64,
}

#[derive(Debug)]
struct CameraRigState {
    resolutions: [(u32, u32); 2],
    cameras: [SimCamera; 2],
}

/// Two simulated cameras producing moving gradient images
#[derive(Debug, Clone)]
pub struct SimulatedCameras {
    state: Arc<Mutex<CameraRigState>>,
}

impl SimulatedCameras {
    /// Both cameras at the same resolution
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_resolutions([(width, height); 2])
    }

    pub fn with_resolutions(resolutions: [(u32, u32); 2]) -> Self {
        Self {
            state: Arc::new(Mutex::new(CameraRigState {
                resolutions,
                cameras: [SimCamera::default(), SimCamera::default()],
            })),
        }
    }

    /// An SDK handle serving both cameras
    pub fn sdk(&self) -> SimulatedCameraSdk {
        SimulatedCameraSdk {
            cameras: self.clone(),
        }
    }

    /// The next `polls` polls of `camera` return nothing
    pub fn skip_frames(&self, camera: CameraId, polls: u32) {
        self.state.lock().cameras[camera.index()].skip = polls;
    }

    pub fn inject_fault(&self, camera: CameraId, message: impl Into<String>) {
        self.state.lock().cameras[camera.index()].fault = Some(message.into());
    }

    pub fn clear_fault(&self, camera: CameraId) {
        self.state.lock().cameras[camera.index()].fault = None;
    }

    /// Images handed out so far
    pub fn served(&self, camera: CameraId) -> u64 {
        self.state.lock().cameras[camera.index()].served
    }
}

/// Camera SDK backed by [`SimulatedCameras`]
#[derive(Debug, Clone)]
pub struct SimulatedCameraSdk {
    cameras: SimulatedCameras,
}

fn gradient(width: u32, height: u32, phase: u64, channel_bias: u8) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            let base = (x as u64 + y as u64 + phase) as u8;
            rgb.push(base);
            rgb.push(base.wrapping_add(channel_bias));
            rgb.push((y as u64 + phase) as u8);
        }
    }
    rgb
}

impl CameraSdk for SimulatedCameraSdk {
    fn latest_frame(&mut self, camera: CameraId) -> Result<Option<RawImage>, SourceFault> {
        let mut state = self.cameras.state.lock();
        let (width, height) = state.resolutions[camera.index()];
        let sim = &mut state.cameras[camera.index()];
        if let Some(message) = &sim.fault {
            return Err(SourceFault::new(camera.name(), message.clone()));
        }
        if sim.skip > 0 {
            sim.skip -= 1;
            return Ok(None);
        }
        sim.served += 1;
        let bias = if camera == CameraId::Camera1 { 0 } else { 128 };
        Ok(Some(RawImage {
            width,
            height,
            rgb: gradient(width, height, sim.served, bias),
        }))
    }
}

/// Session hardware wired to a simulated rig and simulated cameras.
/// The rig and camera handles stay usable for scripting.
pub fn simulated_hardware(
    config: &SessionConfig,
    clock: SharedClock,
) -> (SessionHardware, SimulatedRig, SimulatedCameras) {
    let rig = SimulatedRig::new();
    let [cam_1, cam_2] = &config.cameras;
    let cameras = SimulatedCameras::with_resolutions([
        (cam_1.width, cam_1.height),
        (cam_2.width, cam_2.height),
    ]);
    let timeout = config.teleop.read_timeout();

    let leader = BusArm::new(
        ArmId::Leader,
        Box::new(rig.bus()),
        &config.leader,
        config.position_unit,
        timeout,
    );
    let follower = BusArm::new(
        ArmId::Follower,
        Box::new(rig.bus()),
        &config.follower,
        config.position_unit,
        timeout,
    );

    let camera_1: Arc<dyn CameraSource> = Arc::new(ThreadedCamera::new(
        CameraId::Camera1,
        Box::new(cameras.sdk()),
        cam_1.clone(),
        clock.clone(),
    ));
    let camera_2: Arc<dyn CameraSource> = Arc::new(ThreadedCamera::new(
        CameraId::Camera2,
        Box::new(cameras.sdk()),
        cam_2.clone(),
        clock,
    ));

    let hardware = SessionHardware {
        leader: Box::new(leader),
        follower: Box::new(follower),
        cameras: [camera_1, camera_2],
    };
    (hardware, rig, cameras)
}
