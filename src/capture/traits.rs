//! Capture trait definitions
//!
//! The leaf sources the control loops read from, and the external
//! collaborators (motor bus, camera SDK) those sources are built on.

use crate::episode::{CameraFrame, CameraId, JointPosition};
use crate::utils::SourceFault;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a bounded read that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum Sample<T> {
    /// A fresh value
    Ready(T),
    /// Nothing new within the timeout. Transient, not an error.
    Unavailable,
}

impl<T> Sample<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Sample::Ready(value) => Some(value),
            Sample::Unavailable => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Sample::Ready(_))
    }
}

pub type SampleResult<T> = Result<Sample<T>, SourceFault>;

/// Which arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmId {
    /// Human-moved input arm
    Leader,
    /// Motor-driven arm that mirrors the leader
    Follower,
}

impl ArmId {
    pub fn name(self) -> &'static str {
        match self {
            ArmId::Leader => "leader",
            ArmId::Follower => "follower",
        }
    }
}

impl fmt::Display for ArmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Motor bus transport. Positions on this interface are raw encoder ticks.
pub trait MotorBus: Send {
    /// Put an arm in position-control mode with torque enabled
    fn prepare(&mut self, _arm: ArmId) -> Result<(), SourceFault> {
        Ok(())
    }

    /// Read all motor positions, giving up after `timeout`
    fn read_positions(&mut self, arm: ArmId, timeout: Duration) -> SampleResult<JointPosition>;

    /// Command goal positions for all motors
    fn write_positions(&mut self, arm: ArmId, position: &JointPosition) -> Result<(), SourceFault>;
}

/// Undecorated RGB image as delivered by a camera SDK
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    /// Row-major `height x width x 3`
    pub rgb: Vec<u8>,
}

/// Camera capture SDK
pub trait CameraSdk: Send {
    /// Newest captured image, or `None` if nothing new has arrived
    fn latest_frame(&mut self, camera: CameraId) -> Result<Option<RawImage>, SourceFault>;
}

/// Reads one arm's positions, already converted to session units
pub trait JointSource: Send {
    fn arm(&self) -> ArmId;

    /// Bounded read. `Unavailable` when the bus had nothing within the timeout.
    fn sample(&mut self) -> SampleResult<JointPosition>;
}

/// Commands one arm's positions, given in session units
pub trait JointActuator: Send {
    /// One-time setup before the first command of a session
    fn prepare(&mut self) -> Result<(), SourceFault> {
        Ok(())
    }

    fn command(&mut self, target: &JointPosition) -> Result<(), SourceFault>;
}

/// An arm that can be both read and commanded
pub trait FollowerArm: JointSource + JointActuator {}

impl<T: JointSource + JointActuator> FollowerArm for T {}

/// A decoded camera frame tagged with the decode path's sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Increases by one for every frame the decode path publishes
    pub seq: u64,
    pub frame: Arc<CameraFrame>,
}

/// One camera's decoded frame stream
pub trait CameraSource: Send + Sync {
    fn camera(&self) -> CameraId;

    /// Start the decode path
    fn start(&self) -> Result<(), SourceFault> {
        Ok(())
    }

    /// Stop the decode path. Safe to call when not started.
    fn stop(&self) {}

    /// Wait up to `timeout` for the next frame the decode path publishes
    fn sample(&self, timeout: Duration) -> SampleResult<CapturedFrame>;

    /// Most recent decoded frame, without waiting for a new capture.
    /// `Err` once the decode path has faulted.
    fn latest_or_none(&self) -> Result<Option<CapturedFrame>, SourceFault>;
}
