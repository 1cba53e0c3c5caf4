//! Arm and camera sources
//!
//! The leaf sources the control loops sample, built on the motor bus and
//! camera SDK interfaces.

pub mod camera;
pub mod joint;
pub mod sim;
pub mod traits;

pub use camera::ThreadedCamera;
pub use joint::BusArm;
pub use traits::{
    ArmId, CameraSdk, CameraSource, CapturedFrame, FollowerArm, JointActuator, JointSource,
    MotorBus, RawImage, Sample, SampleResult,
};
