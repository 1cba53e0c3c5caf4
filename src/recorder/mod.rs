//! Teleoperation and recording pipeline
//!
//! - TeleopLoop mirrors the leader onto the follower
//! - SyncSampler assembles aligned frames from arms and cameras
//! - EpisodeBuffer collects frames for one recording
//! - SessionController runs the state machine and hands episodes to the writer

pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod sampler;
pub mod slot;
pub mod state;
pub mod teleop;

pub use buffer::EpisodeBuffer;
pub use config::{
    ArmConfig, CameraConfig, JointCalibration, JointLimits, SamplerConfig, SessionConfig,
    TeleopConfig,
};
pub use coordinator::{SessionController, SessionHardware};
pub use sampler::{ArmedBuffer, SamplerLinks, SyncSampler};
pub use slot::LatestSlot;
pub use state::{
    CommandOutcome, FaultFlags, SessionEvent, SessionState, SessionStatus, StatusBoard,
    WriteOutcome,
};
pub use teleop::{ArmSnapshot, TeleopLoop};
