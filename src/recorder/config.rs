//! Session configuration
//!
//! Everything that used to be module-level tuning (cadences, clamps,
//! calibration tables) is passed in through [`SessionConfig`] at construction.

use crate::episode::{Joint, JointMap, PositionUnit};
use crate::utils::ConfigError;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Encoder counts per revolution
pub const ENCODER_RESOLUTION: f64 = 4096.0;

/// Per-joint mapping between raw encoder ticks and radians
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JointCalibration {
    /// Raw tick value that corresponds to zero radians
    pub home: f64,
    /// Added to the raw reading before conversion
    pub encoder_offset: f64,
    /// Direction/scale; -1 inverts the joint
    pub multiplier: f64,
}

impl Default for JointCalibration {
    fn default() -> Self {
        Self {
            home: 2048.0,
            encoder_offset: 0.0,
            multiplier: 1.0,
        }
    }
}

impl JointCalibration {
    pub fn ticks_to_radians(&self, raw: f64) -> f64 {
        let mut delta = raw + self.encoder_offset - self.home;
        let half = ENCODER_RESOLUTION / 2.0;
        if delta > half {
            delta -= ENCODER_RESOLUTION;
        } else if delta < -half {
            delta += ENCODER_RESOLUTION;
        }
        delta / ENCODER_RESOLUTION * TAU * self.multiplier
    }

    pub fn radians_to_ticks(&self, radians: f64) -> f64 {
        let delta = radians / self.multiplier / TAU * ENCODER_RESOLUTION;
        (self.home + delta - self.encoder_offset).rem_euclid(ENCODER_RESOLUTION)
    }
}

/// Raw position range a joint may be commanded to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub min: f64,
    pub max: f64,
}

impl Default for JointLimits {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: ENCODER_RESOLUTION - 1.0,
        }
    }
}

impl JointLimits {
    pub fn clamp(&self, raw: f64) -> f64 {
        raw.clamp(self.min, self.max)
    }
}

/// One arm on the motor bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    /// Serial device of the bus
    pub port: String,
    pub baud_rate: u32,
    /// Bus id of each joint's servo
    pub motor_ids: JointMap<u8>,
    pub calibration: JointMap<JointCalibration>,
    pub limits: JointMap<JointLimits>,
}

impl ArmConfig {
    fn with_port(port: &str) -> Self {
        Self {
            port: port.to_string(),
            baud_rate: 1_000_000,
            motor_ids: JointMap([1, 2, 3, 4, 5, 6]),
            calibration: JointMap::default(),
            limits: JointMap::default(),
        }
    }

    pub fn leader() -> Self {
        Self::with_port("/dev/ttyACM1")
    }

    pub fn follower() -> Self {
        Self::with_port("/dev/ttyACM0")
    }
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self::follower()
    }
}

/// One camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Native capture rate of the decode path
    pub fps: f64,
}

impl CameraConfig {
    fn with_device(device: &str) -> Self {
        Self {
            device: device.to_string(),
            width: 640,
            height: 480,
            fps: 30.0,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self::with_device("/dev/video0")
    }
}

/// Mirroring loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleopConfig {
    pub rate_hz: f64,
    /// Largest per-tick move of any follower joint, in session units
    pub max_step: f64,
    /// Consecutive ticks a held leader position may be reused
    pub max_stale_ticks: u32,
    /// Bound on each bus read
    pub read_timeout_ms: u64,
}

impl Default for TeleopConfig {
    fn default() -> Self {
        Self {
            rate_hz: 50.0,
            max_step: 40.0,
            max_stale_ticks: 5,
            read_timeout_ms: 50,
        }
    }
}

impl TeleopConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Synchronized sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub fps: f64,
    /// Ticks a camera may go without a new frame before its data is flagged stale
    pub camera_staleness_ticks: u32,
    /// A tick starting later than this past its deadline counts as an overrun
    pub overrun_threshold_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            camera_staleness_ticks: 3,
            overrun_threshold_ms: 16,
        }
    }
}

impl SamplerConfig {
    pub fn overrun_threshold(&self) -> Duration {
        Duration::from_millis(self.overrun_threshold_ms)
    }
}

/// Complete configuration of a teleoperation/recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory episodes are written to
    pub output_dir: PathBuf,
    pub position_unit: PositionUnit,
    pub teleop: TeleopConfig,
    pub sampler: SamplerConfig,
    pub leader: ArmConfig,
    pub follower: ArmConfig,
    pub cameras: [CameraConfig; 2],
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/episodes"),
            position_unit: PositionUnit::Ticks,
            teleop: TeleopConfig::default(),
            sampler: SamplerConfig::default(),
            leader: ArmConfig::leader(),
            follower: ArmConfig::follower(),
            cameras: [
                CameraConfig::with_device("/dev/video0"),
                CameraConfig::with_device("/dev/video2"),
            ],
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl SessionConfig {
    /// Read a JSON configuration file and validate it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!("Loaded session config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.teleop.rate_hz.is_finite() && self.teleop.rate_hz > 0.0) {
            return Err(invalid("teleop.rate_hz", "must be a positive rate"));
        }
        if !(self.teleop.max_step.is_finite() && self.teleop.max_step > 0.0) {
            return Err(invalid("teleop.max_step", "must be positive"));
        }
        if self.teleop.max_stale_ticks == 0 {
            return Err(invalid("teleop.max_stale_ticks", "must be at least 1"));
        }
        if self.teleop.read_timeout_ms == 0 {
            return Err(invalid("teleop.read_timeout_ms", "must be at least 1"));
        }
        if !(self.sampler.fps.is_finite() && self.sampler.fps > 0.0) {
            return Err(invalid("sampler.fps", "must be a positive rate"));
        }
        if self.sampler.camera_staleness_ticks == 0 {
            return Err(invalid("sampler.camera_staleness_ticks", "must be at least 1"));
        }
        if self.sampler.fps > self.teleop.rate_hz {
            tracing::warn!(
                "Sampler rate {} Hz exceeds teleop rate {} Hz; joint samples will repeat",
                self.sampler.fps,
                self.teleop.rate_hz
            );
        }

        for (name, camera) in ["cameras[0]", "cameras[1]"].iter().zip(&self.cameras) {
            if camera.width == 0 || camera.height == 0 {
                return Err(invalid("cameras", format!("{name} has zero resolution")));
            }
            if !(camera.fps.is_finite() && camera.fps > 0.0) {
                return Err(invalid("cameras", format!("{name} fps must be positive")));
            }
        }

        for arm in [&self.leader, &self.follower] {
            for joint in Joint::ALL {
                let cal = arm.calibration[joint];
                if cal.multiplier == 0.0 || !cal.multiplier.is_finite() {
                    return Err(invalid(
                        "calibration.multiplier",
                        format!("{} on {} must be non-zero", joint.name(), arm.port),
                    ));
                }
                let limits = arm.limits[joint];
                if limits.min > limits.max {
                    return Err(invalid(
                        "limits",
                        format!("{} on {} has min > max", joint.name(), arm.port),
                    ));
                }
            }
        }

        Ok(())
    }
}
