//! Episode data model
//!
//! Joint positions, camera rasters, the synchronized per-tick `SensorFrame`
//! and the finalized, column-oriented `Episode`.

use crate::utils::FormatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Number of motors per arm
pub const JOINT_COUNT: usize = 6;

/// The six joints of one arm, in bus order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Joint {
    ShoulderPan,
    ShoulderLift,
    ElbowFlex,
    WristFlex,
    WristRoll,
    Gripper,
}

impl Joint {
    pub const ALL: [Joint; JOINT_COUNT] = [
        Joint::ShoulderPan,
        Joint::ShoulderLift,
        Joint::ElbowFlex,
        Joint::WristFlex,
        Joint::WristRoll,
        Joint::Gripper,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Joint::ShoulderPan => "shoulder_pan",
            Joint::ShoulderLift => "shoulder_lift",
            Joint::ElbowFlex => "elbow_flex",
            Joint::WristFlex => "wrist_flex",
            Joint::WristRoll => "wrist_roll",
            Joint::Gripper => "gripper",
        }
    }
}

/// Fixed-size per-joint table. Every joint always has an entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointMap<T>(pub [T; JOINT_COUNT]);

impl<T: Copy> JointMap<T> {
    pub fn splat(value: T) -> Self {
        Self([value; JOINT_COUNT])
    }
}

impl<T> JointMap<T> {
    pub fn iter(&self) -> impl Iterator<Item = (Joint, &T)> {
        Joint::ALL.iter().copied().zip(self.0.iter())
    }
}

impl<T: Default + Copy> Default for JointMap<T> {
    fn default() -> Self {
        Self([T::default(); JOINT_COUNT])
    }
}

impl<T> Index<Joint> for JointMap<T> {
    type Output = T;

    fn index(&self, joint: Joint) -> &T {
        &self.0[joint.index()]
    }
}

impl<T> IndexMut<Joint> for JointMap<T> {
    fn index_mut(&mut self, joint: Joint) -> &mut T {
        &mut self.0[joint.index()]
    }
}

/// Unit of every `JointPosition` in a session, fixed at the arm boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionUnit {
    /// Raw encoder ticks (0..4095 on the SO-101 servos)
    #[default]
    Ticks,
    Radians,
}

impl fmt::Display for PositionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionUnit::Ticks => write!(f, "ticks"),
            PositionUnit::Radians => write!(f, "radians"),
        }
    }
}

/// One sampled position per motor. Immutable once sampled.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JointPosition([f64; JOINT_COUNT]);

impl JointPosition {
    pub fn new(values: [f64; JOINT_COUNT]) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f64; JOINT_COUNT] {
        &self.0
    }

    pub fn get(&self, joint: Joint) -> f64 {
        self.0[joint.index()]
    }

    /// Largest per-joint absolute difference to `other`
    pub fn max_abs_delta(&self, other: &JointPosition) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// Move toward `target`, each joint by at most `max_step`
    pub fn step_toward(&self, target: &JointPosition, max_step: f64) -> JointPosition {
        let mut next = self.0;
        for (current, goal) in next.iter_mut().zip(target.0.iter()) {
            let delta = (goal - *current).clamp(-max_step, max_step);
            *current += delta;
        }
        JointPosition(next)
    }

    /// Apply a per-joint transform
    pub fn map(&self, mut f: impl FnMut(Joint, f64) -> f64) -> JointPosition {
        let mut out = self.0;
        for joint in Joint::ALL {
            out[joint.index()] = f(joint, self.0[joint.index()]);
        }
        JointPosition(out)
    }
}

/// Which of the two cameras
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraId {
    Camera1,
    Camera2,
}

impl CameraId {
    pub const ALL: [CameraId; 2] = [CameraId::Camera1, CameraId::Camera2];

    pub fn index(self) -> usize {
        match self {
            CameraId::Camera1 => 0,
            CameraId::Camera2 => 1,
        }
    }

    /// Dataset / source name
    pub fn name(self) -> &'static str {
        match self {
            CameraId::Camera1 => "camera_1",
            CameraId::Camera2 => "camera_2",
        }
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raster size did not match `height * width * 3`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("frame has {actual} bytes, expected {expected} for {width}x{height} RGB")]
pub struct FrameShapeError {
    pub width: u32,
    pub height: u32,
    pub expected: usize,
    pub actual: usize,
}

/// A fixed-resolution RGB raster and its capture time. Immutable once captured.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
    captured_at: Option<f64>,
}

impl CameraFrame {
    /// `data` is row-major `height x width x 3`
    pub fn new(
        width: u32,
        height: u32,
        data: Vec<u8>,
        captured_at: f64,
    ) -> Result<Self, FrameShapeError> {
        let expected = Self::byte_len(width, height);
        if data.len() != expected {
            return Err(FrameShapeError {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
            captured_at: Some(captured_at),
        })
    }

    /// Rebuild a frame read back from storage
    pub(crate) fn restore(
        width: u32,
        height: u32,
        data: Vec<u8>,
        captured_at: Option<f64>,
    ) -> Result<Self, FrameShapeError> {
        let mut frame = Self::new(width, height, data, 0.0)?;
        frame.captured_at = captured_at;
        Ok(frame)
    }

    /// All-black raster, used only when a camera has never delivered a frame
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; Self::byte_len(width, height)],
            captured_at: None,
        }
    }

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Session-clock time of capture, in seconds. `None` for a blank raster.
    pub fn captured_at(&self) -> Option<f64> {
        self.captured_at
    }
}

/// Per-frame data quality flags, stored on disk as [`FrameFlags::bits`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    /// Leader position held past the staleness bound
    pub leader_stale: bool,
    /// An arm source is faulted; joint values are the last known ones
    pub arm_fault: bool,
    /// Camera produced nothing newer than the staleness bound
    pub camera_stale: [bool; 2],
    /// Camera decode path reported a source fault
    pub camera_fault: [bool; 2],
    /// The sampling tick started later than the overrun threshold
    pub overrun: bool,
}

impl FrameFlags {
    const LEADER_STALE: u8 = 1 << 0;
    const ARM_FAULT: u8 = 1 << 1;
    const CAMERA_1_STALE: u8 = 1 << 2;
    const CAMERA_2_STALE: u8 = 1 << 3;
    const CAMERA_1_FAULT: u8 = 1 << 4;
    const CAMERA_2_FAULT: u8 = 1 << 5;
    const OVERRUN: u8 = 1 << 6;

    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        let mut set = |cond: bool, bit: u8| {
            if cond {
                bits |= bit;
            }
        };
        set(self.leader_stale, Self::LEADER_STALE);
        set(self.arm_fault, Self::ARM_FAULT);
        set(self.camera_stale[0], Self::CAMERA_1_STALE);
        set(self.camera_stale[1], Self::CAMERA_2_STALE);
        set(self.camera_fault[0], Self::CAMERA_1_FAULT);
        set(self.camera_fault[1], Self::CAMERA_2_FAULT);
        set(self.overrun, Self::OVERRUN);
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            leader_stale: bits & Self::LEADER_STALE != 0,
            arm_fault: bits & Self::ARM_FAULT != 0,
            camera_stale: [
                bits & Self::CAMERA_1_STALE != 0,
                bits & Self::CAMERA_2_STALE != 0,
            ],
            camera_fault: [
                bits & Self::CAMERA_1_FAULT != 0,
                bits & Self::CAMERA_2_FAULT != 0,
            ],
            overrun: bits & Self::OVERRUN != 0,
        }
    }
}

/// One synchronized sampling tick
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFrame {
    /// Session-clock time of the tick, in seconds
    pub timestamp: f64,
    pub leader: JointPosition,
    pub follower: JointPosition,
    pub camera_1: Arc<CameraFrame>,
    pub camera_2: Arc<CameraFrame>,
    pub flags: FrameFlags,
}

/// Attributes attached to every episode file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    pub episode_num: u64,
    pub frame_count: u64,
    /// Seconds between the first and last frame
    pub duration: f64,
    pub date: DateTime<Utc>,
    /// Effective sampling rate (frame_count / duration)
    pub fps: f64,
    /// Configured sampler rate
    pub target_fps: f64,
    pub position_unit: PositionUnit,
    pub session_id: Uuid,
    pub leader_stale_frames: u64,
    pub arm_fault_frames: u64,
    pub camera_1_stale_frames: u64,
    pub camera_2_stale_frames: u64,
    pub camera_fault_frames: u64,
    pub overrun_count: u64,
}

/// Per-frame arrays of an episode, all of identical length
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeColumns {
    pub timestamps: Vec<f64>,
    pub leader_positions: Vec<JointPosition>,
    pub follower_positions: Vec<JointPosition>,
    pub camera_1: Vec<Arc<CameraFrame>>,
    pub camera_2: Vec<Arc<CameraFrame>>,
    pub frame_flags: Vec<FrameFlags>,
}

impl EpisodeColumns {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity),
            leader_positions: Vec::with_capacity(capacity),
            follower_positions: Vec::with_capacity(capacity),
            camera_1: Vec::with_capacity(capacity),
            camera_2: Vec::with_capacity(capacity),
            frame_flags: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, frame: SensorFrame) {
        self.timestamps.push(frame.timestamp);
        self.leader_positions.push(frame.leader);
        self.follower_positions.push(frame.follower);
        self.camera_1.push(frame.camera_1);
        self.camera_2.push(frame.camera_2);
        self.frame_flags.push(frame.flags);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    fn lengths(&self) -> [(&'static str, usize); 6] {
        [
            ("timestamps", self.timestamps.len()),
            ("leader_positions", self.leader_positions.len()),
            ("follower_positions", self.follower_positions.len()),
            ("camera_1", self.camera_1.len()),
            ("camera_2", self.camera_2.len()),
            ("frame_flags", self.frame_flags.len()),
        ]
    }
}

/// A finalized recording: metadata plus length-consistent per-frame arrays
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    metadata: EpisodeMetadata,
    columns: EpisodeColumns,
}

impl Episode {
    /// Fails unless every array has exactly `metadata.frame_count` entries and
    /// timestamps strictly increase.
    pub fn new(metadata: EpisodeMetadata, columns: EpisodeColumns) -> Result<Self, FormatError> {
        for (name, len) in columns.lengths() {
            if len as u64 != metadata.frame_count {
                return Err(FormatError::Malformed {
                    name: name.to_string(),
                    reason: format!(
                        "length {} does not match frame_count {}",
                        len, metadata.frame_count
                    ),
                });
            }
        }

        if columns.timestamps.windows(2).any(|w| w[1] <= w[0]) {
            return Err(FormatError::Malformed {
                name: "timestamps".to_string(),
                reason: "timestamps are not strictly increasing".to_string(),
            });
        }

        Ok(Self { metadata, columns })
    }

    pub fn metadata(&self) -> &EpisodeMetadata {
        &self.metadata
    }

    pub fn columns(&self) -> &EpisodeColumns {
        &self.columns
    }

    pub fn episode_num(&self) -> u64 {
        self.metadata.episode_num
    }

    pub fn frame_count(&self) -> usize {
        self.columns.len()
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.columns.timestamps
    }

    pub fn leader_positions(&self) -> &[JointPosition] {
        &self.columns.leader_positions
    }

    pub fn follower_positions(&self) -> &[JointPosition] {
        &self.columns.follower_positions
    }

    pub fn camera(&self, camera: CameraId) -> &[Arc<CameraFrame>] {
        match camera {
            CameraId::Camera1 => &self.columns.camera_1,
            CameraId::Camera2 => &self.columns.camera_2,
        }
    }

    pub fn frame_flags(&self) -> &[FrameFlags] {
        &self.columns.frame_flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_toward_clamps_each_joint() {
        let current = JointPosition::new([0.0; JOINT_COUNT]);
        let target = JointPosition::new([100.0, -100.0, 5.0, -5.0, 0.0, 40.0]);

        let next = current.step_toward(&target, 10.0);
        assert_eq!(next.values(), &[10.0, -10.0, 5.0, -5.0, 0.0, 10.0]);
        assert!(next.max_abs_delta(&current) <= 10.0);
    }

    #[test]
    fn test_joint_map_indexing() {
        let mut map = JointMap::splat(1.0);
        map[Joint::Gripper] = -1.0;
        assert_eq!(map[Joint::Gripper], -1.0);
        assert_eq!(map[Joint::ShoulderPan], 1.0);
        assert_eq!(map.iter().count(), JOINT_COUNT);
    }

    #[test]
    fn test_camera_frame_shape_checked() {
        assert!(CameraFrame::new(4, 2, vec![0; 24], 0.0).is_ok());
        let err = CameraFrame::new(4, 2, vec![0; 23], 0.0).unwrap_err();
        assert_eq!(err.expected, 24);
        assert_eq!(err.actual, 23);
    }

    #[test]
    fn test_frame_flags_bits() {
        let flags = FrameFlags {
            leader_stale: true,
            camera_stale: [false, true],
            overrun: true,
            ..Default::default()
        };
        assert_eq!(FrameFlags::from_bits(flags.bits()), flags);
        assert_eq!(FrameFlags::default().bits(), 0);
    }

    #[test]
    fn test_episode_rejects_inconsistent_columns() {
        let metadata = EpisodeMetadata {
            episode_num: 0,
            frame_count: 2,
            duration: 0.0,
            date: Utc::now(),
            fps: 0.0,
            target_fps: 30.0,
            position_unit: PositionUnit::Ticks,
            session_id: Uuid::nil(),
            leader_stale_frames: 0,
            arm_fault_frames: 0,
            camera_1_stale_frames: 0,
            camera_2_stale_frames: 0,
            camera_fault_frames: 0,
            overrun_count: 0,
        };
        let mut columns = EpisodeColumns::default();
        columns.push(SensorFrame {
            timestamp: 0.0,
            leader: JointPosition::default(),
            follower: JointPosition::default(),
            camera_1: Arc::new(CameraFrame::blank(2, 2)),
            camera_2: Arc::new(CameraFrame::blank(2, 2)),
            flags: FrameFlags::default(),
        });

        assert!(Episode::new(metadata, columns).is_err());
    }
}
