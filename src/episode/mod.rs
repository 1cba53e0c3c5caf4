//! Recorded episodes
//!
//! - Data model for synchronized frames and finalized episodes
//! - The on-disk episode container
//! - Episode number allocation and atomic persistence

pub mod format;
pub mod numbering;
pub mod types;
pub mod writer;

pub use format::{read_episode, read_header, EpisodeHeader, EPISODE_EXTENSION};
pub use numbering::{episode_file_name, list_episodes, EpisodeNumbering};
pub use types::{
    CameraFrame, CameraId, Episode, EpisodeColumns, EpisodeMetadata, FrameFlags, Joint, JointMap,
    JointPosition, PositionUnit, SensorFrame, JOINT_COUNT,
};
pub use writer::EpisodeWriter;
