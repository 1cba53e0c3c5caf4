//! Accumulation of one recording span

use crate::episode::{Episode, EpisodeColumns, EpisodeMetadata, PositionUnit, SensorFrame};
use crate::utils::FormatError;
use chrono::Utc;
use uuid::Uuid;

/// Frames of one episode, held in memory until finalized
#[derive(Debug)]
pub struct EpisodeBuffer {
    episode_num: u64,
    session_id: Uuid,
    target_fps: f64,
    position_unit: PositionUnit,
    columns: EpisodeColumns,
    leader_stale_frames: u64,
    arm_fault_frames: u64,
    camera_stale_frames: [u64; 2],
    camera_fault_frames: u64,
    overrun_count: u64,
}

impl EpisodeBuffer {
    pub fn new(
        episode_num: u64,
        session_id: Uuid,
        target_fps: f64,
        position_unit: PositionUnit,
    ) -> Self {
        // Preallocate for a minute of frames; the vectors grow past that
        let capacity = (target_fps * 60.0).clamp(0.0, 1e5) as usize;
        Self {
            episode_num,
            session_id,
            target_fps,
            position_unit,
            columns: EpisodeColumns::with_capacity(capacity),
            leader_stale_frames: 0,
            arm_fault_frames: 0,
            camera_stale_frames: [0; 2],
            camera_fault_frames: 0,
            overrun_count: 0,
        }
    }

    pub fn episode_num(&self) -> u64 {
        self.episode_num
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Append a frame. A frame whose timestamp does not advance is dropped.
    pub fn push(&mut self, frame: SensorFrame) -> bool {
        if let Some(last) = self.columns.timestamps.last() {
            if frame.timestamp <= *last {
                tracing::warn!(
                    "Episode {}: dropping frame at {:.6}s, not after {:.6}s",
                    self.episode_num,
                    frame.timestamp,
                    last
                );
                return false;
            }
        }

        let flags = frame.flags;
        self.leader_stale_frames += u64::from(flags.leader_stale);
        self.arm_fault_frames += u64::from(flags.arm_fault);
        for (count, stale) in self.camera_stale_frames.iter_mut().zip(flags.camera_stale) {
            *count += u64::from(stale);
        }
        self.camera_fault_frames += u64::from(flags.camera_fault.iter().any(|f| *f));
        self.overrun_count += u64::from(flags.overrun);

        self.columns.push(frame);
        true
    }

    /// Stamp metadata and hand the frames over as an immutable episode
    pub fn finalize(self) -> Result<Episode, FormatError> {
        let frame_count = self.columns.len() as u64;
        let duration = match (self.columns.timestamps.first(), self.columns.timestamps.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let fps = if duration > 0.0 {
            frame_count as f64 / duration
        } else {
            0.0
        };

        let metadata = EpisodeMetadata {
            episode_num: self.episode_num,
            frame_count,
            duration,
            date: Utc::now(),
            fps,
            target_fps: self.target_fps,
            position_unit: self.position_unit,
            session_id: self.session_id,
            leader_stale_frames: self.leader_stale_frames,
            arm_fault_frames: self.arm_fault_frames,
            camera_1_stale_frames: self.camera_stale_frames[0],
            camera_2_stale_frames: self.camera_stale_frames[1],
            camera_fault_frames: self.camera_fault_frames,
            overrun_count: self.overrun_count,
        };

        tracing::debug!(
            "Finalized episode {}: {} frames over {:.3}s ({:.2} fps)",
            self.episode_num,
            frame_count,
            duration,
            fps
        );

        Episode::new(metadata, self.columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::format::{read_episode, write_episode};
    use crate::episode::{CameraFrame, FrameFlags, JointPosition};
    use std::sync::Arc;

    fn frame(timestamp: f64, flags: FrameFlags) -> SensorFrame {
        let image = Arc::new(CameraFrame::new(2, 1, vec![0; 6], timestamp).unwrap());
        SensorFrame {
            timestamp,
            leader: JointPosition::new([timestamp; 6]),
            follower: JointPosition::default(),
            camera_1: image.clone(),
            camera_2: image,
            flags,
        }
    }

    #[test]
    fn test_finalize_stamps_metadata() {
        let mut buffer = EpisodeBuffer::new(4, Uuid::new_v4(), 30.0, PositionUnit::Ticks);
        for i in 0..100 {
            assert!(buffer.push(frame(10.0 + i as f64 / 30.0, FrameFlags::default())));
        }

        let episode = buffer.finalize().unwrap();
        let meta = episode.metadata();
        assert_eq!(meta.episode_num, 4);
        assert_eq!(meta.frame_count, 100);
        assert!((meta.duration - 99.0 / 30.0).abs() < 1e-9);
        assert!((meta.fps - 100.0 / (99.0 / 30.0)).abs() < 1e-6);
        assert_eq!(episode.timestamps().len(), 100);
        assert_eq!(episode.camera(crate::episode::CameraId::Camera2).len(), 100);
    }

    #[test]
    fn test_counts_flags_and_drops_non_increasing() {
        let mut buffer = EpisodeBuffer::new(0, Uuid::new_v4(), 30.0, PositionUnit::Ticks);
        let stale = FrameFlags {
            camera_stale: [false, true],
            overrun: true,
            ..FrameFlags::default()
        };
        assert!(buffer.push(frame(1.0, stale)));
        assert!(!buffer.push(frame(1.0, FrameFlags::default())));
        assert!(buffer.push(frame(1.5, FrameFlags::default())));

        let meta = buffer.finalize().unwrap().metadata().clone();
        assert_eq!(meta.frame_count, 2);
        assert_eq!(meta.camera_2_stale_frames, 1);
        assert_eq!(meta.camera_1_stale_frames, 0);
        assert_eq!(meta.overrun_count, 1);
    }

    #[test]
    fn test_finalized_metadata_reads_back_exactly() {
        let dir = tempfile::tempdir().unwrap();
        for k in 0..40u64 {
            let start = 0.367 + k as f64 * 0.013_7;
            let mut buffer = EpisodeBuffer::new(k, Uuid::new_v4(), 30.0, PositionUnit::Ticks);
            for i in 0..(3 + k % 5) {
                let jitter = (i * 7 % 3) as f64 * 1e-4;
                buffer.push(frame(start + i as f64 / 29.97 + jitter, FrameFlags::default()));
            }
            let episode = buffer.finalize().unwrap();

            let path = dir.path().join(format!("{k}.epk"));
            write_episode(&episode, std::fs::File::create(&path).unwrap()).unwrap();
            let loaded = read_episode(&path).unwrap();
            assert_eq!(loaded.metadata(), episode.metadata(), "episode {k}");
            assert_eq!(loaded.timestamps(), episode.timestamps());
        }
    }

    #[test]
    fn test_single_frame_has_zero_duration() {
        let mut buffer = EpisodeBuffer::new(1, Uuid::new_v4(), 30.0, PositionUnit::Radians);
        buffer.push(frame(2.0, FrameFlags::default()));
        let meta = buffer.finalize().unwrap().metadata().clone();
        assert_eq!(meta.duration, 0.0);
        assert_eq!(meta.fps, 0.0);
        assert_eq!(meta.position_unit, PositionUnit::Radians);
    }
}
