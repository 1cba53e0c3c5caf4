//! Atomic episode persistence
//!
//! An episode is streamed into a hidden temporary file in the output
//! directory, flushed and synced, then renamed to its final name. The final
//! name never refers to a partial file, and an existing file is never
//! overwritten. When anything fails after the temporary file exists, it is
//! kept on disk for diagnosis.

use super::format::write_episode;
use super::numbering::{episode_file_name, temp_file_prefix};
use super::types::Episode;
use crate::utils::WriteFault;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Writes finalized episodes into one output directory
#[derive(Debug, Clone)]
pub struct EpisodeWriter {
    dir: PathBuf,
}

impl EpisodeWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path an episode number is persisted to
    pub fn final_path(&self, episode_num: u64) -> PathBuf {
        self.dir.join(episode_file_name(episode_num))
    }

    /// Persist `episode`, consuming it. Returns the final path.
    pub fn write(&self, episode: Episode) -> Result<PathBuf, WriteFault> {
        let episode_num = episode.episode_num();
        let final_path = self.final_path(episode_num);

        tracing::info!(
            "Saving episode {} ({} frames) to {:?}",
            episode_num,
            episode.frame_count(),
            final_path
        );

        let temp = tempfile::Builder::new()
            .prefix(&temp_file_prefix(episode_num))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| WriteFault {
                episode_num,
                reason: format!("cannot create temporary file: {e}"),
                temp_path: None,
            })?;

        if let Err(e) = Self::fill(&temp, &episode) {
            return Err(Self::retain(temp, episode_num, format!("write failed: {e}")));
        }
        drop(episode);

        match temp.persist_noclobber(&final_path) {
            Ok(_) => {}
            Err(e) => {
                let reason = format!("rename to {:?} failed: {}", final_path, e.error);
                return Err(Self::retain(e.file, episode_num, reason));
            }
        }

        if let Err(e) = File::open(&self.dir).and_then(|d| d.sync_all()) {
            tracing::debug!("Could not sync directory {:?}: {}", self.dir, e);
        }

        tracing::info!("Episode {} saved to {:?}", episode_num, final_path);
        Ok(final_path)
    }

    fn fill(temp: &NamedTempFile, episode: &Episode) -> std::io::Result<()> {
        let file = write_episode(episode, BufWriter::new(temp.as_file()))?
            .into_inner()
            .map_err(|e| e.into_error())?;
        file.sync_all()
    }

    /// Keep the temporary artifact on disk and describe the failure
    fn retain(temp: NamedTempFile, episode_num: u64, reason: String) -> WriteFault {
        let temp_path = match temp.into_temp_path().keep() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!("Could not retain temporary episode file: {}", e);
                None
            }
        };

        tracing::error!(
            "Episode {} not saved: {} (temporary file: {:?})",
            episode_num,
            reason,
            temp_path
        );

        WriteFault {
            episode_num,
            reason,
            temp_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::format::read_episode;
    use crate::episode::types::{
        CameraFrame, EpisodeColumns, EpisodeMetadata, FrameFlags, JointPosition, PositionUnit,
        SensorFrame,
    };
    use chrono::Utc;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn episode(num: u64, frames: usize) -> Episode {
        let mut columns = EpisodeColumns::default();
        for i in 0..frames {
            columns.push(SensorFrame {
                timestamp: i as f64 * 0.1,
                leader: JointPosition::new([1.0, 2.0, 3.0, 4.0, 5.0, i as f64]),
                follower: JointPosition::new([0.0; 6]),
                camera_1: Arc::new(CameraFrame::new(2, 2, vec![i as u8; 12], 0.0).unwrap()),
                camera_2: Arc::new(CameraFrame::new(2, 2, vec![9; 12], 0.0).unwrap()),
                flags: FrameFlags::default(),
            });
        }
        let metadata = EpisodeMetadata {
            episode_num: num,
            frame_count: frames as u64,
            duration: (frames - 1) as f64 * 0.1,
            date: Utc::now(),
            fps: 10.0,
            target_fps: 10.0,
            position_unit: PositionUnit::Ticks,
            session_id: Uuid::new_v4(),
            leader_stale_frames: 0,
            arm_fault_frames: 0,
            camera_1_stale_frames: 0,
            camera_2_stale_frames: 0,
            camera_fault_frames: 0,
            overrun_count: 0,
        };
        Episode::new(metadata, columns).unwrap()
    }

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_persists_under_final_name() {
        let dir = tempdir().unwrap();
        let writer = EpisodeWriter::new(dir.path());
        let original = episode(3, 5);

        let path = writer.write(original.clone()).unwrap();

        assert_eq!(path, dir.path().join("episode_000003.epk"));
        assert_eq!(dir_names(dir.path()), vec!["episode_000003.epk"]);
        assert_eq!(read_episode(&path).unwrap(), original);
    }

    #[test]
    fn test_existing_file_is_not_overwritten() {
        let dir = tempdir().unwrap();
        let writer = EpisodeWriter::new(dir.path());
        let final_path = writer.final_path(1);
        fs::write(&final_path, b"keep me").unwrap();

        let fault = writer.write(episode(1, 2)).unwrap_err();

        assert_eq!(fs::read(&final_path).unwrap(), b"keep me");
        let temp_path = fault.temp_path.expect("temporary artifact retained");
        assert!(temp_path.exists());
        let temp_name = temp_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(temp_name.starts_with(".episode_000001."));
        assert_eq!(fault.episode_num, 1);
    }

    #[test]
    fn test_missing_directory_reports_fault() {
        let dir = tempdir().unwrap();
        let writer = EpisodeWriter::new(dir.path().join("missing"));

        let fault = writer.write(episode(0, 2)).unwrap_err();

        assert!(fault.temp_path.is_none());
        assert!(!writer.final_path(0).exists());
    }
}
