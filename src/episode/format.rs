//! Episode container format
//!
//! One file per episode, laid out as
//!
//! ```text
//! [dataset blobs ...][header JSON][header length: u64 LE]["TLEP"]
//! ```
//!
//! The header carries the episode attributes and, per dataset, its name,
//! element type, shape, compression and byte range. Joint and timestamp
//! arrays are stored as raw little-endian values; camera rasters are
//! gzip-compressed. The footer layout lets the writer stream every array
//! straight to disk without knowing compressed sizes up front.

use super::types::{
    CameraFrame, CameraId, Episode, EpisodeColumns, EpisodeMetadata, FrameFlags, JointPosition,
    JOINT_COUNT,
};
use crate::utils::FormatError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// File extension of finalized episodes
pub const EPISODE_EXTENSION: &str = "epk";

const MAGIC: &[u8; 4] = b"TLEP";
const FORMAT_VERSION: u32 = 1;
const FOOTER_LEN: u64 = 12;

/// Element type of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F64,
    U8,
}

impl DType {
    pub fn size(self) -> u64 {
        match self {
            DType::F64 => 8,
            DType::U8 => 1,
        }
    }
}

/// Storage compression of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetCompression {
    None,
    Gzip,
}

/// Index entry for one array in the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub compression: DatasetCompression,
    pub offset: u64,
    pub length: u64,
}

impl DatasetInfo {
    fn decoded_len(&self) -> u64 {
        self.shape.iter().product::<u64>() * self.dtype.size()
    }
}

/// File header: attributes plus the dataset index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeHeader {
    pub version: u32,
    pub attrs: EpisodeMetadata,
    pub datasets: Vec<DatasetInfo>,
}

impl EpisodeHeader {
    pub fn dataset(&self, name: &str) -> Option<&DatasetInfo> {
        self.datasets.iter().find(|d| d.name == name)
    }
}

/// Counts bytes so dataset offsets are known without seeking
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Resolution shared by every frame of a camera column
fn camera_resolution(name: &str, frames: &[Arc<CameraFrame>]) -> io::Result<(u32, u32)> {
    let Some(first) = frames.first() else {
        return Ok((0, 0));
    };
    let (width, height) = (first.width(), first.height());
    if let Some(bad) = frames
        .iter()
        .find(|f| f.width() != width || f.height() != height)
    {
        return Err(invalid_data(format!(
            "{} mixes resolutions {}x{} and {}x{}",
            name,
            width,
            height,
            bad.width(),
            bad.height()
        )));
    }
    Ok((width, height))
}

struct DatasetWriter<W> {
    out: CountingWriter<W>,
    datasets: Vec<DatasetInfo>,
}

impl<W: Write> DatasetWriter<W> {
    fn write_dataset<F>(
        &mut self,
        name: &str,
        dtype: DType,
        shape: Vec<u64>,
        compression: DatasetCompression,
        body: F,
    ) -> io::Result<()>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let offset = self.out.written;
        match compression {
            DatasetCompression::None => body(&mut self.out)?,
            DatasetCompression::Gzip => {
                let mut encoder = GzEncoder::new(&mut self.out, flate2::Compression::fast());
                body(&mut encoder)?;
                encoder.finish()?;
            }
        }
        let length = self.out.written - offset;

        self.datasets.push(DatasetInfo {
            name: name.to_string(),
            dtype,
            shape,
            compression,
            offset,
            length,
        });
        Ok(())
    }

    fn write_f64s(&mut self, name: &str, shape: Vec<u64>, values: &[f64]) -> io::Result<()> {
        self.write_dataset(name, DType::F64, shape, DatasetCompression::None, |w| {
            for v in values {
                w.write_all(&v.to_le_bytes())?;
            }
            Ok(())
        })
    }

    fn write_positions(&mut self, name: &str, positions: &[JointPosition]) -> io::Result<()> {
        let shape = vec![positions.len() as u64, JOINT_COUNT as u64];
        self.write_dataset(name, DType::F64, shape, DatasetCompression::None, |w| {
            for position in positions {
                for v in position.values() {
                    w.write_all(&v.to_le_bytes())?;
                }
            }
            Ok(())
        })
    }

    fn write_camera(&mut self, camera: CameraId, frames: &[Arc<CameraFrame>]) -> io::Result<()> {
        let (width, height) = camera_resolution(camera.name(), frames)?;
        let shape = vec![frames.len() as u64, height as u64, width as u64, 3];
        self.write_dataset(camera.name(), DType::U8, shape, DatasetCompression::Gzip, |w| {
            for frame in frames {
                w.write_all(frame.data())?;
            }
            Ok(())
        })?;

        let capture_times: Vec<f64> = frames
            .iter()
            .map(|f| f.captured_at().unwrap_or(f64::NAN))
            .collect();
        self.write_f64s(
            &format!("{}_capture_times", camera.name()),
            vec![frames.len() as u64],
            &capture_times,
        )
    }
}

/// Serialize an episode into `out`. Returns the writer so the caller can
/// flush and sync it.
pub fn write_episode<W: Write>(episode: &Episode, out: W) -> io::Result<W> {
    let columns = episode.columns();
    let n = columns.len() as u64;

    let mut writer = DatasetWriter {
        out: CountingWriter {
            inner: out,
            written: 0,
        },
        datasets: Vec::with_capacity(8),
    };

    writer.write_f64s("timestamps", vec![n], &columns.timestamps)?;
    writer.write_positions("leader_positions", &columns.leader_positions)?;
    writer.write_positions("follower_positions", &columns.follower_positions)?;
    writer.write_camera(CameraId::Camera1, &columns.camera_1)?;
    writer.write_camera(CameraId::Camera2, &columns.camera_2)?;

    let flags: Vec<u8> = columns.frame_flags.iter().map(FrameFlags::bits).collect();
    writer.write_dataset(
        "frame_flags",
        DType::U8,
        vec![n],
        DatasetCompression::None,
        |w| w.write_all(&flags),
    )?;

    let header = EpisodeHeader {
        version: FORMAT_VERSION,
        attrs: episode.metadata().clone(),
        datasets: writer.datasets,
    };
    let header_bytes = serde_json::to_vec(&header).map_err(io::Error::other)?;

    let mut out = writer.out;
    out.write_all(&header_bytes)?;
    out.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
    out.write_all(MAGIC)?;
    out.flush()?;

    Ok(out.inner)
}

fn read_header_from<R: Read + Seek>(reader: &mut R) -> Result<EpisodeHeader, FormatError> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    if file_len < FOOTER_LEN {
        return Err(FormatError::BadMagic);
    }

    reader.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
    let mut footer = [0u8; FOOTER_LEN as usize];
    reader.read_exact(&mut footer)?;
    if &footer[8..] != MAGIC {
        return Err(FormatError::BadMagic);
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&footer[..8]);
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > file_len - FOOTER_LEN {
        return Err(FormatError::BadMagic);
    }

    reader.seek(SeekFrom::Start(file_len - FOOTER_LEN - header_len))?;
    let mut header_bytes = vec![0u8; header_len as usize];
    reader.read_exact(&mut header_bytes)?;

    let header: EpisodeHeader = serde_json::from_slice(&header_bytes)?;
    if header.version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(header.version));
    }
    Ok(header)
}

/// Read only the header (attributes and dataset index) of an episode file
pub fn read_header(path: &Path) -> Result<EpisodeHeader, FormatError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header_from(&mut reader)
}

fn read_dataset<R: Read + Seek>(
    reader: &mut R,
    header: &EpisodeHeader,
    name: &str,
    dtype: DType,
) -> Result<(DatasetInfo, Vec<u8>), FormatError> {
    let info = header
        .dataset(name)
        .ok_or_else(|| FormatError::MissingDataset(name.to_string()))?
        .clone();

    if info.dtype != dtype {
        return Err(FormatError::Malformed {
            name: name.to_string(),
            reason: format!("expected {:?}, found {:?}", dtype, info.dtype),
        });
    }

    reader.seek(SeekFrom::Start(info.offset))?;
    let mut raw = vec![0u8; info.length as usize];
    reader.read_exact(&mut raw)?;

    let bytes = match info.compression {
        DatasetCompression::None => raw,
        DatasetCompression::Gzip => {
            let mut decoded = Vec::with_capacity(info.decoded_len() as usize);
            GzDecoder::new(raw.as_slice()).read_to_end(&mut decoded)?;
            decoded
        }
    };

    if bytes.len() as u64 != info.decoded_len() {
        return Err(FormatError::Malformed {
            name: name.to_string(),
            reason: format!(
                "{} bytes for shape {:?}, expected {}",
                bytes.len(),
                info.shape,
                info.decoded_len()
            ),
        });
    }

    Ok((info, bytes))
}

fn decode_f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            f64::from_le_bytes(b)
        })
        .collect()
}

fn expect_rows(info: &DatasetInfo, rows: u64) -> Result<(), FormatError> {
    if info.shape.first().copied() != Some(rows) {
        return Err(FormatError::Malformed {
            name: info.name.clone(),
            reason: format!("shape {:?} does not have {} rows", info.shape, rows),
        });
    }
    Ok(())
}

fn read_positions<R: Read + Seek>(
    reader: &mut R,
    header: &EpisodeHeader,
    name: &str,
    rows: u64,
) -> Result<Vec<JointPosition>, FormatError> {
    let (info, bytes) = read_dataset(reader, header, name, DType::F64)?;
    expect_rows(&info, rows)?;
    if info.shape.get(1).copied() != Some(JOINT_COUNT as u64) {
        return Err(FormatError::Malformed {
            name: name.to_string(),
            reason: format!("expected {} joints per row", JOINT_COUNT),
        });
    }

    Ok(decode_f64s(&bytes)
        .chunks_exact(JOINT_COUNT)
        .map(|row| {
            let mut values = [0.0; JOINT_COUNT];
            values.copy_from_slice(row);
            JointPosition::new(values)
        })
        .collect())
}

fn read_camera<R: Read + Seek>(
    reader: &mut R,
    header: &EpisodeHeader,
    camera: CameraId,
    rows: u64,
) -> Result<Vec<Arc<CameraFrame>>, FormatError> {
    let (info, bytes) = read_dataset(reader, header, camera.name(), DType::U8)?;
    expect_rows(&info, rows)?;
    let (height, width) = match info.shape.as_slice() {
        [_, h, w, 3] => (*h as u32, *w as u32),
        _ => {
            return Err(FormatError::Malformed {
                name: info.name.clone(),
                reason: format!("expected N x H x W x 3, found {:?}", info.shape),
            })
        }
    };

    let times_name = format!("{}_capture_times", camera.name());
    let (times_info, times_bytes) = read_dataset(reader, header, &times_name, DType::F64)?;
    expect_rows(&times_info, rows)?;
    let capture_times = decode_f64s(&times_bytes);

    let frame_len = CameraFrame::byte_len(width, height);
    if frame_len == 0 {
        return Ok(Vec::new());
    }

    bytes
        .chunks_exact(frame_len)
        .zip(capture_times)
        .map(|(raster, t)| {
            let captured_at = if t.is_nan() { None } else { Some(t) };
            CameraFrame::restore(width, height, raster.to_vec(), captured_at)
                .map(Arc::new)
                .map_err(|e| FormatError::Malformed {
                    name: camera.name().to_string(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// Read a complete episode back into memory
pub fn read_episode(path: &Path) -> Result<Episode, FormatError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header_from(&mut reader)?;
    let rows = header.attrs.frame_count;

    let (ts_info, ts_bytes) = read_dataset(&mut reader, &header, "timestamps", DType::F64)?;
    expect_rows(&ts_info, rows)?;

    let (flags_info, flag_bytes) = read_dataset(&mut reader, &header, "frame_flags", DType::U8)?;
    expect_rows(&flags_info, rows)?;

    let columns = EpisodeColumns {
        timestamps: decode_f64s(&ts_bytes),
        leader_positions: read_positions(&mut reader, &header, "leader_positions", rows)?,
        follower_positions: read_positions(&mut reader, &header, "follower_positions", rows)?,
        camera_1: read_camera(&mut reader, &header, CameraId::Camera1, rows)?,
        camera_2: read_camera(&mut reader, &header, CameraId::Camera2, rows)?,
        frame_flags: flag_bytes.into_iter().map(FrameFlags::from_bits).collect(),
    };

    Episode::new(header.attrs, columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::types::{PositionUnit, SensorFrame};
    use chrono::Utc;
    use std::io::Cursor;
    use uuid::Uuid;

    fn sample_episode(frames: usize) -> Episode {
        let mut columns = EpisodeColumns::default();
        for i in 0..frames {
            let raster: Vec<u8> = (0..CameraFrame::byte_len(4, 3))
                .map(|b| (b + i) as u8)
                .collect();
            let cam_1 = CameraFrame::new(4, 3, raster.clone(), i as f64 * 0.03).unwrap();
            columns.push(SensorFrame {
                timestamp: i as f64 / 30.0,
                leader: JointPosition::new([i as f64; JOINT_COUNT]),
                follower: JointPosition::new([i as f64 - 0.5; JOINT_COUNT]),
                camera_1: Arc::new(cam_1),
                camera_2: Arc::new(CameraFrame::blank(4, 3)),
                flags: FrameFlags {
                    camera_stale: [false, true],
                    ..Default::default()
                },
            });
        }

        let metadata = EpisodeMetadata {
            episode_num: 7,
            frame_count: frames as u64,
            duration: (frames.saturating_sub(1)) as f64 / 30.0,
            date: Utc::now(),
            fps: 30.0,
            target_fps: 30.0,
            position_unit: PositionUnit::Ticks,
            session_id: Uuid::new_v4(),
            leader_stale_frames: 0,
            arm_fault_frames: 0,
            camera_1_stale_frames: 0,
            camera_2_stale_frames: frames as u64,
            camera_fault_frames: 0,
            overrun_count: 0,
        };
        Episode::new(metadata, columns).unwrap()
    }

    #[test]
    fn test_write_then_read_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episode_000007.epk");
        let episode = sample_episode(12);

        let file = File::create(&path).unwrap();
        write_episode(&episode, file).unwrap();

        let loaded = read_episode(&path).unwrap();
        assert_eq!(loaded, episode);
        assert_eq!(loaded.camera(CameraId::Camera2)[0].captured_at(), None);
    }

    #[test]
    fn test_header_names_every_dataset() {
        let bytes = write_episode(&sample_episode(3), Vec::new()).unwrap();
        let header = read_header_from(&mut Cursor::new(bytes)).unwrap();

        for name in [
            "timestamps",
            "leader_positions",
            "follower_positions",
            "camera_1",
            "camera_2",
            "frame_flags",
        ] {
            let info = header.dataset(name).unwrap();
            assert_eq!(info.shape[0], 3, "{name}");
        }
        assert_eq!(header.dataset("camera_1").unwrap().shape, vec![3, 3, 4, 3]);
        assert_eq!(header.attrs.episode_num, 7);
    }

    #[test]
    fn test_rejects_truncated_file() {
        let mut bytes = write_episode(&sample_episode(2), Vec::new()).unwrap();
        bytes.truncate(bytes.len() - 1);
        let err = read_header_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, FormatError::BadMagic));
    }
}
