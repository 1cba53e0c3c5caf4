//! Episode number allocation
//!
//! Numbers are derived from what is already on disk, so they stay unique
//! across process restarts. Retained temporary artifacts from failed writes
//! also claim their number.

use super::format::EPISODE_EXTENSION;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const FINAL_PREFIX: &str = "episode_";
const TEMP_PREFIX: &str = ".episode_";

/// Final file name for an episode number
pub fn episode_file_name(episode_num: u64) -> String {
    format!("{FINAL_PREFIX}{episode_num:06}.{EPISODE_EXTENSION}")
}

/// Prefix used for an episode's temporary artifact
pub fn temp_file_prefix(episode_num: u64) -> String {
    format!("{TEMP_PREFIX}{episode_num:06}.")
}

fn leading_number(rest: &str) -> Option<u64> {
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    // The number must be followed by an extension separator or end the name
    match rest[digits.len()..].chars().next() {
        None | Some('.') => digits.parse().ok(),
        Some(_) => None,
    }
}

/// Episode number claimed by a file name, final or temporary, of any extension
pub fn parse_episode_num(file_name: &str) -> Option<u64> {
    if let Some(rest) = file_name.strip_prefix(TEMP_PREFIX) {
        return leading_number(rest);
    }
    file_name.strip_prefix(FINAL_PREFIX).and_then(leading_number)
}

fn highest_claimed(dir: &Path) -> io::Result<Option<u64>> {
    let mut highest = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(num) = entry.file_name().to_str().and_then(parse_episode_num) {
            highest = highest.max(Some(num));
        }
    }
    Ok(highest)
}

/// Finalized episode files in `dir`, ordered by episode number
pub fn list_episodes(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut episodes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(TEMP_PREFIX) || !name.ends_with(EPISODE_EXTENSION) {
            continue;
        }
        if let Some(num) = parse_episode_num(name) {
            episodes.push((num, entry.path()));
        }
    }
    episodes.sort_by_key(|(num, _)| *num);
    Ok(episodes)
}

/// Monotonic allocator of episode numbers for one output directory
#[derive(Debug)]
pub struct EpisodeNumbering {
    dir: PathBuf,
    next: u64,
}

fn successor(num: u64) -> io::Result<u64> {
    num.checked_add(1).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("episode number {num} leaves no room for another episode"),
        )
    })
}

impl EpisodeNumbering {
    /// Create the directory if needed and start after the highest number on disk
    pub fn scan(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let next = match highest_claimed(&dir)? {
            Some(highest) => successor(highest)?,
            None => 0,
        };
        tracing::debug!("Episode numbering for {:?} starts at {}", dir, next);
        Ok(Self { dir, next })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number the next allocation will return, absent new files on disk
    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Issue the next number. Rescans the directory so files written by
    /// another process since the last scan are skipped too.
    pub fn allocate(&mut self) -> io::Result<u64> {
        if let Some(highest) = highest_claimed(&self.dir)? {
            self.next = self.next.max(successor(highest)?);
        }
        let num = self.next;
        self.next = successor(num)?;
        Ok(num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_names() {
        assert_eq!(episode_file_name(42), "episode_000042.epk");
        assert_eq!(parse_episode_num("episode_000042.epk"), Some(42));
        assert_eq!(parse_episode_num("episode_000003.hdf5"), Some(3));
        assert_eq!(parse_episode_num(".episode_000009.a1b2.tmp"), Some(9));
        assert_eq!(parse_episode_num("episode_12x.epk"), None);
        assert_eq!(parse_episode_num("notes.txt"), None);
    }

    #[test]
    fn test_starts_after_existing_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("episode_000000.epk"), b"x").unwrap();
        fs::write(dir.path().join("episode_000004.epk"), b"x").unwrap();

        let mut numbering = EpisodeNumbering::scan(dir.path()).unwrap();
        assert_eq!(numbering.allocate().unwrap(), 5);
        assert_eq!(numbering.allocate().unwrap(), 6);
    }

    #[test]
    fn test_never_reuses_after_restart() {
        let dir = tempdir().unwrap();

        let mut first = EpisodeNumbering::scan(dir.path()).unwrap();
        let a = first.allocate().unwrap();
        fs::write(dir.path().join(episode_file_name(a)), b"x").unwrap();
        let b = first.allocate().unwrap();
        // b's write failed and left only its temp artifact
        fs::write(dir.path().join(format!("{}x.tmp", temp_file_prefix(b))), b"x").unwrap();
        drop(first);

        let mut restarted = EpisodeNumbering::scan(dir.path()).unwrap();
        let c = restarted.allocate().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn test_allocate_skips_files_created_meanwhile() {
        let dir = tempdir().unwrap();
        let mut numbering = EpisodeNumbering::scan(dir.path()).unwrap();
        assert_eq!(numbering.peek(), 0);

        fs::write(dir.path().join(episode_file_name(10)), b"x").unwrap();
        assert_eq!(numbering.allocate().unwrap(), 11);
    }

    #[test]
    fn test_exhausted_numbers_are_an_error() {
        let dir = tempdir().unwrap();
        let mut numbering = EpisodeNumbering::scan(dir.path()).unwrap();
        fs::write(dir.path().join(episode_file_name(u64::MAX)), b"x").unwrap();

        let err = numbering.allocate().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(EpisodeNumbering::scan(dir.path()).is_err());
    }

    #[test]
    fn test_list_episodes_ignores_temp_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(episode_file_name(2)), b"x").unwrap();
        fs::write(dir.path().join(episode_file_name(1)), b"x").unwrap();
        fs::write(dir.path().join(".episode_000003.zz.tmp"), b"x").unwrap();

        let listed: Vec<u64> = list_episodes(dir.path())
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(listed, vec![1, 2]);
    }
}
