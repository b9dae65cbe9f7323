//! Rate-limited metadata probes.
//!
//! All metadata the engine and removers consume flows through
//! [`Prober::probe`], which wraps `lstat` semantics (symbolic links
//! are never followed) behind the shared rate-limiting control loop.

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ratelimit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Socket,
    Fifo,
    BlockDevice,
    CharDevice,
    Unknown,
}

impl FileKind {
    pub fn description(&self) -> &'static str {
        match self {
            FileKind::Regular => "regular file",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symbolic link",
            FileKind::Socket => "socket",
            FileKind::Fifo => "fifo",
            FileKind::BlockDevice => "block device",
            FileKind::CharDevice => "character device",
            FileKind::Unknown => "unknown file type",
        }
    }
}

/// Metadata captured once per probe and reused for both the age test
/// and the eligibility chain.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
}

impl Snapshot {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::Regular
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_socket() {
            FileKind::Socket
        } else if file_type.is_fifo() {
            FileKind::Fifo
        } else if file_type.is_block_device() {
            FileKind::BlockDevice
        } else if file_type.is_char_device() {
            FileKind::CharDevice
        } else {
            FileKind::Unknown
        };
        Self {
            kind,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            mtime: unix_timestamp(meta.mtime()),
            atime: unix_timestamp(meta.atime()),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

fn unix_timestamp(seconds: i64) -> SystemTime {
    if seconds >= 0 {
        UNIX_EPOCH + Duration::from_secs(seconds as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(seconds.unsigned_abs())
    }
}

/// The probe call site. Owns its own limiter, configured
/// independently of the mutation limiter.
pub struct Prober {
    limiter: RateLimiter,
}

impl Prober {
    pub fn new() -> Self {
        Self {
            limiter: RateLimiter::new("stat"),
        }
    }

    pub fn set_rate_limit(&mut self, calls_per_second: f64) {
        self.limiter.set_target(calls_per_second);
    }

    /// `lstat` the path, throttled. The snapshot always describes the
    /// link itself, never its target.
    pub fn probe(&mut self, path: &Path) -> io::Result<Snapshot> {
        self.limiter.throttle();
        let meta = fs::symlink_metadata(path)?;
        Ok(Snapshot::from_metadata(&meta))
    }

    pub fn is_directory(&mut self, path: &Path) -> bool {
        self.probe(path).map(|s| s.is_directory()).unwrap_or(false)
    }

    pub fn profile(&self, report: bool) {
        self.limiter.profile(report);
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn probe_captures_kind_and_size() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data.bin");
        fs::write(&file, b"12345").unwrap();

        let mut prober = Prober::new();
        let snap = prober.probe(&file).unwrap();
        assert_eq!(snap.kind, FileKind::Regular);
        assert_eq!(snap.size, 5);

        let snap = prober.probe(dir.path()).unwrap();
        assert!(snap.is_directory());
    }

    #[test]
    fn probe_does_not_follow_symlinks() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("subdir");
        fs::create_dir(&target).unwrap();
        let link = dir.path().join("link");
        symlink(&target, &link).unwrap();

        let mut prober = Prober::new();
        let snap = prober.probe(&link).unwrap();
        assert_eq!(snap.kind, FileKind::Symlink);
        assert!(!prober.is_directory(&link));

        // A dangling link is still probe-able.
        fs::remove_dir(&target).unwrap();
        assert!(prober.probe(&link).is_ok());
    }

    #[test]
    fn probe_of_missing_path_fails() {
        let dir = TempDir::new().unwrap();
        let mut prober = Prober::new();
        assert!(prober.probe(&dir.path().join("gone")).is_err());
        assert!(!prober.is_directory(&dir.path().join("gone")));
    }

    #[test]
    fn negative_unix_timestamps_map_before_epoch() {
        assert!(unix_timestamp(-60) < UNIX_EPOCH);
        assert_eq!(unix_timestamp(0), UNIX_EPOCH);
        assert!(unix_timestamp(60) > UNIX_EPOCH);
    }
}
