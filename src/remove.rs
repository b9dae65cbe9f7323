//! Rate-limited recursive removal.
//!
//! One primitive, two call modes: the unconditional depth-first
//! delete used to drain the work log, and an interactive variant that
//! prompts per entity for the ad hoc `rm` subcommand. Every unlink
//! and rmdir goes through the mutation rate limiter, throttled
//! identically to the probe layer.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::Path;

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::probe::{Prober, Snapshot};
use crate::ratelimit::RateLimiter;

/// Terminal outcome of an interactive removal. `Declined` is a
/// first-class non-error answer and must never be conflated with
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    Succeeded,
    Failed,
    Declined,
}

/// Yes/no confirmation seam so interactive removal can be driven by
/// tests as well as a terminal.
pub trait Prompt {
    fn confirm(&mut self, message: &str) -> bool;
}

/// Prompts on stdout, reads one line from stdin; `y`/`Y` means yes.
pub struct StdinPrompt {
    prefix: String,
}

impl StdinPrompt {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl Prompt for StdinPrompt {
    fn confirm(&mut self, message: &str) -> bool {
        print!("{}: {}? ", self.prefix, message);
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim_start().chars().next(), Some('y') | Some('Y'))
    }
}

/// The mutation call site: owns the unlink/rmdir rate limiter and the
/// optional bytes-freed accounting.
pub struct Remover {
    limiter: RateLimiter,
    track_bytes: bool,
    bytes_freed: u64,
}

impl Remover {
    pub fn new() -> Self {
        Self {
            limiter: RateLimiter::new("unlink"),
            track_bytes: false,
            bytes_freed: 0,
        }
    }

    pub fn set_rate_limit(&mut self, calls_per_second: f64) {
        self.limiter.set_target(calls_per_second);
    }

    pub fn track_bytes(&mut self, enable: bool) {
        self.track_bytes = enable;
        self.bytes_freed = 0;
    }

    /// Total `st_size` of everything actually removed, attributed at
    /// the moment of removal.
    pub fn bytes_freed(&self) -> u64 {
        self.bytes_freed
    }

    pub fn profile(&self, report: bool) {
        self.limiter.profile(report);
    }

    /// One throttled unlink/rmdir. An entity that vanished since
    /// listing is a tolerated race, reported as success.
    fn rm_entity(&mut self, path: &Path, is_directory: bool) -> io::Result<()> {
        self.limiter.throttle();
        let outcome = if is_directory {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match outcome {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn account(&mut self, snapshot: &Snapshot) {
        if self.track_bytes {
            self.bytes_freed += snapshot.size;
        }
    }

    /// Unconditionally remove `path` and everything beneath it,
    /// depth-first. Any error other than the vanished-entity race
    /// aborts the affected subtree and is reported upward.
    pub fn remove(&mut self, prober: &mut Prober, path: &Path) -> Result<()> {
        let snapshot = prober.probe(path).map_err(|e| {
            error!("Unable to stat {} (errno = {})", path.display(), os_code(&e));
            Error::Remove {
                path: path.to_path_buf(),
                source: e,
            }
        })?;

        if !snapshot.is_directory() {
            self.rm_entity(path, false).map_err(|e| {
                error!("Unable to unlink {} (errno = {})", path.display(), os_code(&e));
                Error::Remove {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;
            self.account(&snapshot);
            return Ok(());
        }

        debug!("remove: entering directory {}", path.display());
        match fs::read_dir(path) {
            Ok(entries) => {
                for entry in entries {
                    let entry = match entry {
                        Ok(e) => e,
                        Err(e) => {
                            info!("Unable to list entry in {} ({})", path.display(), e);
                            continue;
                        }
                    };
                    self.remove(prober, &entry.path())?;
                }
            }
            Err(e) => {
                // Still attempt the rmdir below; it reports the failure
                // if the directory is in fact non-empty.
                error!("Unable to scan directory {} (errno = {})", path.display(), os_code(&e));
            }
        }

        // The entry snapshot is stale once the contents are gone;
        // charge the directory's size as it stands at rmdir time.
        let snapshot = if self.track_bytes {
            prober.probe(path).unwrap_or(snapshot)
        } else {
            snapshot
        };

        debug!("remove: removing directory {}", path.display());
        self.rm_entity(path, true).map_err(|e| {
            error!("Unable to rmdir {} (errno = {})", path.display(), os_code(&e));
            Error::Remove {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
        self.account(&snapshot);
        debug!("remove: exiting directory {}", path.display());
        Ok(())
    }

    /// Interactive removal: each unlink/rmdir is preceded by a yes/no
    /// prompt naming the entity and its kind. A declined entry makes
    /// the enclosing directory `Declined` and its own prompt is
    /// skipped. Refuses directories unless `recursive`.
    pub fn remove_interactive(
        &mut self,
        prober: &mut Prober,
        path: &Path,
        recursive: bool,
        prompt: &mut dyn Prompt,
    ) -> RemoveStatus {
        let snapshot = match prober.probe(path) {
            Ok(s) => s,
            Err(e) => {
                error!("Unable to stat {} (errno = {})", path.display(), os_code(&e));
                return RemoveStatus::Failed;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if !snapshot.is_directory() {
            return self.unlink_with_prompt(path, &name, &snapshot, prompt);
        }

        if !recursive {
            error!("cannot remove '{}': Is a directory", name);
            return RemoveStatus::Failed;
        }

        debug!("remove_interactive: entering directory {}", path.display());
        let mut status = RemoveStatus::Succeeded;
        match fs::read_dir(path) {
            Ok(entries) => {
                for entry in entries {
                    if status == RemoveStatus::Failed {
                        break;
                    }
                    let entry = match entry {
                        Ok(e) => e,
                        Err(e) => {
                            info!("Unable to list entry in {} ({})", path.display(), e);
                            continue;
                        }
                    };
                    let child = entry.path();
                    let outcome = if child_is_directory(prober, &entry) {
                        self.remove_interactive(prober, &child, recursive, prompt)
                    } else {
                        match prober.probe(&child) {
                            Ok(snap) => {
                                let child_name = entry.file_name().to_string_lossy().into_owned();
                                self.unlink_with_prompt(&child, &child_name, &snap, prompt)
                            }
                            Err(e) => {
                                info!("Unable to stat {} (errno = {})", child.display(), os_code(&e));
                                continue;
                            }
                        }
                    };
                    match outcome {
                        RemoveStatus::Succeeded => {}
                        declined_or_failed => status = declined_or_failed,
                    }
                }
            }
            Err(e) => {
                error!("Unable to scan directory {} (errno = {})", path.display(), os_code(&e));
                status = RemoveStatus::Failed;
            }
        }

        // The directory's own prompt happens only if nothing inside
        // was declined or failed.
        if status == RemoveStatus::Succeeded {
            if prompt.confirm(&format!("remove directory '{}'", name)) {
                let snapshot = if self.track_bytes {
                    prober.probe(path).unwrap_or(snapshot)
                } else {
                    snapshot
                };
                debug!("remove_interactive: removing directory {}", path.display());
                if let Err(e) = self.rm_entity(path, true) {
                    error!("Unable to rmdir {} (errno = {})", path.display(), os_code(&e));
                    status = RemoveStatus::Failed;
                } else {
                    self.account(&snapshot);
                }
            } else {
                status = RemoveStatus::Declined;
            }
        }
        debug!("remove_interactive: exiting directory {}", path.display());
        status
    }

    fn unlink_with_prompt(
        &mut self,
        path: &Path,
        name: &str,
        snapshot: &Snapshot,
        prompt: &mut dyn Prompt,
    ) -> RemoveStatus {
        if !prompt.confirm(&format!("remove {} '{}'", snapshot.kind.description(), name)) {
            return RemoveStatus::Declined;
        }
        match self.rm_entity(path, false) {
            Ok(()) => {
                self.account(snapshot);
                RemoveStatus::Succeeded
            }
            Err(e) => {
                error!("Unable to unlink {} (errno = {})", path.display(), os_code(&e));
                RemoveStatus::Failed
            }
        }
    }
}

impl Default for Remover {
    fn default() -> Self {
        Self::new()
    }
}

fn child_is_directory(prober: &mut Prober, entry: &fs::DirEntry) -> bool {
    match entry.file_type() {
        Ok(file_type) => file_type.is_dir(),
        Err(_) => prober.is_directory(&entry.path()),
    }
}

fn os_code(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(0)
}

/// Format a byte total the way the summary flags ask for it.
pub fn format_size(bytes: u64, human_readable: bool, kilobytes_only: bool) -> String {
    let mut value = bytes as f64;
    if !human_readable {
        return format!("{value:.0} bytes");
    }
    if kilobytes_only {
        return format!("{:.2} kiB", value / 1024.0);
    }
    let mut unit = "bytes";
    for next in ["kiB", "MiB", "GiB", "TiB"] {
        if value <= 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    if unit == "bytes" {
        format!("{value:.0} {unit}")
    } else {
        format!("{value:.2} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct ScriptedPrompt {
        answers: Vec<bool>,
        asked: Vec<String>,
    }

    impl ScriptedPrompt {
        fn new(answers: &[bool]) -> Self {
            Self {
                answers: answers.iter().rev().copied().collect(),
                asked: Vec::new(),
            }
        }
    }

    impl Prompt for ScriptedPrompt {
        fn confirm(&mut self, message: &str) -> bool {
            self.asked.push(message.to_string());
            self.answers.pop().unwrap_or(false)
        }
    }

    fn deep_fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("a/top.txt"), "12345").unwrap();
        fs::write(nested.join("leaf.txt"), "1234567890").unwrap();
        dir
    }

    #[test]
    fn removes_nested_tree_and_counts_bytes() {
        let fixture = deep_fixture();
        let root = fixture.path().join("a");
        let mut prober = Prober::new();
        let mut remover = Remover::new();
        remover.track_bytes(true);

        remover.remove(&mut prober, &root).unwrap();
        assert!(!root.exists());
        // 5 + 10 file bytes plus three directory entries' own sizes.
        assert!(remover.bytes_freed() >= 15);
    }

    #[test]
    fn directory_bytes_are_attributed_at_rmdir_time() {
        let dir = TempDir::new().unwrap();
        let victim = dir.path().join("victim");
        fs::create_dir(&victim).unwrap();
        let mut content_bytes = 0u64;
        for i in 0..100 {
            let body = format!("{i:06}");
            content_bytes += body.len() as u64;
            fs::write(victim.join(format!("f{i:03}")), body).unwrap();
        }
        // On filesystems where a directory's size tracks its entry
        // count, the emptied directory shrinks back to this.
        let ruler = dir.path().join("ruler");
        fs::create_dir(&ruler).unwrap();
        let empty_dir_size = fs::symlink_metadata(&ruler).unwrap().len();

        let mut prober = Prober::new();
        let mut remover = Remover::new();
        remover.track_bytes(true);
        remover.remove(&mut prober, &victim).unwrap();

        assert_eq!(remover.bytes_freed(), content_bytes + empty_dir_size);
    }

    #[test]
    fn removing_a_plain_file_works() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("x.txt");
        fs::write(&file, "x").unwrap();
        let mut prober = Prober::new();
        let mut remover = Remover::new();
        remover.remove(&mut prober, &file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn missing_target_is_a_reported_failure() {
        let dir = TempDir::new().unwrap();
        let mut prober = Prober::new();
        let mut remover = Remover::new();
        let err = remover
            .remove(&mut prober, &dir.path().join("gone"))
            .unwrap_err();
        assert!(matches!(err, Error::Remove { .. }));
    }

    #[test]
    fn vanished_entity_during_unlink_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("x.txt");
        fs::write(&file, "x").unwrap();
        let mut remover = Remover::new();
        fs::remove_file(&file).unwrap();
        // The entity disappeared between listing and unlink.
        assert!(remover.rm_entity(&file, false).is_ok());
    }

    #[test]
    fn interactive_removal_prompts_per_entity() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("victim");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("one.txt"), "1").unwrap();

        let mut prober = Prober::new();
        let mut remover = Remover::new();
        let mut prompt = ScriptedPrompt::new(&[true, true]);
        let status = remover.remove_interactive(&mut prober, &root, true, &mut prompt);
        assert_eq!(status, RemoveStatus::Succeeded);
        assert!(!root.exists());
        assert_eq!(prompt.asked.len(), 2);
        assert!(prompt.asked[0].contains("regular file 'one.txt'"));
        assert!(prompt.asked[1].contains("directory 'victim'"));
    }

    #[test]
    fn declined_child_declines_parent_and_skips_its_prompt() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("victim");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("keep.txt"), "1").unwrap();

        let mut prober = Prober::new();
        let mut remover = Remover::new();
        let mut prompt = ScriptedPrompt::new(&[false]);
        let status = remover.remove_interactive(&mut prober, &root, true, &mut prompt);
        assert_eq!(status, RemoveStatus::Declined);
        assert!(root.join("keep.txt").exists());
        // Only the file was asked about; the directory prompt never ran.
        assert_eq!(prompt.asked.len(), 1);
    }

    #[test]
    fn directory_refused_without_recursive() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("victim");
        fs::create_dir(&root).unwrap();

        let mut prober = Prober::new();
        let mut remover = Remover::new();
        let mut prompt = ScriptedPrompt::new(&[true, true, true]);
        let status = remover.remove_interactive(&mut prober, &root, false, &mut prompt);
        assert_eq!(status, RemoveStatus::Failed);
        assert!(root.exists());
        assert!(prompt.asked.is_empty());
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512, false, false), "512 bytes");
        assert_eq!(format_size(512, true, false), "512 bytes");
        assert_eq!(format_size(2048, true, false), "2.00 kiB");
        assert_eq!(format_size(3 * 1024 * 1024, true, false), "3.00 MiB");
        assert_eq!(format_size(2048, true, true), "2.00 kiB");
        assert_eq!(format_size(512, true, true), "0.50 kiB");
    }
}
