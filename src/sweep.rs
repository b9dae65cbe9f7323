//! The recursive cleanup engine.
//!
//! Two phases per top-level path. The scan phase walks the tree in
//! strict post-order, classifies every entry through the test chain,
//! renames eligible directories into quarantine names, and queues
//! them in the work log. Once the scan's transaction is committed,
//! the drain phase pops the log oldest-first and physically removes
//! each quarantine path through the rate-limited delete. Separating
//! decision from action this way keeps an interrupted run safe: a
//! later scan recognizes quarantine names and does not reprocess
//! them.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::config::SweepConfig;
use crate::error::{Error, Result};
use crate::policy::{self, TestChain, Verdict};
use crate::probe::Prober;
use crate::remove::Remover;
use crate::worklog::Worklog;

const QUARANTINE_PREFIX: &str = ".sweep";
const QUARANTINE_DIGITS: usize = 12;

pub struct Engine {
    config: SweepConfig,
    chain: TestChain,
    prober: Prober,
    remover: Remover,
    /// Fixed for the whole run so every rename from this invocation
    /// carries the same recognizable stamp.
    run_stamp: String,
}

impl Engine {
    pub fn new(config: SweepConfig) -> Self {
        let mut prober = Prober::new();
        if let Some(limit) = config.stat_limit {
            prober.set_rate_limit(limit);
        }
        let mut remover = Remover::new();
        if let Some(limit) = config.unlink_limit {
            remover.set_rate_limit(limit);
        }
        let chain = build_chain(&config);
        let run_stamp = Local::now().format("%Y%m%d%H%M").to_string();
        Self {
            config,
            chain,
            prober,
            remover,
            run_stamp,
        }
    }

    /// Access to the test chain, for callers that want to stack
    /// additional site-specific predicates before running.
    pub fn chain_mut(&mut self) -> &mut TestChain {
        &mut self.chain
    }

    /// Log the effective policy, the way an operator sees what a run
    /// is about to do.
    pub fn announce(&self) {
        if self.config.dry_run {
            info!("This will be a dry run only -- no files/directories will be deleted");
        }
        if !self.config.age.exclude_root {
            info!("Directories and files owned by root (uid = 0) will also be removed");
        }
        match (self.config.ignore_sockets, self.config.ignore_pipes) {
            (true, true) => {
                info!("Socket and FIFO files will not short-circuit directory removal")
            }
            (true, false) => {
                info!("Socket files will not short-circuit directory removal (FIFO files will)")
            }
            (false, true) => {
                info!("FIFO files will not short-circuit directory removal (socket files will)")
            }
            (false, false) => info!("Socket and FIFO files will short-circuit directory removal"),
        }
        for path in &self.config.excluded_paths {
            info!("Path excluded from cleanup: {}", path.display());
        }
        for uid in &self.config.excluded_uids {
            info!("UID excluded from cleanup: {uid}");
        }
        for gid in &self.config.excluded_gids {
            info!("GID excluded from cleanup: {gid}");
        }
        info!(
            "Temporal threshold ({})",
            self.config.age.threshold.describe()
        );
        self.chain.describe();
    }

    /// Process every top-level argument: scan, commit, drain. Without
    /// `keep_going` the first failure aborts the run; with it the run
    /// continues and the first error is reported at the end.
    pub fn run(&mut self, paths: &[PathBuf]) -> Result<()> {
        let suffix_worklogs = self.config.worklog_path.is_some() && paths.len() > 1;
        let mut first_error: Option<Error> = None;

        for (ordinal, path) in paths.iter().enumerate() {
            match self.sweep_one(path, ordinal + 1, suffix_worklogs) {
                Ok(()) => {}
                Err(e) => {
                    if let Some(code) = e.os_error() {
                        error!("(errno = {code}) {e}");
                    } else {
                        error!("{e}");
                    }
                    let keep_going = self.config.keep_going;
                    first_error.get_or_insert(e);
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        // Profiles go out on every exit path, failed runs included.
        self.prober.profile(self.config.rate_report);
        self.remover.profile(self.config.rate_report);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn sweep_one(&mut self, path: &Path, ordinal: usize, suffix_worklog: bool) -> Result<()> {
        let canonical = fs::canonicalize(path)?;

        if !self.prober.is_directory(&canonical) {
            return self.sweep_file_argument(&canonical);
        }

        if self.config.excluded_paths.contains(&canonical) {
            // Matches the exclusion list; skip it rather than fail.
            error!("The directory {} is set to be excluded!", canonical.display());
            return Ok(());
        }

        let mut worklog = match &self.config.worklog_path {
            Some(base) => {
                let mut log_path = base.clone();
                if suffix_worklog {
                    let mut name = log_path.file_name().map(OsString::from).unwrap_or_default();
                    name.push(format!(".{ordinal}"));
                    log_path.set_file_name(name);
                }
                Worklog::at_path(&log_path)?
            }
            None => Worklog::in_memory()?,
        };

        info!("Scanning {}", canonical.display());
        let verdict = match self.sweep_dir(&canonical, &mut worklog) {
            Ok(v) => v,
            Err(e) => {
                // A work log write failure poisons the whole scan; a
                // partially queued transaction could orphan quarantined
                // directories, so discard it entirely.
                let _ = worklog.scan_complete(true);
                let _ = worklog.close(false);
                return Err(e);
            }
        };
        worklog.scan_complete(verdict == Verdict::Unknown)?;

        let outcome = if verdict == Verdict::Unknown {
            Err(Error::ScanFailed(canonical.clone()))
        } else {
            if !self.config.worklog_only {
                self.drain(&mut worklog)?;
            }
            Ok(())
        };
        worklog.close(self.config.keep_worklog)?;
        outcome
    }

    /// A plain file named on the command line (`--allow-files`): run
    /// it through the chain and unlink it if eligible.
    fn sweep_file_argument(&mut self, path: &Path) -> Result<()> {
        if !self.config.allow_files {
            return Err(Error::NotADirectory(path.to_path_buf()));
        }
        let (verdict, _) = self
            .chain
            .check_path(&mut self.prober, &self.config.age, path);
        if verdict == Verdict::Eligible {
            if self.config.dry_run {
                info!("File would be removed: {}", path.display());
            } else {
                match self.remover.remove(&mut self.prober, path) {
                    Ok(()) => info!("Removed {}", path.display()),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Post-order scan of one directory. Children are fully resolved
    /// -- verdict, rename, queueing -- before the parent's own verdict
    /// settles, because that verdict depends on every one of them.
    fn sweep_dir(&mut self, dir: &Path, worklog: &mut Worklog) -> Result<Verdict> {
        let entries = match list_dir(&mut self.prober, dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Unable to open directory {} ({})", dir.display(), e);
                return Ok(Verdict::Unknown);
            }
        };
        debug!("Entered directory {}", dir.display());

        let mut verdict = Verdict::Eligible;

        // Files first: any non-eligible file settles this directory's
        // verdict, but never stops the subdirectory walk below.
        for entry in entries.iter().filter(|e| !e.is_dir) {
            if verdict != Verdict::Eligible {
                break;
            }
            let (file_verdict, _) =
                self.chain
                    .check_path(&mut self.prober, &self.config.age, &entry.path);
            if file_verdict != Verdict::Eligible {
                verdict = Verdict::Ineligible;
                info!(
                    "Directory removal short-circuited by file {}",
                    entry.path.display()
                );
            }
        }

        for entry in entries.iter().filter(|e| e.is_dir) {
            debug!("Stepping into subdirectory {}", entry.path.display());
            let mut child = self.sweep_dir(&entry.path, worklog)?;
            if child == Verdict::Eligible && !self.quarantine(dir, entry, worklog)? {
                // A half-quarantined tree must not look fully handled.
                child = Verdict::Ineligible;
            }
            if child != Verdict::Eligible {
                verdict = Verdict::Ineligible;
            }
        }

        debug!("Exiting directory {}", dir.display());
        Ok(verdict)
    }

    /// Rename an eligible directory to its quarantine name and queue
    /// it. Returns false when the rename failed; work log errors
    /// propagate so the caller can discard the scan.
    fn quarantine(&mut self, parent: &Path, entry: &ListedEntry, worklog: &mut Worklog) -> Result<bool> {
        if is_quarantine_name(&entry.name) {
            warn!(
                "Directory flagged by previous run: {}",
                entry.path.display()
            );
            return Ok(true);
        }
        warn!("Directory flagged for removal: {}", entry.path.display());

        // Built byte-wise: the original name is not required to be
        // UTF-8, and distinct names must stay distinct.
        let mut alt_name = OsString::from(format!("{}{}-", QUARANTINE_PREFIX, self.run_stamp));
        alt_name.push(&entry.name);
        let alt = parent.join(alt_name);
        if self.config.dry_run {
            info!("Directory would be renamed {}", alt.display());
        } else {
            debug!("RENAME({}, {})", entry.path.display(), alt.display());
            if let Err(e) = fs::rename(&entry.path, &alt) {
                error!(
                    "(errno = {}) Unable to rename removal target {}",
                    e.raw_os_error().unwrap_or(0),
                    entry.path.display()
                );
                return Ok(false);
            }
        }
        worklog.add(&entry.path, &alt)?;
        Ok(true)
    }

    /// Drain the work log oldest-entry-first through the rate-limited
    /// recursive delete. A failed removal is logged and the drain
    /// moves on; the no-overlap invariant keeps entries independent.
    fn drain(&mut self, worklog: &mut Worklog) -> Result<()> {
        info!("Processing work log...");
        while let Some(entry) = worklog.next()? {
            if self.config.dry_run {
                info!("Directory would be removed: {}", entry.alt_path.display());
            } else {
                info!("Removing directory {}", entry.alt_path.display());
                if let Err(e) = self.remover.remove(&mut self.prober, &entry.alt_path) {
                    error!("{e}");
                }
            }
        }
        Ok(())
    }
}

struct ListedEntry {
    name: OsString,
    path: PathBuf,
    is_dir: bool,
}

/// Materialize a directory listing up front; the walk renames
/// children while it runs, and a live iterator over a mutating
/// directory is undefined ground.
fn list_dir(prober: &mut Prober, dir: &Path) -> std::io::Result<Vec<ListedEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_dir = match entry.file_type() {
            Ok(file_type) => file_type.is_dir(),
            Err(_) => prober.is_directory(&path),
        };
        entries.push(ListedEntry {
            name: entry.file_name(),
            path,
            is_dir,
        });
    }
    Ok(entries)
}

/// Recognize a basename produced by [`Engine::quarantine`] in this or
/// any earlier run: the fixed prefix, a 12-digit timestamp, a dash.
/// Byte-wise, since the trailing original name may not be UTF-8.
fn is_quarantine_name(name: &OsStr) -> bool {
    let Some(rest) = name.as_bytes().strip_prefix(QUARANTINE_PREFIX.as_bytes()) else {
        return false;
    };
    rest.len() > QUARANTINE_DIGITS
        && rest[..QUARANTINE_DIGITS].iter().all(u8::is_ascii_digit)
        && rest[QUARANTINE_DIGITS] == b'-'
}

fn build_chain(config: &SweepConfig) -> TestChain {
    let mut chain = TestChain::new();
    match (config.ignore_sockets, config.ignore_pipes) {
        (true, true) => {}
        (true, false) => chain.register("isFIFO", policy::no_fifos),
        (false, true) => chain.register("isSocket", policy::no_sockets),
        (false, false) => chain.register("isPipeOrSocket", policy::no_sockets_or_fifos),
    }
    if !config.excluded_paths.is_empty() {
        chain.register(
            "pathExclusions",
            policy::excluded_paths(config.excluded_paths.clone()),
        );
    }
    if !config.excluded_uids.is_empty() {
        chain.register(
            "userExclusions",
            policy::excluded_uids(config.excluded_uids.clone()),
        );
    }
    if !config.excluded_gids.is_empty() {
        chain.register(
            "groupExclusions",
            policy::excluded_gids(config.excluded_gids.clone()),
        );
    }
    chain
}
