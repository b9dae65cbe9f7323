//! Immutable sweep configuration, threaded explicitly through the
//! engine and the eligibility tests instead of living in globals.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Duration, Local, Timelike};

/// Which point in time the age threshold is anchored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpochBasis {
    #[default]
    Now,
    Midnight,
    Noon,
}

/// Which timestamp(s) gate the age test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampPolicy {
    Mtime,
    Atime,
    /// The newer of mtime and atime.
    #[default]
    Max,
}

/// A single point-in-time cutoff, computed once per run. Entities are
/// aged out only when their governing timestamp is strictly older.
#[derive(Debug, Clone, Copy)]
pub struct AgeThreshold {
    cutoff: SystemTime,
    days: Option<u32>,
}

impl AgeThreshold {
    pub fn new(days: u32, basis: EpochBasis) -> Self {
        let now = Local::now();
        let anchor = match basis {
            EpochBasis::Now => now,
            EpochBasis::Midnight => local_time_of_day(now, 0),
            EpochBasis::Noon => local_time_of_day(now, 12),
        };
        let cutoff = anchor - Duration::days(i64::from(days));
        Self {
            cutoff: cutoff.into(),
            days: Some(days),
        }
    }

    /// Build a threshold from an explicit cutoff instant.
    pub fn from_cutoff(cutoff: SystemTime) -> Self {
        Self { cutoff, days: None }
    }

    /// True when `timestamp` is strictly older than the cutoff.
    pub fn is_older(&self, timestamp: SystemTime) -> bool {
        timestamp < self.cutoff
    }

    pub fn cutoff(&self) -> SystemTime {
        self.cutoff
    }

    /// Human-readable threshold for the startup banner, with the
    /// configured day count when it was given in days.
    pub fn describe(&self) -> String {
        let cutoff = DateTime::<Local>::from(self.cutoff).format("%Y-%m-%d %H:%M:%S%z");
        match self.days {
            Some(days) => format!("{days} days, cutoff {cutoff}"),
            None => format!("cutoff {cutoff}"),
        }
    }
}

fn local_time_of_day(now: DateTime<Local>, hour: u32) -> DateTime<Local> {
    now.with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// The temporal half of the eligibility decision: the probe-derived
/// checks that run before the registered test chain.
#[derive(Debug, Clone)]
pub struct AgePolicy {
    pub threshold: AgeThreshold,
    pub timestamp_policy: TimestampPolicy,
    /// Entities with uid 0 or gid 0 are never eligible (default on).
    pub exclude_root: bool,
}

impl Default for AgePolicy {
    fn default() -> Self {
        Self {
            threshold: AgeThreshold::new(30, EpochBasis::Now),
            timestamp_policy: TimestampPolicy::default(),
            exclude_root: true,
        }
    }
}

/// Everything the cleanup engine needs to honor for one invocation.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub age: AgePolicy,
    /// Socket files do not short-circuit directory removal.
    pub ignore_sockets: bool,
    /// FIFO files do not short-circuit directory removal.
    pub ignore_pipes: bool,
    /// Canonical paths that must never be removed.
    pub excluded_paths: HashSet<PathBuf>,
    pub excluded_uids: BTreeSet<u32>,
    pub excluded_gids: BTreeSet<u32>,
    /// Preview everything, mutate nothing (default on; mutation is an
    /// explicit opt-in).
    pub dry_run: bool,
    /// Continue with the next top-level argument after a failure.
    pub keep_going: bool,
    /// On-disk work log location; in-memory when unset.
    pub worklog_path: Option<PathBuf>,
    pub keep_worklog: bool,
    /// Stop after queuing; do not drain the work log.
    pub worklog_only: bool,
    /// Accept plain files as top-level arguments.
    pub allow_files: bool,
    pub stat_limit: Option<f64>,
    pub unlink_limit: Option<f64>,
    pub rate_report: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            age: AgePolicy::default(),
            ignore_sockets: false,
            ignore_pipes: false,
            excluded_paths: HashSet::new(),
            excluded_uids: BTreeSet::new(),
            excluded_gids: BTreeSet::new(),
            dry_run: true,
            keep_going: false,
            worklog_path: None,
            keep_worklog: false,
            worklog_only: false,
            allow_files: false,
            stat_limit: None,
            unlink_limit: None,
            rate_report: false,
        }
    }
}
