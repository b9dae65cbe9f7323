//! Sweeper - age-based cleanup for shared scratch filesystems
//!
//! A directory is removed only when everything beneath it has aged
//! past a configurable threshold; one fresh file keeps the whole tree.
//! Eligible directories are first renamed to quarantine names and
//! queued in a sqlite work log, then physically removed in a second
//! phase, so an interrupted run never leaves a half-deleted tree it
//! cannot recognize later.
//!
//! ## Modules
//!
//! - `config` - age thresholds, timestamp policy, run options
//! - `error` - error types with context
//! - `policy` - the ordered chain of eligibility tests
//! - `probe` - rate-limited `lstat` and file classification
//! - `ratelimit` - self-clocking call throttling
//! - `remove` - recursive and interactive removal
//! - `sweep` - the scan-then-drain cleanup engine
//! - `usage` - throttled disk usage accounting
//! - `worklog` - sqlite-backed removal queue with ancestor pruning

pub mod config;
pub mod error;
pub mod policy;
pub mod probe;
pub mod ratelimit;
pub mod remove;
pub mod sweep;
pub mod usage;
pub mod worklog;

pub use error::{Error, Result};
