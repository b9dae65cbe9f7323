//! Eligibility verdicts and the pluggable test chain.
//!
//! A path is checked in two stages: the probe-derived tests (root
//! exclusion, then the age threshold), followed by the registered
//! chain of named predicates evaluated in insertion order. The first
//! non-eligible answer wins.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace};

use crate::config::{AgePolicy, TimestampPolicy};
use crate::probe::{FileKind, Prober, Snapshot};

/// Tri-state outcome of testing one filesystem entity for removal.
/// `Unknown` is never treated as eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unknown,
    Ineligible,
    Eligible,
}

pub type Predicate = Box<dyn Fn(&Path, &Snapshot) -> Verdict>;

struct ChainEntry {
    name: String,
    predicate: Predicate,
}

/// Ordered, named, mutable list of predicates. Registering an
/// existing name replaces the predicate in place, preserving its
/// position in the evaluation order.
#[derive(Default)]
pub struct TestChain {
    entries: Vec<ChainEntry>,
}

impl TestChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, predicate: F)
    where
        F: Fn(&Path, &Snapshot) -> Verdict + 'static,
    {
        let predicate: Predicate = Box::new(predicate);
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.predicate = predicate;
        } else {
            self.entries.push(ChainEntry {
                name: name.to_string(),
                predicate,
            });
        }
    }

    pub fn unregister(&mut self, name: &str) {
        self.entries.retain(|e| e.name != name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Log the configured stack.
    pub fn describe(&self) {
        info!("Filesystem test stack:");
        info!("  (0) default tests");
        for (i, entry) in self.entries.iter().enumerate() {
            info!("  ({}) {}", i + 1, entry.name);
        }
    }

    /// Run the registered predicates in order; the first entry that
    /// answers anything other than `Eligible` settles the verdict.
    pub fn evaluate(&self, path: &Path, snapshot: &Snapshot) -> Verdict {
        let mut verdict = Verdict::Eligible;
        for entry in &self.entries {
            verdict = (entry.predicate)(path, snapshot);
            trace!(
                "check_path: {}({}) = {:?}",
                entry.name,
                path.display(),
                verdict
            );
            if verdict != Verdict::Eligible {
                break;
            }
        }
        verdict
    }

    /// Probe a path (rate-limited) and decide whether it may be
    /// deleted. A failed probe yields `Unknown` and no snapshot.
    pub fn check_path(
        &self,
        prober: &mut Prober,
        age: &AgePolicy,
        path: &Path,
    ) -> (Verdict, Option<Snapshot>) {
        trace!("check_path: {}", path.display());
        let snapshot = match prober.probe(path) {
            Ok(s) => s,
            Err(e) => {
                debug!("Unable to stat {} ({})", path.display(), e);
                return (Verdict::Unknown, None);
            }
        };
        let verdict = self.verdict_for(path, &snapshot, age);
        (verdict, Some(snapshot))
    }

    /// The decision core, split from the probe so it can be driven
    /// with a synthetic snapshot.
    pub fn verdict_for(&self, path: &Path, snapshot: &Snapshot, age: &AgePolicy) -> Verdict {
        // Root exclusion takes precedence over the age test.
        if age.exclude_root && (snapshot.uid == 0 || snapshot.gid == 0) {
            return Verdict::Ineligible;
        }

        let governing = match age.timestamp_policy {
            TimestampPolicy::Mtime => snapshot.mtime,
            TimestampPolicy::Atime => snapshot.atime,
            TimestampPolicy::Max => snapshot.mtime.max(snapshot.atime),
        };
        if !age.threshold.is_older(governing) {
            return Verdict::Ineligible;
        }

        self.evaluate(path, snapshot)
    }
}

/// Socket files short-circuit removal.
pub fn no_sockets(_path: &Path, snapshot: &Snapshot) -> Verdict {
    if snapshot.kind == FileKind::Socket {
        Verdict::Ineligible
    } else {
        Verdict::Eligible
    }
}

/// FIFO files short-circuit removal.
pub fn no_fifos(_path: &Path, snapshot: &Snapshot) -> Verdict {
    if snapshot.kind == FileKind::Fifo {
        Verdict::Ineligible
    } else {
        Verdict::Eligible
    }
}

/// Both socket and FIFO files short-circuit removal.
pub fn no_sockets_or_fifos(_path: &Path, snapshot: &Snapshot) -> Verdict {
    match snapshot.kind {
        FileKind::Socket | FileKind::Fifo => Verdict::Ineligible,
        _ => Verdict::Eligible,
    }
}

/// Entities owned by any of the given uids are never removed.
pub fn excluded_uids(uids: BTreeSet<u32>) -> impl Fn(&Path, &Snapshot) -> Verdict {
    move |_path, snapshot| {
        if uids.contains(&snapshot.uid) {
            Verdict::Ineligible
        } else {
            Verdict::Eligible
        }
    }
}

/// Entities owned by any of the given gids are never removed.
pub fn excluded_gids(gids: BTreeSet<u32>) -> impl Fn(&Path, &Snapshot) -> Verdict {
    move |_path, snapshot| {
        if gids.contains(&snapshot.gid) {
            Verdict::Ineligible
        } else {
            Verdict::Eligible
        }
    }
}

/// Exact canonical paths that are never removed.
pub fn excluded_paths(paths: HashSet<PathBuf>) -> impl Fn(&Path, &Snapshot) -> Verdict {
    move |path, _snapshot| {
        if paths.contains(path) {
            Verdict::Ineligible
        } else {
            Verdict::Eligible
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgeThreshold;
    use std::time::{Duration, SystemTime};

    fn old_snapshot() -> Snapshot {
        let old = SystemTime::now() - Duration::from_secs(90 * 24 * 60 * 60);
        Snapshot {
            kind: FileKind::Regular,
            uid: 1000,
            gid: 1000,
            size: 0,
            mtime: old,
            atime: old,
        }
    }

    fn lenient_age() -> AgePolicy {
        AgePolicy {
            threshold: AgeThreshold::from_cutoff(SystemTime::now()),
            timestamp_policy: TimestampPolicy::Max,
            exclude_root: false,
        }
    }

    #[test]
    fn default_verdict_is_eligible() {
        let chain = TestChain::new();
        let verdict = chain.verdict_for(Path::new("/x"), &old_snapshot(), &lenient_age());
        assert_eq!(verdict, Verdict::Eligible);
    }

    #[test]
    fn root_exclusion_precedes_age_test() {
        let chain = TestChain::new();
        let mut age = lenient_age();
        age.exclude_root = true;
        let mut snapshot = old_snapshot();
        snapshot.uid = 0;
        assert_eq!(
            chain.verdict_for(Path::new("/x"), &snapshot, &age),
            Verdict::Ineligible
        );
        snapshot.uid = 1000;
        snapshot.gid = 0;
        assert_eq!(
            chain.verdict_for(Path::new("/x"), &snapshot, &age),
            Verdict::Ineligible
        );
    }

    #[test]
    fn recent_entities_are_ineligible() {
        let chain = TestChain::new();
        let age = lenient_age();
        let mut snapshot = old_snapshot();
        snapshot.mtime = SystemTime::now() + Duration::from_secs(60);
        // Max policy: the newer mtime governs even with an old atime.
        assert_eq!(
            chain.verdict_for(Path::new("/x"), &snapshot, &age),
            Verdict::Ineligible
        );
    }

    #[test]
    fn timestamp_policy_selects_the_governing_time() {
        let chain = TestChain::new();
        let mut age = lenient_age();
        let mut snapshot = old_snapshot();
        snapshot.atime = SystemTime::now() + Duration::from_secs(60);

        age.timestamp_policy = TimestampPolicy::Mtime;
        assert_eq!(
            chain.verdict_for(Path::new("/x"), &snapshot, &age),
            Verdict::Eligible
        );
        age.timestamp_policy = TimestampPolicy::Atime;
        assert_eq!(
            chain.verdict_for(Path::new("/x"), &snapshot, &age),
            Verdict::Ineligible
        );
        age.timestamp_policy = TimestampPolicy::Max;
        assert_eq!(
            chain.verdict_for(Path::new("/x"), &snapshot, &age),
            Verdict::Ineligible
        );
    }

    #[test]
    fn chain_short_circuits_in_insertion_order() {
        let mut chain = TestChain::new();
        chain.register("first", |_, _| Verdict::Ineligible);
        chain.register("second", |_, _| Verdict::Unknown);
        assert_eq!(
            chain.evaluate(Path::new("/x"), &old_snapshot()),
            Verdict::Ineligible
        );
    }

    #[test]
    fn register_replaces_in_place() {
        let mut chain = TestChain::new();
        chain.register("gate", |_, _| Verdict::Ineligible);
        chain.register("tail", |_, _| Verdict::Eligible);
        chain.register("gate", |_, _| Verdict::Eligible);
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain.evaluate(Path::new("/x"), &old_snapshot()),
            Verdict::Eligible
        );
    }

    #[test]
    fn unregister_removes_an_entry() {
        let mut chain = TestChain::new();
        chain.register("gate", |_, _| Verdict::Ineligible);
        chain.unregister("gate");
        assert!(chain.is_empty());
        assert_eq!(
            chain.evaluate(Path::new("/x"), &old_snapshot()),
            Verdict::Eligible
        );
    }

    #[test]
    fn special_file_predicates() {
        let mut snapshot = old_snapshot();
        snapshot.kind = FileKind::Socket;
        assert_eq!(no_sockets(Path::new("/x"), &snapshot), Verdict::Ineligible);
        assert_eq!(no_fifos(Path::new("/x"), &snapshot), Verdict::Eligible);
        assert_eq!(
            no_sockets_or_fifos(Path::new("/x"), &snapshot),
            Verdict::Ineligible
        );
        snapshot.kind = FileKind::Fifo;
        assert_eq!(no_sockets(Path::new("/x"), &snapshot), Verdict::Eligible);
        assert_eq!(no_fifos(Path::new("/x"), &snapshot), Verdict::Ineligible);
    }

    #[test]
    fn ownership_and_path_exclusions() {
        let uid_gate = excluded_uids(BTreeSet::from([42]));
        let gid_gate = excluded_gids(BTreeSet::from([7]));
        let path_gate = excluded_paths(HashSet::from([PathBuf::from("/scratch/keep")]));

        let mut snapshot = old_snapshot();
        snapshot.uid = 42;
        assert_eq!(uid_gate(Path::new("/x"), &snapshot), Verdict::Ineligible);
        snapshot.uid = 43;
        assert_eq!(uid_gate(Path::new("/x"), &snapshot), Verdict::Eligible);

        snapshot.gid = 7;
        assert_eq!(gid_gate(Path::new("/x"), &snapshot), Verdict::Ineligible);

        assert_eq!(
            path_gate(Path::new("/scratch/keep"), &snapshot),
            Verdict::Ineligible
        );
        assert_eq!(
            path_gate(Path::new("/scratch/keep2"), &snapshot),
            Verdict::Eligible
        );
    }

    #[test]
    fn probe_failure_yields_unknown() {
        let chain = TestChain::new();
        let mut prober = Prober::new();
        let (verdict, snapshot) = chain.check_path(
            &mut prober,
            &lenient_age(),
            Path::new("/nonexistent/sweeper/test/path"),
        );
        assert_eq!(verdict, Verdict::Unknown);
        assert!(snapshot.is_none());
    }
}
