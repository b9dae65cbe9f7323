//! Disk usage accounting, `du`-style but driven through the same
//! rate-limited probe as the cleanup engine, so usage surveys of a
//! busy scratch filesystem can be throttled the same way sweeps are.

use std::fs;
use std::path::Path;

use tracing::{debug, error};

use crate::error::Result;
use crate::probe::Prober;
use crate::remove::format_size;

pub struct UsageSurvey {
    prober: Prober,
    human_readable: bool,
    kilobytes_only: bool,
    rate_report: bool,
}

impl UsageSurvey {
    pub fn new(human_readable: bool, kilobytes_only: bool) -> Self {
        Self {
            prober: Prober::new(),
            human_readable,
            kilobytes_only,
            rate_report: false,
        }
    }

    pub fn set_rate_limit(&mut self, calls_per_second: f64) {
        self.prober.set_rate_limit(calls_per_second);
    }

    pub fn set_rate_report(&mut self, enabled: bool) {
        self.rate_report = enabled;
    }

    /// Total one path and print its `SIZE\tPATH` line, returning the
    /// total so callers can sum across arguments. An unreadable entry
    /// anywhere in the tree aborts that argument; a partial sum is
    /// worse than no answer.
    pub fn report(&mut self, path: &Path) -> Result<u64> {
        let total = self.total(path)?;
        println!(
            "{}\t{}",
            format_size(total, self.human_readable, self.kilobytes_only),
            path.display()
        );
        Ok(total)
    }

    /// Print the grand total across every reported argument.
    pub fn report_grand_total(&self, total: u64) {
        println!(
            "{}\ttotal",
            format_size(total, self.human_readable, self.kilobytes_only)
        );
    }

    /// Sum the apparent sizes of every entry under `path`, the
    /// directories' own sizes included.
    pub fn total(&mut self, path: &Path) -> Result<u64> {
        let snapshot = self.prober.probe(path)?;
        let mut total = snapshot.size;
        if snapshot.is_directory() {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                total += self.total(&entry.path()).inspect_err(|e| {
                    error!("While sizing {}: {e}", entry.path().display());
                })?;
            }
        } else {
            debug!("{} {}", snapshot.size, path.display());
        }
        Ok(total)
    }

    pub fn finish(&mut self) {
        self.prober.profile(self.rate_report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn totals_include_nested_files_and_directory_sizes() {
        let fixture = TempDir::new().unwrap();
        fs::write(fixture.path().join("a.bin"), vec![0u8; 100]).unwrap();
        let sub = fixture.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("b.bin"), vec![0u8; 250]).unwrap();

        let mut survey = UsageSurvey::new(false, false);
        let total = survey.total(fixture.path()).unwrap();
        // 350 bytes of file content plus the two directories' own
        // sizes, which are filesystem-dependent but nonzero.
        assert!(total > 350, "total {total} should exceed file content");
    }

    #[test]
    fn missing_path_is_an_error() {
        let mut survey = UsageSurvey::new(false, false);
        assert!(survey.total(Path::new("/nonexistent/usage/fixture")).is_err());
    }

    #[test]
    fn single_file_total_is_its_size() {
        let fixture = TempDir::new().unwrap();
        let file = fixture.path().join("solo.bin");
        fs::write(&file, vec![0u8; 4096]).unwrap();

        let mut survey = UsageSurvey::new(false, false);
        assert_eq!(survey.total(&file).unwrap(), 4096);
    }
}
