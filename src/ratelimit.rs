//! Rate limiting for burst-prone filesystem call sites.
//!
//! Each throttled call site (one for metadata probes, one for
//! unlink/rmdir mutations) owns its own `RateLimiter`. The limiter
//! measures the long-run call rate and, once it exceeds the target,
//! sleeps just enough per call to converge back onto the target
//! instead of stalling hard.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

/// Wall time that must elapse before the measured rate is
/// statistically meaningful.
pub const LEADIN_SECONDS: f64 = 1.0;

/// Targets below this are rejected; limiting to fractions of a call
/// per second serves no purpose.
pub const MINIMUM_RATE: f64 = 1.0;

/// Computed delays shorter than this are noise and are not slept.
const SLEEP_FLOOR_MICROS: f64 = 10.0;

/// Number of upcoming calls the catch-up delay is spread across.
const SPREAD_CALLS: f64 = 100.0;

pub struct RateLimiter {
    label: &'static str,
    target: Option<f64>,
    start: Option<Instant>,
    count: u64,
}

impl RateLimiter {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            target: None,
            start: None,
            count: 0,
        }
    }

    /// Set the target long-run rate in calls per second. Values below
    /// [`MINIMUM_RATE`] disable limiting entirely.
    pub fn set_target(&mut self, calls_per_second: f64) {
        if calls_per_second >= MINIMUM_RATE {
            self.target = Some(calls_per_second);
        } else {
            self.target = None;
        }
    }

    pub fn target(&self) -> Option<f64> {
        self.target
    }

    /// Record one call against this limiter, sleeping first if the
    /// measured rate has drifted above the target. Never fails.
    pub fn throttle(&mut self) {
        let start = *self.start.get_or_insert_with(Instant::now);

        if let Some(target) = self.target {
            let dt = start.elapsed().as_secs_f64();
            if dt > LEADIN_SECONDS {
                let current = self.count as f64 / dt;
                trace!("{}: rate = {:.1} calls/sec", self.label, current);
                if current > target {
                    if let Some(delay) = catch_up_delay(self.count, target, dt) {
                        debug!(
                            "{}: sleeping for {:.0} microseconds",
                            self.label,
                            delay.as_secs_f64() * 1e6
                        );
                        thread::sleep(delay);
                    }
                }
            }
        }

        self.count += 1;
    }

    /// Measured long-run rate, once the lead-in period has elapsed.
    pub fn rate(&self) -> Option<f64> {
        let start = self.start?;
        let dt = start.elapsed().as_secs_f64();
        if dt > LEADIN_SECONDS {
            Some(self.count as f64 / dt)
        } else {
            None
        }
    }

    /// Report total calls, elapsed time, and achieved rate. With
    /// `report` the summary goes out at info level, otherwise debug.
    pub fn profile(&self, report: bool) {
        let line = match (self.start, self.rate()) {
            (Some(start), Some(rate)) => format!(
                "{}: {} calls over {:.3} seconds ({:.0} calls/sec)",
                self.label,
                self.count,
                start.elapsed().as_secs_f64(),
                rate
            ),
            (Some(_), None) => format!(
                "{}: no profiling data (statistics gathering requires {:.0} second)",
                self.label, LEADIN_SECONDS
            ),
            (None, _) => format!("{}: no profiling data (no calls)", self.label),
        };
        if report {
            info!("{line}");
        } else {
            debug!("{line}");
        }
    }
}

/// Per-call delay that, applied uniformly over the next
/// [`SPREAD_CALLS`] calls, brings the average rate back down to
/// `target`. `None` when the computed delay is below the noise floor.
fn catch_up_delay(count: u64, target: f64, dt: f64) -> Option<Duration> {
    let delay_micros = (count as f64 / target - dt) * 1e6 / SPREAD_CALLS;
    if delay_micros > SLEEP_FLOOR_MICROS {
        Some(Duration::from_micros(delay_micros as u64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_spreads_catch_up_over_hundred_calls() {
        // 4000 calls at a 1000/sec target should have taken 4s; after
        // 2s elapsed the 2s deficit is spread over 100 calls.
        let delay = catch_up_delay(4000, 1000.0, 2.0).expect("delay expected");
        let expected_micros: f64 = (4000.0 / 1000.0 - 2.0) * 1e6 / 100.0;
        assert_eq!(delay.as_micros() as f64, expected_micros.trunc());
    }

    #[test]
    fn delay_below_noise_floor_is_skipped() {
        // Barely over target: the computed delay is under 10us.
        assert!(catch_up_delay(2001, 1000.0, 2.0).is_none());
    }

    #[test]
    fn at_or_below_target_rate_yields_no_delay() {
        // Exactly on target: count/target == dt, delay is zero.
        assert!(catch_up_delay(2000, 1000.0, 2.0).is_none());
        // Below target the "deficit" is negative.
        assert!(catch_up_delay(1000, 1000.0, 2.0).is_none());
    }

    #[test]
    fn target_below_minimum_disables_limiting() {
        let mut limiter = RateLimiter::new("test");
        limiter.set_target(0.5);
        assert_eq!(limiter.target(), None);
        limiter.set_target(10.0);
        assert_eq!(limiter.target(), Some(10.0));
        limiter.set_target(0.0);
        assert_eq!(limiter.target(), None);
    }

    #[test]
    fn unlimited_limiter_never_sleeps() {
        let mut limiter = RateLimiter::new("test");
        let begin = Instant::now();
        for _ in 0..10_000 {
            limiter.throttle();
        }
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn rate_is_unavailable_before_lead_in() {
        let mut limiter = RateLimiter::new("test");
        assert!(limiter.rate().is_none());
        limiter.throttle();
        assert!(limiter.rate().is_none());
        // Profiling the insufficient-data cases must not panic.
        limiter.profile(true);
        RateLimiter::new("idle").profile(true);
    }

    #[test]
    fn pre_lead_in_calls_are_not_throttled() {
        let mut limiter = RateLimiter::new("test");
        limiter.set_target(10.0);
        let begin = Instant::now();
        // Far above 10 calls/sec, but all within the lead-in window.
        for _ in 0..1000 {
            limiter.throttle();
        }
        assert!(begin.elapsed() < Duration::from_millis(500));
    }
}
