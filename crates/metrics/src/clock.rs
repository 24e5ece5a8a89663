//! Time sources for record timestamps.
//!
//! Stores never read the system time directly. They ask a [`Clock`] for the
//! absolute time of a record and measure run-relative time with a
//! [`StopWatch`] driven by the same clock, so tests can substitute a manual
//! clock and get deterministic timestamps.

use std::{fmt, time::Duration, time::Instant};

use chrono::{DateTime, Utc};

/// Source of absolute and monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic reading relative to an arbitrary, fixed origin.
    fn monotonic(&self) -> Duration;
}

/// [`Clock`] backed by the operating system.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Measures time since the last [`start`](Self::start).
///
/// An unstarted stopwatch reports zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopWatch {
    started_at: Option<Duration>,
}

impl StopWatch {
    /// (Re)starts the stopwatch at the clock's current monotonic reading.
    pub fn start(&mut self, clock: &dyn Clock) {
        self.started_at = Some(clock.monotonic());
    }

    /// Time elapsed since the stopwatch was started.
    #[must_use]
    pub fn split(&self, clock: &dyn Clock) -> Duration {
        self.started_at.map_or(Duration::ZERO, |start| clock.monotonic().saturating_sub(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ManualClock;

    #[test]
    fn test_unstarted_stopwatch_reports_zero() {
        let clock = ManualClock::default();
        clock.advance(Duration::from_secs(5));
        assert_eq!(StopWatch::default().split(&clock), Duration::ZERO);
    }

    #[test]
    fn test_restart_rezeroes() {
        let clock = ManualClock::default();
        let mut watch = StopWatch::default();
        watch.start(&clock);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(watch.split(&clock), Duration::from_millis(1500));

        watch.start(&clock);
        clock.advance(Duration::from_millis(20));
        assert_eq!(watch.split(&clock), Duration::from_millis(20));
    }
}
