//! Time sources
//!
//! Every sample is stamped against a monotonic session clock. Periodic tasks
//! are driven by a [`Ticker`] that sleeps against the same clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source. `now()` is the time elapsed since the clock's origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Wall-independent clock backed by `Instant`
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to. Used to drive ticks deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Timing of one scheduled tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickTiming {
    /// When the tick was due
    pub scheduled: Duration,
    /// When the tick actually started
    pub started: Duration,
    /// Whether the start lagged the deadline by more than the overrun threshold
    pub overrun: bool,
    /// Whole periods skipped because the task fell behind
    pub skipped: u64,
}

impl TickTiming {
    pub fn lateness(&self) -> Duration {
        self.started.saturating_sub(self.scheduled)
    }
}

/// Fixed-cadence scheduler for a periodic task.
///
/// Deadlines advance by whole periods from the first tick so the cadence does
/// not drift with processing time. A task that falls more than one period
/// behind skips the missed deadlines instead of bursting to catch up.
pub struct Ticker {
    clock: SharedClock,
    period: Duration,
    overrun_threshold: Duration,
    next_deadline: Option<Duration>,
}

impl Ticker {
    pub fn new(clock: SharedClock, period: Duration, overrun_threshold: Duration) -> Self {
        Self {
            clock,
            period,
            overrun_threshold,
            next_deadline: None,
        }
    }

    /// Build a ticker from a rate in Hz
    pub fn from_rate(clock: SharedClock, rate_hz: f64, overrun_threshold: Duration) -> Self {
        Self::new(clock, Duration::from_secs_f64(1.0 / rate_hz), overrun_threshold)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sleep until the next deadline and report how punctual the wake-up was
    pub fn wait(&mut self) -> TickTiming {
        let deadline = match self.next_deadline {
            Some(deadline) => deadline,
            None => self.clock.now(),
        };

        let now = self.clock.now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }

        let started = self.clock.now();
        let lateness = started.saturating_sub(deadline);
        let skipped = if self.period.is_zero() {
            0
        } else {
            (lateness.as_nanos() / self.period.as_nanos()) as u64
        };

        self.next_deadline = Some(deadline + self.period * (skipped as u32 + 1));

        TickTiming {
            scheduled: deadline,
            started,
            overrun: lateness > self.overrun_threshold,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.advance(Duration::from_millis(33));
        clock.advance(Duration::from_millis(33));
        assert_eq!(clock.now(), Duration::from_millis(66));
        clock.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[test]
    fn test_ticker_keeps_cadence() {
        let clock = MonotonicClock::shared();
        let mut ticker = Ticker::new(clock, Duration::from_millis(5), Duration::from_millis(50));

        let first = ticker.wait();
        let second = ticker.wait();
        let third = ticker.wait();

        assert_eq!(second.scheduled, first.scheduled + Duration::from_millis(5));
        assert!(third.scheduled > second.scheduled);
        assert!(third.started >= third.scheduled);
    }

    #[test]
    fn test_ticker_reports_overrun_and_skips() {
        let clock = Arc::new(ManualClock::new());
        let mut ticker = Ticker::new(
            clock.clone(),
            Duration::from_millis(10),
            Duration::from_millis(2),
        );

        let first = ticker.wait();
        assert!(!first.overrun);

        // Task stalls for three and a half periods
        clock.advance(Duration::from_millis(45));
        let late = ticker.wait();
        assert!(late.overrun);
        assert_eq!(late.skipped, 3);
        assert_eq!(late.lateness(), Duration::from_millis(35));
    }
}
