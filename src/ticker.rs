//! A fixed-rate schedule for driving the pipeline, kept apart from whatever
//! draws the results so the pipeline can run headless.

use std::time::{Duration, Instant};

/// How often the pipeline polls the link unless told otherwise.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

/// Fires once every `period`. Ticks that were missed because the caller was
/// busy are skipped rather than fired in a burst.
#[derive(Debug, Clone)]
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    /// A ticker whose first tick is one period from now.
    pub fn new(period: Duration) -> Self {
        Self::starting_at(period, Instant::now())
    }

    /// A ticker whose first tick is one period after `now`.
    pub fn starting_at(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: now + period,
        }
    }

    /// The tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether a tick is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next
    }

    /// Time left until the next tick, zero if it is overdue.
    pub fn time_until(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Consume the due tick and schedule the next one.
    pub fn advance(&mut self, now: Instant) {
        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }
    }

    /// Sleep until the next tick, consume it, and return the time it fired.
    pub fn wait(&mut self) -> Instant {
        spin_sleep::sleep(self.time_until(Instant::now()));
        let now = Instant::now();
        self.advance(now);
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_period() {
        let t0 = Instant::now();
        let period = Duration::from_millis(10);
        let mut ticker = Ticker::starting_at(period, t0);

        assert!(!ticker.is_due(t0));
        assert_eq!(ticker.time_until(t0), period);
        assert!(ticker.is_due(t0 + period));

        ticker.advance(t0 + period);
        assert!(!ticker.is_due(t0 + period));
        assert!(ticker.is_due(t0 + 2 * period));
    }

    #[test]
    fn missed_ticks_are_skipped() {
        let t0 = Instant::now();
        let period = Duration::from_millis(10);
        let mut ticker = Ticker::starting_at(period, t0);

        let late = t0 + 10 * period;
        ticker.advance(late);
        assert!(!ticker.is_due(late));
        assert_eq!(ticker.time_until(late), period);
    }

    #[test]
    fn wait_sleeps_at_least_until_the_tick() {
        let period = Duration::from_millis(5);
        let start = Instant::now();
        let mut ticker = Ticker::starting_at(period, start);
        let fired = ticker.wait();
        assert!(fired >= start + period);
    }
}
