//! Per-machine timer and lifespan fields.
//!
//! All values are microseconds held in atomics so racing tick sources can
//! decay them without taking the machine lock. `i64::MAX` encodes "infinite"
//! for durations and "never" for timestamps.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Sentinel for infinite durations and unreachable timestamps.
pub const INFINITE: i64 = i64::MAX;

const NOT_YET: i64 = i64::MIN;

/// Converts a std duration to microseconds, saturating below [`INFINITE`].
pub fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).map_or(INFINITE - 1, |m| m.min(INFINITE - 1))
}

pub(crate) fn timestamp_from_micros(micros: i64) -> Option<DateTime<Utc>> {
    if micros == INFINITE || micros == NOT_YET {
        return None;
    }
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Remaining budgets after one decay step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remaining {
    pub lifespan: i64,
    pub until_run: i64,
}

/// Timer state of one machine.
#[derive(Debug)]
pub struct Timing {
    time_until_run: AtomicI64,
    lifespan: AtomicI64,
    next_run_time: AtomicI64,
    last_run_time: AtomicI64,
    termination_time: AtomicI64,
    default_timeout: AtomicI64,
}

impl Timing {
    /// Arms a fresh machine: the first run is due after `default_timeout`.
    pub fn new(default_timeout: Duration, lifespan: Option<Duration>) -> Self {
        Self {
            time_until_run: AtomicI64::new(duration_micros(default_timeout)),
            lifespan: AtomicI64::new(lifespan.map_or(INFINITE, duration_micros)),
            next_run_time: AtomicI64::new(INFINITE),
            last_run_time: AtomicI64::new(NOT_YET),
            termination_time: AtomicI64::new(INFINITE),
            default_timeout: AtomicI64::new(duration_micros(default_timeout)),
        }
    }

    fn decay_field(field: &AtomicI64, micros: i64) -> i64 {
        let previous = field
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == INFINITE {
                    None
                } else {
                    Some(current.saturating_sub(micros))
                }
            })
            .unwrap_or(INFINITE);
        if previous == INFINITE {
            INFINITE
        } else {
            previous.saturating_sub(micros)
        }
    }

    /// Subtracts `elapsed` from the lifespan and the run countdown.
    pub fn decay(&self, elapsed: Duration) -> Remaining {
        let micros = duration_micros(elapsed);
        Remaining {
            lifespan: Self::decay_field(&self.lifespan, micros),
            until_run: Self::decay_field(&self.time_until_run, micros),
        }
    }

    /// Subtracts `elapsed` from the lifespan only.
    pub fn decay_lifespan(&self, elapsed: Duration) -> i64 {
        Self::decay_field(&self.lifespan, duration_micros(elapsed))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.time_until_run.load(Ordering::Acquire) <= 0
            || now.timestamp_micros() >= self.next_run_time.load(Ordering::Acquire)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lifespan.load(Ordering::Acquire) <= 0
            || now.timestamp_micros() >= self.termination_time.load(Ordering::Acquire)
    }

    /// Re-arms after a run. A zero timeout leaves the machine dormant.
    pub fn rearm(&self, now: DateTime<Utc>, timeout: Duration) {
        let now_micros = now.timestamp_micros();
        self.last_run_time.store(now_micros, Ordering::Release);
        if timeout.is_zero() {
            self.time_until_run.store(INFINITE, Ordering::Release);
            self.next_run_time.store(INFINITE, Ordering::Release);
        } else {
            let micros = duration_micros(timeout);
            self.time_until_run.store(micros, Ordering::Release);
            self.next_run_time
                .store(now_micros.saturating_add(micros), Ordering::Release);
        }
    }

    /// Makes the machine due on the next tick.
    pub fn trigger(&self) {
        self.time_until_run.store(0, Ordering::Release);
    }

    /// Schedules the next run at a wall-clock time instead of a countdown.
    pub fn run_at(&self, at: DateTime<Utc>) {
        self.time_until_run.store(INFINITE, Ordering::Release);
        self.next_run_time
            .store(at.timestamp_micros(), Ordering::Release);
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_micros(self.default_timeout.load(Ordering::Acquire).max(0) as u64)
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        self.default_timeout
            .store(duration_micros(timeout), Ordering::Release);
    }

    pub fn set_lifespan(&self, lifespan: Option<Duration>) {
        self.lifespan
            .store(lifespan.map_or(INFINITE, duration_micros), Ordering::Release);
    }

    pub fn set_termination_time(&self, at: Option<DateTime<Utc>>) {
        self.termination_time.store(
            at.map_or(INFINITE, |t| t.timestamp_micros()),
            Ordering::Release,
        );
    }

    /// Remaining countdown; `None` when dormant.
    pub fn time_until_run(&self) -> Option<chrono::Duration> {
        match self.time_until_run.load(Ordering::Acquire) {
            INFINITE => None,
            micros => Some(chrono::Duration::microseconds(micros)),
        }
    }

    /// Remaining lifespan; `None` when unbounded.
    pub fn lifespan(&self) -> Option<chrono::Duration> {
        match self.lifespan.load(Ordering::Acquire) {
            INFINITE => None,
            micros => Some(chrono::Duration::microseconds(micros)),
        }
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        timestamp_from_micros(self.next_run_time.load(Ordering::Acquire))
    }

    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        timestamp_from_micros(self.last_run_time.load(Ordering::Acquire))
    }

    pub fn termination_time(&self) -> Option<DateTime<Utc>> {
        timestamp_from_micros(self.termination_time.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn fresh_machine_waits_for_default_timeout() {
        let timing = Timing::new(ms(1000), None);
        let now = Utc::now();

        timing.decay(ms(500));
        assert!(!timing.is_due(now));

        timing.decay(ms(600));
        assert!(timing.is_due(now));
    }

    #[test]
    fn zero_timeout_is_due_immediately_then_dormant() {
        let timing = Timing::new(Duration::ZERO, None);
        let now = Utc::now();
        assert!(timing.is_due(now));

        timing.rearm(now, Duration::ZERO);
        timing.decay(Duration::from_secs(3600));
        assert!(!timing.is_due(now + chrono::Duration::hours(2)));
        assert_eq!(timing.time_until_run(), None);

        timing.trigger();
        assert!(timing.is_due(now));
    }

    #[test]
    fn infinite_lifespan_never_decays() {
        let timing = Timing::new(ms(10), None);
        let remaining = timing.decay(Duration::from_secs(1_000_000));
        assert_eq!(remaining.lifespan, INFINITE);
        assert!(!timing.is_expired(Utc::now()));
    }

    #[test]
    fn lifespan_expires_after_budget() {
        let timing = Timing::new(ms(10), Some(ms(5000)));
        let now = Utc::now();
        timing.decay(ms(4900));
        assert!(!timing.is_expired(now));
        timing.decay(ms(100));
        assert!(timing.is_expired(now));
    }

    #[test]
    fn termination_time_expires_machine() {
        let timing = Timing::new(ms(10), None);
        let now = Utc::now();
        timing.set_termination_time(Some(now + chrono::Duration::seconds(1)));
        assert!(!timing.is_expired(now));
        assert!(timing.is_expired(now + chrono::Duration::seconds(1)));
    }

    #[test]
    fn rearm_records_run_times() {
        let timing = Timing::new(ms(10), None);
        let now = Utc::now();
        timing.rearm(now, ms(250));
        let last = timing.last_run_time().unwrap();
        let next = timing.next_run_time().unwrap();
        assert_eq!(last.timestamp_micros(), now.timestamp_micros());
        assert_eq!((next - last).num_milliseconds(), 250);
    }

    #[test]
    fn run_at_is_governed_by_wall_clock() {
        let timing = Timing::new(ms(10), None);
        let now = Utc::now();
        timing.run_at(now + chrono::Duration::seconds(5));
        timing.decay(Duration::from_secs(60));
        assert!(!timing.is_due(now));
        assert!(timing.is_due(now + chrono::Duration::seconds(5)));
    }
}
