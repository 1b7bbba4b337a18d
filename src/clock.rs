//! Wall clock used for every persisted timestamp, swappable in tests.
use crate::types::TimeStamp;
use chrono::Utc;
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::new()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<TimeStamp<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: TimeStamp<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: TimeStamp<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = now;
    }

    pub fn advance_days(&self, days: i64) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard = guard.plus_days(days);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = TimeStamp::new_with(2025, 3, 1, 9, 0, 0);
        let clock = ManualClock::starting_at(start);

        clock.advance_days(30);

        assert_eq!(clock.now(), start.plus_days(30));
    }
}
