//! When to sync next.
//!
//! Syncs are due every `period` counted from the start of the previous one, so time spent
//! syncing shortens the next sleep instead of pushing every later sync back.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    pub duration: Duration,
    /// How far past due the sync already is, the sleep is zero then.
    pub overrun: Option<Duration>,
}

/// Sleep before the next sync. The first sync waits a full period.
pub fn next_sleep(last_sync: Option<Instant>, period: Duration, now: Instant) -> SleepPlan {
    let last = match last_sync {
        Some(l) => l,
        None => {
            return SleepPlan {
                duration: period,
                overrun: None,
            }
        }
    };
    let due = last + period;
    match due.checked_duration_since(now) {
        Some(d) => SleepPlan {
            duration: d,
            overrun: None,
        },
        None => SleepPlan {
            duration: Duration::from_secs(0),
            overrun: Some(now.duration_since(due)),
        },
    }
}

/// Tracks the last sync of a trial.
#[derive(Debug, Clone)]
pub struct SyncClock {
    period: Duration,
    last_sync: Option<Instant>,
}

impl SyncClock {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_sync: None,
        }
    }

    pub fn plan(&self, now: Instant) -> SleepPlan {
        next_sleep(self.last_sync, self.period, now)
    }

    pub fn mark(&mut self, now: Instant) {
        self.last_sync = Some(now);
    }

    pub fn last_sync(&self) -> Option<Instant> {
        self.last_sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(900);

    #[test]
    fn first_sleep_is_a_period() {
        let now = Instant::now();
        assert_eq!(
            next_sleep(None, PERIOD, now),
            SleepPlan {
                duration: PERIOD,
                overrun: None
            }
        );
    }

    #[test]
    fn time_spent_syncing_is_deducted() {
        let last = Instant::now();
        let now = last + Duration::from_secs(100);
        let plan = next_sleep(Some(last), PERIOD, now);
        assert_eq!(plan.duration, Duration::from_secs(800));
        assert_eq!(plan.overrun, None);
    }

    #[test]
    fn overdue_sync_does_not_sleep() {
        let last = Instant::now();
        let now = last + PERIOD + Duration::from_secs(42);
        let plan = next_sleep(Some(last), PERIOD, now);
        assert_eq!(plan.duration, Duration::from_secs(0));
        assert_eq!(plan.overrun, Some(Duration::from_secs(42)));

        let exactly_due = next_sleep(Some(last), PERIOD, last + PERIOD);
        assert_eq!(exactly_due.duration, Duration::from_secs(0));
        assert_eq!(exactly_due.overrun, None);
    }

    #[test]
    fn sleep_never_exceeds_period() {
        let start = Instant::now();
        let mut clock = SyncClock::new(PERIOD);
        let mut now = start;
        // sync durations of a made up trial
        for sync_secs in [0_u64, 5, 899, 1200, 30, 0].iter() {
            let plan = clock.plan(now);
            assert!(plan.duration <= PERIOD);
            now += plan.duration;
            clock.mark(now);
            now += Duration::from_secs(*sync_secs);
        }
        assert!(clock.last_sync().is_some());
    }
}
