// =============================================================================
// Scheduler — fixed cadence table for the healing passes
// =============================================================================
//
// The orchestrator registers its passes once with a name and an interval; the
// main loop asks `due(now)` which passes should run this tick.  Entries fire
// in registration order, which is also the dependency order of the passes
// (build before scan, scan before drain).  Time comes from the caller, so a
// test drives the whole schedule without sleeping.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: &'static str,
    pub interval: StdDuration,
}

pub struct Scheduler {
    entries: Vec<ScheduleEntry>,
    last_run: RwLock<HashMap<&'static str, DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_run: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, name: &'static str, interval: StdDuration) {
        self.entries.push(ScheduleEntry { name, interval });
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Names of every pass whose interval has elapsed, in registration order.
    /// Each returned pass is marked as run at `now`; a pass never fires twice
    /// for the same elapsed interval.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<&'static str> {
        let mut last_run = self.last_run.write();
        let mut due = Vec::new();
        for entry in &self.entries {
            let interval = Duration::from_std(entry.interval).unwrap_or_else(|_| Duration::zero());
            let ready = match last_run.get(entry.name) {
                None => true, // first tick runs everything
                Some(last) => now - *last >= interval,
            };
            if ready {
                last_run.insert(entry.name, now);
                due.push(entry.name);
            }
        }
        due
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    fn scheduler() -> Scheduler {
        let mut s = Scheduler::new();
        s.register("build", StdDuration::from_secs(60));
        s.register("scan", StdDuration::from_secs(300));
        s.register("drain", StdDuration::from_secs(60));
        s
    }

    #[test]
    fn first_tick_runs_everything_in_order() {
        let s = scheduler();
        assert_eq!(s.due(t0()), vec!["build", "scan", "drain"]);
    }

    #[test]
    fn passes_fire_on_their_own_cadence() {
        let s = scheduler();
        s.due(t0());

        // One minute later only the minute passes fire.
        assert_eq!(s.due(t0() + Duration::minutes(1)), vec!["build", "drain"]);
        // Five minutes in, the scan joins again.
        assert_eq!(
            s.due(t0() + Duration::minutes(5)),
            vec!["build", "scan", "drain"]
        );
    }

    #[test]
    fn same_instant_does_not_double_fire() {
        let s = scheduler();
        s.due(t0());
        assert!(s.due(t0()).is_empty());
    }
}
