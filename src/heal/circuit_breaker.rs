// =============================================================================
// Circuit Breaker — vendor protection for the healing pipeline
// =============================================================================
//
// Consecutive escalated failures (rate limits above all) open the breaker for
// a cooldown window.  While open, no backfill request may go out; queue items
// stay pending and are retried once the window elapses.  Any successful fetch
// closes the breaker and resets the failure count.
//
// Time is passed in by the caller so state transitions are deterministic
// under test.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
    times_opened: u64,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: RwLock::new(BreakerInner::default()),
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> BreakerState {
        let inner = self.inner.read();
        match inner.open_until {
            Some(until) if now < until => BreakerState::Open,
            _ => BreakerState::Closed,
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == BreakerState::Open
    }

    /// Seconds until the breaker closes again, zero when closed.
    pub fn cooldown_remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        let inner = self.inner.read();
        match inner.open_until {
            Some(until) if now < until => (until - now).num_seconds(),
            _ => 0,
        }
    }

    /// Record an escalated failure.  Reaching the threshold opens the breaker
    /// for the cooldown window.
    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.write();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.threshold && inner.open_until.map_or(true, |u| now >= u) {
            inner.open_until = Some(now + self.cooldown);
            inner.times_opened += 1;
            warn!(
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.num_seconds(),
                "circuit breaker opened"
            );
        }
    }

    /// A successful fetch closes the breaker and clears the failure streak.
    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        if inner.consecutive_failures > 0 || inner.open_until.is_some() {
            info!("circuit breaker reset after successful fetch");
        }
        inner.consecutive_failures = 0;
        inner.open_until = None;
    }

    pub fn times_opened(&self) -> u64 {
        self.inner.read().times_opened
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

    #[test]
    fn opens_at_threshold() {
        let breaker = CircuitBreaker::new(2, Duration::minutes(5));
        assert!(!breaker.is_open(t0()));

        breaker.record_failure(t0());
        assert!(!breaker.is_open(t0()));

        breaker.record_failure(t0());
        assert!(breaker.is_open(t0()));
        assert_eq!(breaker.cooldown_remaining_secs(t0()), 300);
    }

    #[test]
    fn cooldown_elapses() {
        let breaker = CircuitBreaker::new(1, Duration::minutes(5));
        breaker.record_failure(t0());
        assert!(breaker.is_open(t0() + Duration::minutes(4)));
        assert!(!breaker.is_open(t0() + Duration::minutes(5)));
    }

    #[test]
    fn success_resets_streak_and_closes() {
        let breaker = CircuitBreaker::new(2, Duration::minutes(5));
        breaker.record_failure(t0());
        breaker.record_success();
        breaker.record_failure(t0());
        // Streak was reset, one failure is below threshold.
        assert!(!breaker.is_open(t0()));

        breaker.record_failure(t0());
        assert!(breaker.is_open(t0()));
        assert_eq!(breaker.times_opened(), 1);
        breaker.record_success();
        assert!(!breaker.is_open(t0()));
    }
}
