// =============================================================================
// Market Calendar — trading-session open/closed lookup per instrument class
// =============================================================================
//
// The engine never builds, heals, or flags gaps for periods the calendar
// marks closed.  Session rules here are deliberately coarse (UTC-based, no
// holiday table); the engine only consults the boundary.
// =============================================================================

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

use crate::types::InstrumentClass;

/// Result of a calendar lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub open: bool,
    pub reason: Option<&'static str>,
}

impl SessionState {
    fn open() -> Self {
        Self {
            open: true,
            reason: None,
        }
    }

    fn closed(reason: &'static str) -> Self {
        Self {
            open: false,
            reason: Some(reason),
        }
    }
}

/// Stateless calendar collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketCalendar;

impl MarketCalendar {
    pub fn new() -> Self {
        Self
    }

    /// Whether the market for `class` is open at `ts`.
    ///
    /// Rules (UTC):
    /// - Crypto: 24/7.
    /// - Forex and metals: closed from Friday 22:00 to Sunday 22:00.
    /// - Equities: weekdays 14:30–21:00 (regular US cash session).
    pub fn is_open(&self, class: InstrumentClass, ts: DateTime<Utc>) -> SessionState {
        match class {
            InstrumentClass::Crypto => SessionState::open(),
            InstrumentClass::Forex | InstrumentClass::Metal => Self::fx_session(ts),
            InstrumentClass::Equity => Self::equity_session(ts),
        }
    }

    /// True when every period boundary in [from, to) falls in a closed
    /// session — such a span is not a gap.
    pub fn fully_closed(
        &self,
        class: InstrumentClass,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        period_secs: i64,
    ) -> bool {
        let mut cursor = from;
        while cursor < to {
            if self.is_open(class, cursor).open {
                return false;
            }
            cursor += chrono::Duration::seconds(period_secs);
        }
        true
    }

    fn fx_session(ts: DateTime<Utc>) -> SessionState {
        let (weekday, hour) = (ts.weekday(), ts.hour());
        let closed = match weekday {
            Weekday::Sat => true,
            Weekday::Fri => hour >= 22,
            Weekday::Sun => hour < 22,
            _ => false,
        };
        if closed {
            SessionState::closed("fx weekend")
        } else {
            SessionState::open()
        }
    }

    fn equity_session(ts: DateTime<Utc>) -> SessionState {
        match ts.weekday() {
            Weekday::Sat | Weekday::Sun => return SessionState::closed("weekend"),
            _ => {}
        }
        let minutes = ts.hour() * 60 + ts.minute();
        // 14:30–21:00 UTC.
        if (14 * 60 + 30..21 * 60).contains(&minutes) {
            SessionState::open()
        } else {
            SessionState::closed("outside cash session")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn crypto_always_open() {
        let cal = MarketCalendar::new();
        let saturday = Utc.with_ymd_and_hms(2024, 3, 2, 3, 0, 0).unwrap();
        assert!(cal.is_open(InstrumentClass::Crypto, saturday).open);
    }

    #[test]
    fn fx_weekend_closed() {
        let cal = MarketCalendar::new();
        // Friday 23:00 UTC — closed.
        let fri_late = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        assert!(!cal.is_open(InstrumentClass::Forex, fri_late).open);
        // Saturday — closed.
        let sat = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        assert!(!cal.is_open(InstrumentClass::Forex, sat).open);
        // Sunday 23:00 UTC — open again.
        let sun_late = Utc.with_ymd_and_hms(2024, 3, 3, 23, 0, 0).unwrap();
        assert!(cal.is_open(InstrumentClass::Forex, sun_late).open);
        // Wednesday midday — open.
        let wed = Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap();
        assert!(cal.is_open(InstrumentClass::Forex, wed).open);
    }

    #[test]
    fn metals_follow_fx_hours() {
        let cal = MarketCalendar::new();
        let sat = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        assert!(!cal.is_open(InstrumentClass::Metal, sat).open);
    }

    #[test]
    fn equity_session_bounds() {
        let cal = MarketCalendar::new();
        let pre_open = Utc.with_ymd_and_hms(2024, 3, 6, 14, 0, 0).unwrap();
        assert!(!cal.is_open(InstrumentClass::Equity, pre_open).open);
        let mid = Utc.with_ymd_and_hms(2024, 3, 6, 15, 0, 0).unwrap();
        assert!(cal.is_open(InstrumentClass::Equity, mid).open);
        let post_close = Utc.with_ymd_and_hms(2024, 3, 6, 21, 30, 0).unwrap();
        assert!(!cal.is_open(InstrumentClass::Equity, post_close).open);
    }

    #[test]
    fn fully_closed_span_is_not_a_gap() {
        let cal = MarketCalendar::new();
        let from = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(); // Saturday
        let to = Utc.with_ymd_and_hms(2024, 3, 2, 6, 0, 0).unwrap();
        assert!(cal.fully_closed(InstrumentClass::Forex, from, to, 60));
        assert!(!cal.fully_closed(InstrumentClass::Crypto, from, to, 60));
    }
}
