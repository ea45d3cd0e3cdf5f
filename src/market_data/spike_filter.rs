// =============================================================================
// Spike Filter — per-instrument price sanity check
// =============================================================================
//
// Rejects a new price whose absolute percentage change from the last accepted
// price exceeds a threshold.  Threshold resolution order:
//
//   1. base threshold per instrument class (tight for forex, loose for
//      crypto/equities);
//   2. doubled when the last accepted price is stale (> 5 min) — a genuine
//      market move over that interval is plausible;
//   3. widened further when rolling-window volatility (mean + 2·stddev of
//      step changes) exceeds the base threshold, capped at 3× base.
//
// All state is explicit and instance-owned; tests construct isolated filters.
// Rejections are counted, never thrown.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::runtime_config::EngineConfig;
use crate::types::InstrumentClass;

/// Volatility widening cap, as a multiple of the base threshold.
const MAX_WIDENING_FACTOR: f64 = 3.0;
/// Staleness widening factor.
const STALE_FACTOR: f64 = 2.0;

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Outcome of a single price check.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeVerdict {
    pub accepted: bool,
    /// Set on rejection; describes which rule fired.
    pub reason: Option<String>,
    /// True when accepted without prior history (spike cannot be evaluated).
    pub flagged: bool,
}

impl SpikeVerdict {
    fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
            flagged: false,
        }
    }

    fn accept_flagged() -> Self {
        Self {
            accepted: true,
            reason: None,
            flagged: true,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            flagged: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-instrument rolling state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PriceState {
    last_price: f64,
    last_at: DateTime<Utc>,
    /// Bounded rolling window of recent accepted prices.
    history: VecDeque<f64>,
    /// Volatility of step changes as a fraction (mean + 2·stddev).
    volatility: f64,
    rejections: u64,
}

impl PriceState {
    fn new(price: f64, at: DateTime<Utc>) -> Self {
        let mut history = VecDeque::new();
        history.push_back(price);
        Self {
            last_price: price,
            last_at: at,
            history,
            volatility: 0.0,
            rejections: 0,
        }
    }

    fn push(&mut self, price: f64, at: DateTime<Utc>, cap: usize) {
        self.history.push_back(price);
        while self.history.len() > cap {
            self.history.pop_front();
        }
        self.last_price = price;
        self.last_at = at;
        self.volatility = Self::compute_volatility(&self.history);
    }

    /// Mean + 2·stddev of absolute fractional step changes over the window.
    fn compute_volatility(history: &VecDeque<f64>) -> f64 {
        if history.len() < 3 {
            return 0.0;
        }
        let steps: Vec<f64> = history
            .iter()
            .zip(history.iter().skip(1))
            .filter(|(a, _)| **a > 0.0)
            .map(|(a, b)| ((b - a) / a).abs())
            .collect();
        if steps.is_empty() {
            return 0.0;
        }
        let mean = steps.iter().sum::<f64>() / steps.len() as f64;
        let var = steps.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / steps.len() as f64;
        mean + 2.0 * var.sqrt()
    }
}

// ---------------------------------------------------------------------------
// SpikeFilter
// ---------------------------------------------------------------------------

/// Stateless-per-call check with per-instrument rolling state.
pub struct SpikeFilter {
    states: RwLock<HashMap<String, PriceState>>,
    /// Base thresholds per class, as fractions (config carries percent).
    thresholds: HashMap<InstrumentClass, f64>,
    history_len: usize,
    stale_after: Duration,
}

impl SpikeFilter {
    pub fn new(config: &EngineConfig) -> Self {
        let classes = [
            InstrumentClass::Forex,
            InstrumentClass::Metal,
            InstrumentClass::Crypto,
            InstrumentClass::Equity,
        ];
        let thresholds = classes
            .into_iter()
            .map(|c| (c, config.spike_threshold_pct(c) / 100.0))
            .collect();

        Self {
            states: RwLock::new(HashMap::new()),
            thresholds,
            history_len: config.spike_history_len,
            stale_after: Duration::seconds(config.stale_price_secs),
        }
    }

    /// Check a price against the instrument's rolling state.  Does not
    /// mutate state — call [`update_price`](Self::update_price) after the
    /// tick is accepted downstream.
    pub fn check(
        &self,
        instrument: &str,
        class: InstrumentClass,
        price: f64,
        now: DateTime<Utc>,
    ) -> SpikeVerdict {
        let base = self
            .thresholds
            .get(&class)
            .copied()
            .unwrap_or(0.01);

        let states = self.states.read();
        let Some(state) = states.get(instrument) else {
            // No prior history: cannot evaluate a spike. Accept, but flag.
            debug!(instrument, price, "first price for instrument — accepted with flag");
            return SpikeVerdict::accept_flagged();
        };

        let mut threshold = base;
        if now - state.last_at > self.stale_after {
            threshold *= STALE_FACTOR;
        }
        if state.volatility > base {
            threshold = threshold.max(state.volatility).min(base * MAX_WIDENING_FACTOR);
        }

        let change = ((price - state.last_price) / state.last_price).abs();
        if change > threshold {
            drop(states);
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(instrument) {
                state.rejections += 1;
            }
            let reason = format!(
                "price change {:.3}% exceeds threshold {:.3}%",
                change * 100.0,
                threshold * 100.0
            );
            warn!(instrument, price, %reason, "spike rejected");
            return SpikeVerdict::reject(reason);
        }

        SpikeVerdict::accept()
    }

    /// Record an accepted price: append to history, refresh volatility.
    pub fn update_price(&self, instrument: &str, price: f64, now: DateTime<Utc>) {
        let mut states = self.states.write();
        match states.get_mut(instrument) {
            Some(state) => state.push(price, now, self.history_len),
            None => {
                states.insert(instrument.to_string(), PriceState::new(price, now));
            }
        }
    }

    /// Seed an instrument's history from persisted closes (oldest first) so a
    /// restart neither treats the first tick as unconditionally valid nor
    /// resets volatility.
    pub fn seed(&self, instrument: &str, closes: &[(DateTime<Utc>, f64)]) {
        if closes.is_empty() {
            return;
        }
        let mut states = self.states.write();
        let (first_at, first_price) = closes[0];
        let mut state = PriceState::new(first_price, first_at);
        for (at, price) in &closes[1..] {
            state.push(*price, *at, self.history_len);
        }
        debug!(
            instrument,
            seeded = closes.len(),
            volatility = state.volatility,
            "spike filter seeded from persisted closes"
        );
        states.insert(instrument.to_string(), state);
    }

    /// Rejection count for one instrument (observability).
    pub fn rejections(&self, instrument: &str) -> u64 {
        self.states
            .read()
            .get(instrument)
            .map_or(0, |s| s.rejections)
    }

    #[cfg(test)]
    fn volatility(&self, instrument: &str) -> f64 {
        self.states
            .read()
            .get(instrument)
            .map_or(0.0, |s| s.volatility)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    #[test]
    fn first_price_accepted_but_flagged() {
        let filter = SpikeFilter::new(&cfg());
        let v = filter.check("EURUSD", InstrumentClass::Forex, 1.1000, t0());
        assert!(v.accepted);
        assert!(v.flagged);
    }

    #[test]
    fn small_move_accepted_large_move_rejected() {
        let filter = SpikeFilter::new(&cfg());
        filter.update_price("EURUSD", 1.1000, t0());

        // 0.02% move — well under the 0.5% forex base threshold.
        let v = filter.check("EURUSD", InstrumentClass::Forex, 1.1002, t0());
        assert!(v.accepted);
        assert!(!v.flagged);

        // ~18% jump with fresh last price and no volatility — rejected.
        let v = filter.check("EURUSD", InstrumentClass::Forex, 1.3000, t0());
        assert!(!v.accepted);
        assert!(v.reason.is_some());
        assert_eq!(filter.rejections("EURUSD"), 1);
    }

    #[test]
    fn stale_price_doubles_threshold() {
        let filter = SpikeFilter::new(&cfg());
        filter.update_price("EURUSD", 1.1000, t0());

        // 0.8% move: above base (0.5%) but below the stale-widened 1.0%.
        let price = 1.1000 * 1.008;
        let fresh = filter.check("EURUSD", InstrumentClass::Forex, price, t0());
        assert!(!fresh.accepted);

        let later = t0() + Duration::minutes(6);
        let stale = filter.check("EURUSD", InstrumentClass::Forex, price, later);
        assert!(stale.accepted);
    }

    #[test]
    fn volatility_widens_threshold_with_cap() {
        let filter = SpikeFilter::new(&cfg());
        // Feed a jagged series to build volatility above the forex base.
        let mut price = 1.1000;
        let mut now = t0();
        filter.update_price("EURUSD", price, now);
        for i in 0..20 {
            let mag = if i % 2 == 0 { 0.004 } else { 0.012 };
            let dir = if i % 4 < 2 { 1.0 } else { -1.0 };
            price *= 1.0 + dir * mag;
            now += Duration::seconds(5);
            filter.update_price("EURUSD", price, now);
        }
        assert!(filter.volatility("EURUSD") > 0.005);

        // A 1% move passes under the widened threshold...
        let v = filter.check("EURUSD", InstrumentClass::Forex, price * 1.01, now);
        assert!(v.accepted);
        // ...but the cap at 3× base (1.5%) still rejects a 2% move.
        let v = filter.check("EURUSD", InstrumentClass::Forex, price * 1.02, now);
        assert!(!v.accepted);
    }

    #[test]
    fn crypto_threshold_is_looser() {
        let filter = SpikeFilter::new(&cfg());
        filter.update_price("BTCUSD", 40_000.0, t0());
        // 2% move: rejected for forex, fine for crypto (3% base).
        let v = filter.check("BTCUSD", InstrumentClass::Crypto, 40_800.0, t0());
        assert!(v.accepted);
    }

    #[test]
    fn seeding_restores_history() {
        let filter = SpikeFilter::new(&cfg());
        let closes: Vec<(DateTime<Utc>, f64)> = (0..10)
            .map(|i| (t0() + Duration::minutes(i), 1.1000 + i as f64 * 0.0001))
            .collect();
        filter.seed("EURUSD", &closes);

        // Seeded: a fresh spike is evaluated (and rejected), not flagged.
        let v = filter.check("EURUSD", InstrumentClass::Forex, 1.3, t0() + Duration::minutes(10));
        assert!(!v.accepted);
    }
}
