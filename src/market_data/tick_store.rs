// =============================================================================
// Tick Store — buffered ingestion with durable flush
// =============================================================================
//
// Validated ticks land in a bounded in-memory buffer per instrument and are
// flushed to the durable tick log once the buffer reaches a threshold.  The
// flush is a batched append; a batch failure falls back to per-tick insertion
// so one bad row does not lose the whole batch.
//
// Ticks exist solely to build the base-resolution candle; the log retains
// only a bounded recent window and is pruned by the daily cleanup.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::market_data::spike_filter::SpikeFilter;
use crate::metrics::EngineMetrics;
use crate::runtime_config::EngineConfig;
use crate::types::{InstrumentClass, Tick, TickSource};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of offering one tick to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl TickOutcome {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Durable tick log
// ---------------------------------------------------------------------------

/// The persistence boundary for flushed ticks, keyed by instrument and
/// timestamp (ms).  Append-only plus retention pruning.
struct TickLog {
    rows: RwLock<HashMap<String, BTreeMap<i64, Vec<Tick>>>>,
}

impl TickLog {
    fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Batched append.  Fails the whole batch when any row is structurally
    /// unstorable, so the caller can fall back to per-tick insertion.
    fn append_batch(&self, ticks: &[Tick]) -> Result<usize> {
        if ticks.iter().any(|t| !t.price.is_finite() || t.price <= 0.0) {
            bail!("batch contains unstorable tick rows");
        }
        let mut rows = self.rows.write();
        for tick in ticks {
            rows.entry(tick.instrument.clone())
                .or_default()
                .entry(tick.timestamp.timestamp_millis())
                .or_default()
                .push(tick.clone());
        }
        Ok(ticks.len())
    }

    /// Single-row append; skips (but reports) an unstorable row.
    fn append_one(&self, tick: &Tick) -> Result<()> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            bail!("unstorable tick row: price {}", tick.price);
        }
        let mut rows = self.rows.write();
        rows.entry(tick.instrument.clone())
            .or_default()
            .entry(tick.timestamp.timestamp_millis())
            .or_default()
            .push(tick.clone());
        Ok(())
    }

    fn range(&self, instrument: &str, from_ms: i64, to_ms: i64) -> Vec<Tick> {
        let rows = self.rows.read();
        match rows.get(instrument) {
            Some(by_ts) => by_ts
                .range(from_ms..to_ms)
                .flat_map(|(_, v)| v.iter().cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut removed = 0;
        let mut rows = self.rows.write();
        for by_ts in rows.values_mut() {
            let keys: Vec<i64> = by_ts.range(..cutoff_ms).map(|(k, _)| *k).collect();
            for k in keys {
                if let Some(v) = by_ts.remove(&k) {
                    removed += v.len();
                }
            }
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// TickStore
// ---------------------------------------------------------------------------

pub struct TickStore {
    buffers: RwLock<HashMap<String, VecDeque<Tick>>>,
    log: TickLog,
    spike_filter: Arc<SpikeFilter>,
    metrics: Arc<EngineMetrics>,
    buffer_cap: usize,
    flush_threshold: usize,
}

impl TickStore {
    pub fn new(
        config: &EngineConfig,
        spike_filter: Arc<SpikeFilter>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            log: TickLog::new(),
            spike_filter,
            metrics,
            buffer_cap: config.tick_buffer_cap,
            flush_threshold: config.tick_flush_threshold,
        }
    }

    /// Offer one tick.  Rejects non-positive/non-finite prices outright,
    /// then consults the spike filter; accepted ticks are buffered and the
    /// buffer flushed once it reaches the threshold count.
    pub fn add_tick(
        &self,
        instrument: &str,
        class: InstrumentClass,
        price: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
        source: TickSource,
    ) -> TickOutcome {
        self.metrics.tick_received();

        if !price.is_finite() || price <= 0.0 {
            self.metrics.tick_rejected();
            return TickOutcome::rejected(format!("invalid price: {price}"));
        }

        let verdict = self.spike_filter.check(instrument, class, price, timestamp);
        if !verdict.accepted {
            self.metrics.tick_rejected();
            self.metrics.spike_rejection();
            return TickOutcome::rejected(
                verdict.reason.unwrap_or_else(|| "spike rejected".into()),
            );
        }
        self.spike_filter.update_price(instrument, price, timestamp);

        let tick = Tick {
            instrument: instrument.to_string(),
            price,
            volume: if volume.is_finite() && volume > 0.0 {
                volume
            } else {
                0.0
            },
            timestamp,
            source,
            flagged: verdict.flagged,
        };

        let should_flush = {
            let mut buffers = self.buffers.write();
            let buf = buffers.entry(instrument.to_string()).or_default();
            buf.push_back(tick);
            while buf.len() > self.buffer_cap {
                buf.pop_front();
            }
            buf.len() >= self.flush_threshold
        };

        if should_flush {
            self.flush(instrument);
        }

        self.metrics.tick_accepted();
        TickOutcome::accepted()
    }

    /// Flush one instrument's buffer to the durable log.
    pub fn flush(&self, instrument: &str) {
        let drained: Vec<Tick> = {
            let mut buffers = self.buffers.write();
            match buffers.get_mut(instrument) {
                Some(buf) => buf.drain(..).collect(),
                None => return,
            }
        };
        if drained.is_empty() {
            return;
        }

        match self.log.append_batch(&drained) {
            Ok(n) => debug!(instrument, flushed = n, "tick batch flushed"),
            Err(e) => {
                // One bad row must not lose the batch: fall back to per-tick
                // insertion and drop only the rows that cannot be stored.
                warn!(instrument, error = %e, "batch flush failed — falling back to per-tick insert");
                let mut stored = 0usize;
                for tick in &drained {
                    match self.log.append_one(tick) {
                        Ok(()) => stored += 1,
                        Err(e) => warn!(instrument, error = %e, "dropping unstorable tick"),
                    }
                }
                debug!(instrument, stored, total = drained.len(), "per-tick fallback completed");
            }
        }
    }

    /// Flush every buffered instrument.  Called on shutdown so no buffered
    /// tick is lost.
    pub fn flush_all(&self) {
        let instruments: Vec<String> = self.buffers.read().keys().cloned().collect();
        for instrument in instruments {
            self.flush(&instrument);
        }
    }

    /// Union of buffered and flushed ticks inside the exact one-minute
    /// window, deduplicated by (price, timestamp), ascending by timestamp.
    pub fn ticks_for_minute(&self, instrument: &str, minute_start: DateTime<Utc>) -> Vec<Tick> {
        let from_ms = minute_start.timestamp_millis();
        let to_ms = (minute_start + Duration::minutes(1)).timestamp_millis();

        let mut ticks = self.log.range(instrument, from_ms, to_ms);

        {
            let buffers = self.buffers.read();
            if let Some(buf) = buffers.get(instrument) {
                ticks.extend(
                    buf.iter()
                        .filter(|t| {
                            let ms = t.timestamp.timestamp_millis();
                            ms >= from_ms && ms < to_ms
                        })
                        .cloned(),
                );
            }
        }

        // Sort by (timestamp, price bits) so duplicates are adjacent even
        // when another tick shares the millisecond, then dedup: buffered
        // ticks may already have been flushed once.
        ticks.sort_by_key(|t| (t.timestamp, t.price.to_bits()));
        ticks.dedup_by(|a, b| {
            a.timestamp == b.timestamp && a.price.to_bits() == b.price.to_bits()
        });
        ticks
    }

    /// Count of buffered (unflushed) ticks for one instrument.
    pub fn buffered(&self, instrument: &str) -> usize {
        self.buffers.read().get(instrument).map_or(0, VecDeque::len)
    }

    /// Drop flushed ticks older than `cutoff`; returns rows removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        self.log.prune_older_than(cutoff)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> TickStore {
        let config = EngineConfig::default();
        let metrics = Arc::new(EngineMetrics::new());
        let filter = Arc::new(SpikeFilter::new(&config));
        TickStore::new(&config, filter, metrics)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    #[test]
    fn rejects_invalid_prices_outright() {
        let s = store();
        let cls = InstrumentClass::Forex;
        assert!(!s.add_tick("EURUSD", cls, 0.0, 1.0, t0(), TickSource::Live).accepted);
        assert!(!s.add_tick("EURUSD", cls, -1.0, 1.0, t0(), TickSource::Live).accepted);
        assert!(!s.add_tick("EURUSD", cls, f64::NAN, 1.0, t0(), TickSource::Live).accepted);
        assert_eq!(s.buffered("EURUSD"), 0);
    }

    #[test]
    fn spike_rejection_does_not_buffer() {
        let s = store();
        let cls = InstrumentClass::Forex;
        s.add_tick("EURUSD", cls, 1.1000, 1.0, t0(), TickSource::Live);
        let out = s.add_tick("EURUSD", cls, 1.3000, 1.0, t0(), TickSource::Live);
        assert!(!out.accepted);
        assert!(out.reason.unwrap().contains("exceeds threshold"));
        assert_eq!(s.buffered("EURUSD"), 1);
    }

    #[test]
    fn minute_query_unions_buffer_and_log() {
        let s = store();
        let cls = InstrumentClass::Forex;
        let prices = [1.1000, 1.1002, 1.0999, 1.1003, 1.1001];
        for (i, p) in prices.iter().enumerate() {
            let ts = t0() + Duration::seconds(i as i64 * 10);
            assert!(s.add_tick("EURUSD", cls, *p, 1.0, ts, TickSource::Live).accepted);
        }

        // Flush half-way through: the union must still see all five.
        s.flush("EURUSD");
        let next_min = t0() + Duration::seconds(70);
        s.add_tick("EURUSD", cls, 1.1002, 1.0, next_min, TickSource::Live);

        let ticks = s.ticks_for_minute("EURUSD", t0());
        assert_eq!(ticks.len(), 5);
        assert!((ticks[0].price - 1.1000).abs() < f64::EPSILON);
        assert!((ticks[4].price - 1.1001).abs() < f64::EPSILON);
    }

    #[test]
    fn dedup_by_price_and_timestamp() {
        let s = store();
        let cls = InstrumentClass::Crypto;
        let ts = t0();
        s.add_tick("BTCUSD", cls, 40_000.0, 1.0, ts, TickSource::Live);
        s.flush("BTCUSD");
        // Same (price, timestamp) arriving again (e.g. vendor replay).
        s.add_tick("BTCUSD", cls, 40_000.0, 1.0, ts, TickSource::Live);

        let ticks = s.ticks_for_minute("BTCUSD", t0());
        assert_eq!(ticks.len(), 1);
    }

    #[test]
    fn dedup_survives_interleaved_same_millisecond_ticks() {
        let s = store();
        let cls = InstrumentClass::Crypto;
        let ts = t0();
        s.add_tick("BTCUSD", cls, 40_000.0, 1.0, ts, TickSource::Live);
        s.add_tick("BTCUSD", cls, 40_100.0, 1.0, ts, TickSource::Live);
        s.flush("BTCUSD");
        // The replayed duplicate arrives after another tick in the same
        // millisecond, so it is not adjacent until sorted by price too.
        s.add_tick("BTCUSD", cls, 40_000.0, 1.0, ts, TickSource::Live);

        let ticks = s.ticks_for_minute("BTCUSD", t0());
        assert_eq!(ticks.len(), 2);
        let volume: f64 = ticks.iter().map(|t| t.volume).sum();
        assert!((volume - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn flush_all_drains_buffers() {
        let s = store();
        let cls = InstrumentClass::Forex;
        s.add_tick("EURUSD", cls, 1.1000, 1.0, t0(), TickSource::Live);
        s.add_tick("GBPUSD", cls, 1.2500, 1.0, t0(), TickSource::Live);
        assert_eq!(s.buffered("EURUSD"), 1);
        s.flush_all();
        assert_eq!(s.buffered("EURUSD"), 0);
        assert_eq!(s.buffered("GBPUSD"), 0);
        assert_eq!(s.ticks_for_minute("GBPUSD", t0()).len(), 1);
    }

    #[test]
    fn prune_removes_old_rows() {
        let s = store();
        let cls = InstrumentClass::Crypto;
        s.add_tick("BTCUSD", cls, 40_000.0, 1.0, t0(), TickSource::Live);
        s.flush("BTCUSD");
        let removed = s.prune_older_than(t0() + Duration::hours(49));
        assert_eq!(removed, 1);
        assert!(s.ticks_for_minute("BTCUSD", t0()).is_empty());
    }

    #[test]
    fn flagged_first_tick_carries_flag() {
        let s = store();
        s.add_tick("EURUSD", InstrumentClass::Forex, 1.1, 1.0, t0(), TickSource::Live);
        let ticks = {
            s.flush("EURUSD");
            s.ticks_for_minute("EURUSD", t0())
        };
        assert!(ticks[0].flagged);
    }
}
