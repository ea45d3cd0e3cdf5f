// =============================================================================
// Candle Store — source of truth for candle state
// =============================================================================
//
// A time-series table keyed by (instrument, resolution, period_start), one
// row per candle.  All components mutate it only through the save operations
// here, which centralise the single most important correctness rule in the
// system: accumulate for streaming, overwrite for healing.
//
// Every mutation is a read-modify-write under the table write lock, so
// concurrent live accumulates from tick bursts cannot race, and a healing
// overwrite marks the period closed so a late-arriving live write for the
// same period is rejected rather than silently clobbering healed data.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::types::{Candle, Resolution};

// ---------------------------------------------------------------------------
// Keys and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct SeriesKey {
    instrument: String,
    resolution: Resolution,
}

/// Result of a save operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new row was inserted.
    Inserted,
    /// A live write extended an existing open row in place.
    Accumulated,
    /// A healing write replaced every field of an existing row.
    Overwritten,
    /// The candle failed structural validation and was not written.
    RejectedInvalid,
    /// A live write targeted a period already closed by healing.
    RejectedClosed,
}

/// One stored row: the candle plus whether its period has been sealed by a
/// healing write.
#[derive(Debug, Clone)]
struct StoredRow {
    candle: Candle,
    healed: bool,
}

// ---------------------------------------------------------------------------
// CandleStore
// ---------------------------------------------------------------------------

/// Thread-safe candle table.  The persistence engine behind this boundary is
/// an external concern; everything in the engine talks only to this API.
pub struct CandleStore {
    series: RwLock<HashMap<SeriesKey, BTreeMap<i64, StoredRow>>>,
}

impl CandleStore {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Save policy
    // -------------------------------------------------------------------------

    /// Live write (streaming, still-open period): accumulate into any
    /// existing row — `high = max`, `low = min`, `close = new`,
    /// `volume += new`.  Rejected when the period has been sealed by a
    /// healing overwrite.
    pub fn save_live(&self, candle: Candle) -> SaveOutcome {
        if !candle.is_valid() {
            warn!(
                instrument = %candle.instrument,
                resolution = %candle.resolution,
                period_start = %candle.period_start,
                "rejected structurally invalid candle (live write)"
            );
            return SaveOutcome::RejectedInvalid;
        }

        let key = SeriesKey {
            instrument: candle.instrument.clone(),
            resolution: candle.resolution,
        };
        let ts = candle.period_start.timestamp();

        let mut map = self.series.write();
        let ring = map.entry(key).or_default();

        match ring.get_mut(&ts) {
            Some(row) if row.healed => SaveOutcome::RejectedClosed,
            Some(row) => {
                let existing = &mut row.candle;
                existing.high = existing.high.max(candle.high);
                existing.low = existing.low.min(candle.low);
                existing.close = candle.close;
                existing.volume += candle.volume;
                existing.tick_count += candle.tick_count;
                existing.complete = existing.complete || candle.complete;
                if candle.spread.is_some() {
                    existing.spread = candle.spread;
                }
                SaveOutcome::Accumulated
            }
            None => {
                ring.insert(
                    ts,
                    StoredRow {
                        candle,
                        healed: false,
                    },
                );
                SaveOutcome::Inserted
            }
        }
    }

    /// Healing write (backfill or forced rebuild): authoritative historical
    /// truth.  Overwrites every field unconditionally and seals the period
    /// against further live accumulation.
    pub fn save_healed(&self, candle: Candle) -> SaveOutcome {
        if !candle.is_valid() {
            warn!(
                instrument = %candle.instrument,
                resolution = %candle.resolution,
                period_start = %candle.period_start,
                "rejected structurally invalid candle (healing write)"
            );
            return SaveOutcome::RejectedInvalid;
        }

        let key = SeriesKey {
            instrument: candle.instrument.clone(),
            resolution: candle.resolution,
        };
        let ts = candle.period_start.timestamp();

        let mut map = self.series.write();
        let ring = map.entry(key).or_default();

        let existed = ring
            .insert(
                ts,
                StoredRow {
                    candle,
                    healed: true,
                },
            )
            .is_some();

        if existed {
            SaveOutcome::Overwritten
        } else {
            SaveOutcome::Inserted
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(
        &self,
        instrument: &str,
        resolution: Resolution,
        period_start: DateTime<Utc>,
    ) -> Option<Candle> {
        let map = self.series.read();
        map.get(&SeriesKey {
            instrument: instrument.to_string(),
            resolution,
        })
        .and_then(|ring| ring.get(&period_start.timestamp()))
        .map(|row| row.candle.clone())
    }

    /// All candles with `from <= period_start < to`, ascending.
    pub fn range(
        &self,
        instrument: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Candle> {
        let map = self.series.read();
        match map.get(&SeriesKey {
            instrument: instrument.to_string(),
            resolution,
        }) {
            Some(ring) => ring
                .range(from.timestamp()..to.timestamp())
                .map(|(_, row)| row.candle.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The most recent candle of a series, if any.
    pub fn latest(&self, instrument: &str, resolution: Resolution) -> Option<Candle> {
        let map = self.series.read();
        map.get(&SeriesKey {
            instrument: instrument.to_string(),
            resolution,
        })
        .and_then(|ring| ring.values().next_back())
        .map(|row| row.candle.clone())
    }

    /// The last `n` base-resolution closes, oldest first.  Used to reseed the
    /// spike filter on process start.
    pub fn recent_closes(&self, instrument: &str, n: usize) -> Vec<(DateTime<Utc>, f64)> {
        let map = self.series.read();
        match map.get(&SeriesKey {
            instrument: instrument.to_string(),
            resolution: Resolution::M1,
        }) {
            Some(ring) => {
                let mut closes: Vec<(DateTime<Utc>, f64)> = ring
                    .values()
                    .rev()
                    .take(n)
                    .map(|row| (row.candle.period_start, row.candle.close))
                    .collect();
                closes.reverse();
                closes
            }
            None => Vec::new(),
        }
    }

    pub fn count(&self, instrument: &str, resolution: Resolution) -> usize {
        let map = self.series.read();
        map.get(&SeriesKey {
            instrument: instrument.to_string(),
            resolution,
        })
        .map_or(0, BTreeMap::len)
    }

    /// Delete all candles with `from <= period_start < to`; returns how many
    /// rows were removed.
    pub fn delete_range(
        &self,
        instrument: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> usize {
        let mut map = self.series.write();
        let Some(ring) = map.get_mut(&SeriesKey {
            instrument: instrument.to_string(),
            resolution,
        }) else {
            return 0;
        };

        let keys: Vec<i64> = ring
            .range(from.timestamp()..to.timestamp())
            .map(|(k, _)| *k)
            .collect();
        let removed = keys.len();
        for k in &keys {
            ring.remove(k);
        }
        if removed > 0 {
            debug!(
                instrument,
                resolution = %resolution,
                removed,
                "deleted candle range"
            );
        }
        removed
    }
}

impl Default for CandleStore {
    fn default() -> Self {
        Self::new()
    }
}
