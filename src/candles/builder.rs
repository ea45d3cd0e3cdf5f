// =============================================================================
// Candle Builder — base candles from ticks, higher resolutions bottom-up
// =============================================================================
//
// The base (1-minute) candle is computed from the tick store; every higher
// resolution aggregates its immediate source resolution.  A period is only
// built once its boundary has fully passed — no resolution writes a candle
// that would later need silent correction.
//
// All writes go through the store's save policy: live builds accumulate,
// `rebuild` overwrites (healing semantics) and is used to propagate repairs
// upward through the chain.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::candles::store::{CandleStore, SaveOutcome};
use crate::market_data::tick_store::TickStore;
use crate::metrics::EngineMetrics;
use crate::types::{Candle, Resolution, Tick};

/// Ticks required for a base candle to count as complete.  A single-tick
/// candle is still saved but flagged for closer gap-detector scrutiny.
const MIN_TICKS_COMPLETE: u32 = 2;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// Candle written (complete).
    Built,
    /// Candle written but below the completeness rule.
    BuiltIncomplete,
    /// No ticks / no source candles in the period — a gap candidate, nothing
    /// written.
    NoData,
    /// The period has not fully elapsed yet.
    PeriodOpen,
    /// The store refused the write (invalid or sealed period).
    Rejected(SaveOutcome),
}

// ---------------------------------------------------------------------------
// CandleBuilder
// ---------------------------------------------------------------------------

pub struct CandleBuilder {
    store: Arc<CandleStore>,
    tick_store: Arc<TickStore>,
    metrics: Arc<EngineMetrics>,
    /// Minimum source coverage for an aggregated candle to be complete.
    min_coverage: f64,
}

impl CandleBuilder {
    pub fn new(
        store: Arc<CandleStore>,
        tick_store: Arc<TickStore>,
        metrics: Arc<EngineMetrics>,
        min_coverage: f64,
    ) -> Self {
        Self {
            store,
            tick_store,
            metrics,
            min_coverage,
        }
    }

    pub fn store(&self) -> &Arc<CandleStore> {
        &self.store
    }

    // -------------------------------------------------------------------------
    // Base resolution
    // -------------------------------------------------------------------------

    /// Build the base candle for the minute starting at `period_start`
    /// (must be aligned).  Zero ticks is reported as a gap candidate, not
    /// silently skipped.
    pub fn build_base(
        &self,
        instrument: &str,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BuildOutcome {
        let period_start = Resolution::M1.align(period_start);
        if period_start + Resolution::M1.period() > now {
            return BuildOutcome::PeriodOpen;
        }

        let ticks = self.tick_store.ticks_for_minute(instrument, period_start);
        if ticks.is_empty() {
            debug!(instrument, %period_start, "no ticks for minute — gap candidate");
            return BuildOutcome::NoData;
        }

        let candle = candle_from_ticks(instrument, period_start, &ticks);
        self.write_live(candle)
    }

    // -------------------------------------------------------------------------
    // Aggregated resolutions
    // -------------------------------------------------------------------------

    /// Build one aggregated candle for `target` covering the period at
    /// `period_start` from its immediate source resolution.  Coverage below
    /// the configured ratio still saves (coverage is better than nothing)
    /// but marks the candle incomplete for gap follow-up.
    pub fn build_from_source(
        &self,
        instrument: &str,
        target: Resolution,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BuildOutcome {
        let Some(source) = target.source() else {
            warn!(instrument, resolution = %target, "base resolution has no source series");
            return BuildOutcome::NoData;
        };

        let period_start = target.align(period_start);
        if period_start + target.period() > now {
            return BuildOutcome::PeriodOpen;
        }

        match self.aggregate(instrument, target, source, period_start) {
            Some(candle) => self.write_live(candle),
            None => {
                debug!(
                    instrument,
                    resolution = %target,
                    %period_start,
                    "no source candles in period — gap candidate"
                );
                BuildOutcome::NoData
            }
        }
    }

    /// Force re-aggregation from current source data and overwrite the
    /// stored candle unconditionally.  Used after a lower resolution has
    /// been healed.
    pub fn rebuild(
        &self,
        instrument: &str,
        resolution: Resolution,
        period_start: DateTime<Utc>,
    ) -> BuildOutcome {
        let Some(source) = resolution.source() else {
            return BuildOutcome::NoData;
        };
        let period_start = resolution.align(period_start);

        match self.aggregate(instrument, resolution, source, period_start) {
            Some(candle) => {
                let incomplete = !candle.complete;
                match self.store.save_healed(candle) {
                    SaveOutcome::RejectedInvalid => {
                        self.metrics.candle_invalid();
                        BuildOutcome::Rejected(SaveOutcome::RejectedInvalid)
                    }
                    _ => {
                        self.metrics.candle_healed();
                        if incomplete {
                            self.metrics.candle_incomplete();
                            BuildOutcome::BuiltIncomplete
                        } else {
                            BuildOutcome::Built
                        }
                    }
                }
            }
            None => BuildOutcome::NoData,
        }
    }

    /// After healing `resolution` over [from, to), rebuild every affected
    /// period of every higher resolution, bottom-up, so the repair
    /// propagates through the whole chain.
    pub fn propagate_up(
        &self,
        instrument: &str,
        healed: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) {
        let mut level = healed.next_up();
        while let Some(resolution) = level {
            let mut period = resolution.align(from);
            let mut rebuilt = 0usize;
            while period < to {
                match self.rebuild(instrument, resolution, period) {
                    BuildOutcome::Built | BuildOutcome::BuiltIncomplete => rebuilt += 1,
                    _ => {}
                }
                period += resolution.period();
            }
            debug!(
                instrument,
                resolution = %resolution,
                rebuilt,
                "propagated healing upward"
            );
            level = resolution.next_up();
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn aggregate(
        &self,
        instrument: &str,
        target: Resolution,
        source: Resolution,
        period_start: DateTime<Utc>,
    ) -> Option<Candle> {
        let period_end = period_start + target.period();
        let sources = self.store.range(instrument, source, period_start, period_end);
        let (first, last) = (sources.first()?, sources.last()?);

        let expected = target.expected_source_count().max(1);
        let coverage = sources.len() as f64 / expected as f64;

        Some(Candle {
            instrument: instrument.to_string(),
            resolution: target,
            period_start,
            open: first.open,
            close: last.close,
            high: sources.iter().map(|c| c.high).fold(f64::MIN, f64::max),
            low: sources.iter().map(|c| c.low).fold(f64::MAX, f64::min),
            volume: sources.iter().map(|c| c.volume).sum(),
            spread: None,
            complete: coverage >= self.min_coverage,
            tick_count: sources.len() as u32,
        })
    }

    fn write_live(&self, candle: Candle) -> BuildOutcome {
        let incomplete = !candle.complete;
        match self.store.save_live(candle) {
            SaveOutcome::Inserted | SaveOutcome::Accumulated => {
                self.metrics.candle_built();
                if incomplete {
                    self.metrics.candle_incomplete();
                    BuildOutcome::BuiltIncomplete
                } else {
                    BuildOutcome::Built
                }
            }
            SaveOutcome::RejectedInvalid => {
                self.metrics.candle_invalid();
                BuildOutcome::Rejected(SaveOutcome::RejectedInvalid)
            }
            outcome => BuildOutcome::Rejected(outcome),
        }
    }
}

/// OHLCV fold over a minute of ticks: open = first, close = last,
/// high/low = extrema, volume = sum.
fn candle_from_ticks(instrument: &str, period_start: DateTime<Utc>, ticks: &[Tick]) -> Candle {
    let first = &ticks[0];
    let last = &ticks[ticks.len() - 1];

    Candle {
        instrument: instrument.to_string(),
        resolution: Resolution::M1,
        period_start,
        open: first.price,
        close: last.price,
        high: ticks.iter().map(|t| t.price).fold(f64::MIN, f64::max),
        low: ticks.iter().map(|t| t.price).fold(f64::MAX, f64::min),
        volume: ticks.iter().map(|t| t.volume).sum(),
        spread: None,
        complete: ticks.len() as u32 >= MIN_TICKS_COMPLETE,
        tick_count: ticks.len() as u32,
    }
}
