// =============================================================================
// Gap Detector — find missing and structurally suspect candles
// =============================================================================
//
// Walks a stored series in ascending time order and emits a gap whenever the
// interval between consecutive candles exceeds 1.5× the resolution period.
// A trailing gap between the last stored candle and "now" is emitted once the
// trailing span exceeds roughly two periods.
//
// Classification is the orchestrator's job; this module only annotates.  A
// companion scan finds "complete but suspect" candles (open==high==low==close)
// and treats each as a one-period gap even though a row exists.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::candles::store::CandleStore;
use crate::types::{Gap, Resolution};

/// Interval multiple beyond which consecutive candles imply a gap.
const GAP_FACTOR: f64 = 1.5;
/// Trailing span (in periods) beyond which the series is considered stale.
const TRAILING_FACTOR: f64 = 2.0;

pub struct GapDetector {
    store: Arc<CandleStore>,
}

impl GapDetector {
    pub fn new(store: Arc<CandleStore>) -> Self {
        Self { store }
    }

    /// Scan `[from, to)` for missing spans, including the trailing span up
    /// to `now`.
    pub fn scan(
        &self,
        instrument: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Gap> {
        let period = resolution.period();
        let period_secs = resolution.period_secs();
        let candles = self.store.range(instrument, resolution, from, to);

        let mut gaps = Vec::new();

        if candles.is_empty() {
            // Nothing stored at all: the whole window is one gap.
            let span_end = to.min(resolution.align(now));
            if span_end > from {
                let missing = ((span_end - from).num_seconds() / period_secs) as usize;
                if missing > 0 {
                    gaps.push(Gap {
                        instrument: instrument.to_string(),
                        resolution,
                        from,
                        to: span_end,
                        missing,
                        trailing: true,
                    });
                }
            }
            return gaps;
        }

        // Interior gaps: interval between consecutive candles > 1.5 periods.
        for pair in candles.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let interval = (next.period_start - prev.period_start).num_seconds();
            if interval as f64 > period_secs as f64 * GAP_FACTOR {
                let gap_from = prev.period_start + period;
                let gap_to = next.period_start;
                let missing = ((gap_to - gap_from).num_seconds() / period_secs) as usize;
                gaps.push(Gap {
                    instrument: instrument.to_string(),
                    resolution,
                    from: gap_from,
                    to: gap_to,
                    missing,
                    trailing: false,
                });
            }
        }

        // Trailing gap: last stored candle vs "now".
        if let Some(last) = candles.last() {
            let trailing_span = (now - last.period_end()).num_seconds();
            if trailing_span as f64 > period_secs as f64 * TRAILING_FACTOR {
                let gap_from = last.period_start + period;
                let gap_to = resolution.align(now);
                let missing = ((gap_to - gap_from).num_seconds() / period_secs) as usize;
                if missing > 0 {
                    gaps.push(Gap {
                        instrument: instrument.to_string(),
                        resolution,
                        from: gap_from,
                        to: gap_to,
                        missing,
                        trailing: true,
                    });
                }
            }
        }

        if !gaps.is_empty() {
            debug!(
                instrument,
                resolution = %resolution,
                gaps = gaps.len(),
                "gap scan found discontinuities"
            );
        }
        gaps
    }

    /// Find stored candles that are structurally suspect — a row exists but
    /// `open == high == low == close` — and report each as a one-period gap
    /// requiring re-fetch.  Incomplete single-tick base candles are included
    /// for the same reason.
    pub fn find_suspect(
        &self,
        instrument: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Gap> {
        self.store
            .range(instrument, resolution, from, to)
            .into_iter()
            .filter(|c| c.is_flat() || !c.complete)
            .map(|c| Gap {
                instrument: instrument.to_string(),
                resolution,
                from: c.period_start,
                to: c.period_end(),
                missing: 1,
                trailing: false,
            })
            .collect()
    }
}
