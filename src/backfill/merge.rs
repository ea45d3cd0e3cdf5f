// =============================================================================
// Provider Merge — primary-first fetching with secondary fill-in
// =============================================================================
//
// The primary vendor is always asked first.  Its answer is kept as-is when it
// covers enough of the requested window; otherwise the secondary vendor is
// asked for the same window and the two result sets are merged per period,
// with the primary winning every timestamp both vendors returned.
//
// A rate limit from the primary always escalates — the secondary is not a
// place to hide throttling from the circuit breaker.  Other primary failures
// fall through to the secondary when one is configured.
// =============================================================================

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::backfill::provider::{PacedFetcher, ProviderError};
use crate::types::{Candle, Instrument, Resolution};

pub struct MergedProvider {
    primary: PacedFetcher,
    secondary: Option<PacedFetcher>,
    min_coverage: f64,
}

/// Result of a merged fetch, annotated with where the bars came from.
#[derive(Debug)]
pub struct MergedFetch {
    pub candles: Vec<Candle>,
    pub primary_count: usize,
    pub secondary_count: usize,
}

impl MergedProvider {
    pub fn new(primary: PacedFetcher, secondary: Option<PacedFetcher>, min_coverage: f64) -> Self {
        Self {
            primary,
            secondary,
            min_coverage,
        }
    }

    pub fn primary_name(&self) -> &str {
        self.primary.provider_name()
    }

    fn coverage(candles: &[Candle], resolution: Resolution, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        let expected = (to - from).num_seconds() / resolution.period_secs();
        if expected <= 0 {
            return 1.0;
        }
        candles.len() as f64 / expected as f64
    }

    pub async fn fetch(
        &self,
        instrument: &Instrument,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<MergedFetch, ProviderError> {
        let primary_result = self.primary.fetch_range(instrument, resolution, from, to).await;

        let primary_candles = match primary_result {
            Ok(candles) => {
                let coverage = Self::coverage(&candles, resolution, from, to);
                if coverage >= self.min_coverage || self.secondary.is_none() {
                    return Ok(MergedFetch {
                        primary_count: candles.len(),
                        secondary_count: 0,
                        candles,
                    });
                }
                info!(
                    instrument = %instrument.code,
                    resolution = %resolution,
                    coverage = format!("{coverage:.2}"),
                    "primary coverage below threshold, consulting secondary"
                );
                candles
            }
            Err(ProviderError::RateLimited) => return Err(ProviderError::RateLimited),
            Err(e) => {
                let Some(secondary) = &self.secondary else {
                    return Err(e);
                };
                warn!(
                    provider = self.primary.provider_name(),
                    instrument = %instrument.code,
                    error = %e,
                    "primary fetch failed, falling back to secondary"
                );
                let candles = secondary.fetch_range(instrument, resolution, from, to).await?;
                return Ok(MergedFetch {
                    primary_count: 0,
                    secondary_count: candles.len(),
                    candles,
                });
            }
        };

        let secondary = self.secondary.as_ref().unwrap();
        let secondary_candles = match secondary.fetch_range(instrument, resolution, from, to).await {
            Ok(candles) => candles,
            Err(e) => {
                // Partial primary data beats nothing.
                warn!(
                    provider = secondary.provider_name(),
                    instrument = %instrument.code,
                    error = %e,
                    "secondary fetch failed, keeping partial primary data"
                );
                return Ok(MergedFetch {
                    primary_count: primary_candles.len(),
                    secondary_count: 0,
                    candles: primary_candles,
                });
            }
        };

        Ok(merge_series(primary_candles, secondary_candles))
    }
}

/// Merge two vendor series per period start, primary winning ties.
fn merge_series(primary: Vec<Candle>, secondary: Vec<Candle>) -> MergedFetch {
    let primary_count = primary.len();
    let mut by_period: BTreeMap<i64, Candle> = BTreeMap::new();

    for candle in secondary {
        by_period.insert(candle.period_start.timestamp(), candle);
    }
    let mut secondary_count = by_period.len();
    for candle in primary {
        if by_period.insert(candle.period_start.timestamp(), candle).is_some() {
            secondary_count -= 1;
        }
    }

    MergedFetch {
        candles: by_period.into_values().collect(),
        primary_count,
        secondary_count,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    fn bar(minute: i64, close: f64) -> Candle {
        Candle {
            instrument: "EURUSD".into(),
            resolution: Resolution::M1,
            period_start: t0() + Duration::minutes(minute),
            open: close,
            high: close + 0.001,
            low: close - 0.001,
            close,
            volume: 1.0,
            spread: None,
            complete: true,
            tick_count: 0,
        }
    }

    #[test]
    fn primary_wins_shared_timestamps() {
        let primary = vec![bar(0, 1.10), bar(2, 1.12)];
        let secondary = vec![bar(0, 9.99), bar(1, 1.11), bar(2, 9.99)];

        let merged = merge_series(primary, secondary);
        assert_eq!(merged.candles.len(), 3);
        assert_eq!(merged.primary_count, 2);
        assert_eq!(merged.secondary_count, 1);

        // Timestamps both vendors returned keep the primary's close.
        assert!((merged.candles[0].close - 1.10).abs() < 1e-9);
        assert!((merged.candles[1].close - 1.11).abs() < 1e-9);
        assert!((merged.candles[2].close - 1.12).abs() < 1e-9);
    }

    #[test]
    fn merged_output_is_ascending() {
        let primary = vec![bar(5, 1.15)];
        let secondary = vec![bar(3, 1.13), bar(1, 1.11)];

        let merged = merge_series(primary, secondary);
        let starts: Vec<_> = merged.candles.iter().map(|c| c.period_start).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn coverage_counts_periods() {
        let candles: Vec<Candle> = (0..8).map(|m| bar(m, 1.10)).collect();
        let cov = MergedProvider::coverage(
            &candles,
            Resolution::M1,
            t0(),
            t0() + Duration::minutes(10),
        );
        assert!((cov - 0.8).abs() < 1e-9);
    }
}
