// =============================================================================
// Healing Orchestrator — the self-repair loop
// =============================================================================
//
// Ties the pipeline together as a set of scheduled passes:
//
//   build      — fold closed tick minutes into base candles, then cascade
//                closed aggregate periods bottom-up
//   scan       — gap-detect each instrument of a tier and enqueue heal work
//   drain      — claim queue items and backfill them through the provider
//                stack, guarded by the circuit breaker
//   integrity  — recompute per-day expected/actual/incomplete rollups
//   cleanup    — drop expired ticks and finished queue items
//
// Every pass takes `now` from the caller: the main loop passes wall time, a
// test passes whatever instant it wants.  No pass holds a lock across an
// await.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::backfill::{MergedProvider, ProviderError};
use crate::calendar::MarketCalendar;
use crate::candles::{CandleBuilder, CandleStore, GapDetector, SaveOutcome};
use crate::catalog::SymbolCatalog;
use crate::heal::circuit_breaker::CircuitBreaker;
use crate::heal::queue::BackfillQueue;
use crate::market_data::tick_store::TickStore;
use crate::metrics::EngineMetrics;
use crate::runtime_config::EngineConfig;
use crate::types::{
    day_start, BackfillItem, Gap, Instrument, InstrumentTier, IntegrityRecord, Resolution,
};

/// Periods of catch-up per resolution per build pass.  Anything further back
/// is the gap scanner's problem.
const BUILD_CATCHUP_PERIODS: i64 = 16;
/// Queue items drained per pass; pacing happens inside the fetcher, this just
/// bounds a single pass.
const DRAIN_BATCH: usize = 4;
/// Gaps younger than this get a priority bump — fresh holes matter most.
const RECENT_GAP: Duration = Duration::hours(1);

pub struct HealingOrchestrator {
    config: EngineConfig,
    catalog: Arc<SymbolCatalog>,
    calendar: MarketCalendar,
    store: Arc<CandleStore>,
    tick_store: Arc<TickStore>,
    builder: Arc<CandleBuilder>,
    detector: GapDetector,
    provider: MergedProvider,
    queue: Arc<BackfillQueue>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<EngineMetrics>,
    integrity: RwLock<Vec<IntegrityRecord>>,
}

impl HealingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        catalog: Arc<SymbolCatalog>,
        store: Arc<CandleStore>,
        tick_store: Arc<TickStore>,
        builder: Arc<CandleBuilder>,
        provider: MergedProvider,
        queue: Arc<BackfillQueue>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let detector = GapDetector::new(store.clone());
        Self {
            config,
            catalog,
            calendar: MarketCalendar::new(),
            store,
            tick_store,
            builder,
            detector,
            provider,
            queue,
            breaker,
            metrics,
            integrity: RwLock::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<BackfillQueue> {
        &self.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    // -------------------------------------------------------------------------
    // Build pass
    // -------------------------------------------------------------------------

    /// Build every closed, not-yet-stored period for every instrument, base
    /// resolution first, then each aggregate from its source.  Periods that
    /// already have a row are skipped — re-folding the same ticks would
    /// double-count through the accumulate policy.
    pub fn build_pass(&self, now: DateTime<Utc>) {
        // Durability cadence: buffered ticks hit the log at least once per
        // build pass, not only at the flush threshold.
        self.tick_store.flush_all();

        for instrument in self.catalog.all() {
            for resolution in Resolution::ALL {
                let mut period = match self.store.latest(&instrument.code, resolution) {
                    Some(last) => resolution.align(last.period_start) + resolution.period(),
                    None => {
                        resolution.align(now)
                            - Duration::seconds(
                                resolution.period_secs() * BUILD_CATCHUP_PERIODS,
                            )
                    }
                };
                let floor = resolution.align(now)
                    - Duration::seconds(resolution.period_secs() * BUILD_CATCHUP_PERIODS);
                if period < floor {
                    period = floor;
                }

                while period + resolution.period() <= now {
                    if self.store.get(&instrument.code, resolution, period).is_none() {
                        if resolution == Resolution::M1 {
                            self.builder.build_base(&instrument.code, period, now);
                        } else {
                            self.builder
                                .build_from_source(&instrument.code, resolution, period, now);
                        }
                    }
                    period += resolution.period();
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Gap scan pass
    // -------------------------------------------------------------------------

    /// Scan every instrument of `tier` for base-resolution gaps and suspect
    /// candles, classify them, and enqueue heal work.  Higher resolutions are
    /// repaired by upward propagation after the base heals.
    pub fn scan_pass(&self, tier: InstrumentTier, now: DateTime<Utc>) {
        let from = now - Duration::days(self.config.lookback_days);
        for instrument in self.catalog.by_tier(tier) {
            let mut gaps =
                self.detector
                    .scan(&instrument.code, Resolution::M1, from, now, now);
            gaps.extend(self.detector.find_suspect(
                &instrument.code,
                Resolution::M1,
                from,
                resolution_floor(now),
            ));

            let found = gaps.len();
            let mut enqueued = 0usize;
            for gap in gaps {
                if let Some(item) = self.classify(instrument, gap, now) {
                    if self.queue.enqueue(item).is_some() {
                        enqueued += 1;
                    }
                }
            }
            if found > 0 {
                self.metrics.gaps_detected(found);
                info!(
                    instrument = %instrument.code,
                    found,
                    enqueued,
                    "gap scan finished"
                );
            }
        }
    }

    /// Turn a detected gap into queue work, or drop it: spans that fall
    /// entirely in a closed session are not gaps, and trailing gaps inside
    /// the vendor publication delay are not fetchable yet.
    fn classify(
        &self,
        instrument: &Instrument,
        gap: Gap,
        now: DateTime<Utc>,
    ) -> Option<BackfillItem> {
        if self.calendar.fully_closed(
            instrument.class,
            gap.from,
            gap.to,
            gap.resolution.period_secs(),
        ) {
            debug!(
                instrument = %instrument.code,
                from = %gap.from,
                to = %gap.to,
                "discarding gap in closed session"
            );
            return None;
        }

        let mut to = gap.to;
        if gap.trailing {
            let publishable = gap
                .resolution
                .align(now - Duration::minutes(self.config.publication_delay_mins));
            to = to.min(publishable);
            if to <= gap.from {
                debug!(
                    instrument = %instrument.code,
                    from = %gap.from,
                    "trailing gap inside publication delay, deferring"
                );
                return None;
            }
        }

        let mut priority: u8 = match instrument.tier {
            InstrumentTier::Primary => 8,
            InstrumentTier::Secondary => 4,
        };
        if gap.age(now) < RECENT_GAP {
            priority += 2;
        }

        Some(BackfillItem::new(
            instrument.code.clone(),
            gap.resolution,
            gap.from,
            to,
            priority,
        ))
    }

    // -------------------------------------------------------------------------
    // Drain pass
    // -------------------------------------------------------------------------

    /// Work the queue: fetch, heal, propagate.  Stops early when the breaker
    /// opens; a rate limit ends the pass, counts toward the breaker
    /// threshold, and the claimed item goes back without spending an
    /// attempt.
    pub async fn drain_pass(&self, now: DateTime<Utc>) -> usize {
        let mut healed = 0usize;

        for _ in 0..DRAIN_BATCH {
            if self.breaker.is_open(now) {
                debug!(
                    cooldown_secs = self.breaker.cooldown_remaining_secs(now),
                    "circuit breaker open, skipping drain"
                );
                break;
            }
            let Some(item) = self.queue.claim_next() else {
                break;
            };
            let Some(instrument) = self.catalog.get(&item.instrument).cloned() else {
                warn!(instrument = %item.instrument, "queue item for unknown instrument");
                self.queue.retry_or_fail(item.id, "unknown instrument", now);
                continue;
            };

            self.metrics.backfill_request();
            match self
                .provider
                .fetch(&instrument, item.resolution, item.from, item.to)
                .await
            {
                Ok(fetch) => {
                    let mut written = 0usize;
                    for candle in fetch.candles {
                        match self.store.save_healed(candle) {
                            SaveOutcome::Inserted | SaveOutcome::Overwritten => {
                                written += 1;
                                self.metrics.candle_healed();
                            }
                            SaveOutcome::RejectedInvalid => self.metrics.candle_invalid(),
                            _ => {}
                        }
                    }
                    self.builder
                        .propagate_up(&item.instrument, item.resolution, item.from, item.to);
                    self.queue.complete(item.id, now);
                    self.breaker.record_success();
                    self.metrics.backfill_success();
                    healed += 1;
                    info!(
                        instrument = %item.instrument,
                        resolution = %item.resolution,
                        from = %item.from,
                        to = %item.to,
                        written,
                        primary = fetch.primary_count,
                        secondary = fetch.secondary_count,
                        "backfill item healed"
                    );
                }
                Err(ProviderError::RateLimited) => {
                    warn!(
                        instrument = %item.instrument,
                        "vendor rate limit during drain, ending pass"
                    );
                    self.metrics.backfill_rate_limited();
                    self.breaker.record_failure(now);
                    self.queue.release(item.id);
                    break;
                }
                Err(e) => {
                    self.metrics.backfill_failure();
                    self.breaker.record_failure(now);
                    let status = self.queue.retry_or_fail(item.id, &e.to_string(), now);
                    warn!(
                        instrument = %item.instrument,
                        error = %e,
                        status = %status,
                        "backfill item failed"
                    );
                }
            }
        }

        healed
    }

    // -------------------------------------------------------------------------
    // Integrity pass
    // -------------------------------------------------------------------------

    /// Recompute the per (instrument, resolution, day) rollup over the
    /// lookback window and enqueue base-resolution repair work for
    /// deficient days.  Idempotent: the table is replaced wholesale, never
    /// edited, and the queue dedupes repeated windows.
    pub fn integrity_pass(&self, now: DateTime<Utc>) -> usize {
        let mut records = Vec::new();
        let first_day = day_start(now - Duration::days(self.config.lookback_days));
        let publishable =
            Resolution::M1.align(now - Duration::minutes(self.config.publication_delay_mins));

        for instrument in self.catalog.all() {
            for resolution in Resolution::ALL {
                let mut day = first_day;
                while day < now {
                    let day_end = (day + Duration::days(1)).min(resolution.align(now));
                    let expected = self.expected_periods(instrument.class, resolution, day, day_end);
                    let stored = self.store.range(&instrument.code, resolution, day, day_end);
                    let incomplete = stored.iter().filter(|c| !c.complete).count();

                    let record = IntegrityRecord {
                        instrument: instrument.code.clone(),
                        resolution,
                        day,
                        expected,
                        actual: stored.len(),
                        incomplete,
                        computed_at: now,
                    };
                    if record.deficit() > 0 {
                        debug!(
                            instrument = %record.instrument,
                            resolution = %record.resolution,
                            day = %record.day,
                            expected = record.expected,
                            actual = record.actual,
                            incomplete = record.incomplete,
                            "integrity deficit"
                        );
                        // Repairs happen at the base resolution and cascade
                        // upward on heal; deficits above base need no work
                        // of their own.
                        if resolution == Resolution::M1 {
                            let repair_to = day_end.min(publishable);
                            if repair_to > day {
                                self.queue.enqueue(BackfillItem::new(
                                    instrument.code.clone(),
                                    Resolution::M1,
                                    day,
                                    repair_to,
                                    3,
                                ));
                            }
                        }
                    }
                    records.push(record);
                    day += Duration::days(1);
                }
            }
        }

        let count = records.len();
        *self.integrity.write() = records;
        count
    }

    /// Open-session period starts in [from, to) at this resolution.
    fn expected_periods(
        &self,
        class: crate::types::InstrumentClass,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> usize {
        let mut expected = 0usize;
        let mut cursor = resolution.align(from);
        while cursor < to {
            if self.calendar.is_open(class, cursor).open {
                expected += 1;
            }
            cursor += resolution.period();
        }
        expected
    }

    pub fn integrity_records(&self) -> Vec<IntegrityRecord> {
        self.integrity.read().clone()
    }

    /// Records with a non-zero deficit, worst first.
    pub fn worst_deficits(&self, limit: usize) -> Vec<IntegrityRecord> {
        let mut deficient: Vec<IntegrityRecord> = self
            .integrity
            .read()
            .iter()
            .filter(|r| r.deficit() > 0)
            .cloned()
            .collect();
        deficient.sort_by_key(|r| std::cmp::Reverse(r.deficit()));
        deficient.truncate(limit);
        deficient
    }

    // -------------------------------------------------------------------------
    // Cleanup pass
    // -------------------------------------------------------------------------

    pub fn cleanup_pass(&self, now: DateTime<Utc>) {
        let tick_cutoff = now - Duration::hours(self.config.tick_retention_hours);
        let ticks = self.tick_store.prune_older_than(tick_cutoff);
        let items = self.queue.prune(now);
        if ticks > 0 || items > 0 {
            info!(ticks, queue_items = items, "retention cleanup");
        }
    }
}

fn resolution_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    Resolution::M1.align(now)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::provider::{HistoricalProvider, PacedFetcher};
    use crate::heal::queue::BackfillQueue;
    use crate::market_data::spike_filter::SpikeFilter;
    use crate::types::{Candle, InstrumentClass, TickSource};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Tuesday 10:00 UTC: every tracked market is open.
    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    /// Scripted vendor: counts calls, optionally always rate limited,
    /// otherwise returns one flat-priced bar per requested period.
    struct ScriptedProvider {
        calls: Arc<AtomicU32>,
        rate_limited: bool,
    }

    #[async_trait]
    impl HistoricalProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(
            &self,
            instrument: &Instrument,
            resolution: Resolution,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<Candle>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rate_limited {
                return Err(ProviderError::RateLimited);
            }
            let mut candles = Vec::new();
            let mut period = resolution.align(from);
            while period < to {
                candles.push(Candle {
                    instrument: instrument.code.clone(),
                    resolution,
                    period_start: period,
                    open: 1.2000,
                    high: 1.2010,
                    low: 1.1990,
                    close: 1.2005,
                    volume: 7.0,
                    spread: None,
                    complete: true,
                    tick_count: 0,
                });
                period += resolution.period();
            }
            Ok(candles)
        }
    }

    struct Fixture {
        orchestrator: HealingOrchestrator,
        tick_store: Arc<TickStore>,
        store: Arc<CandleStore>,
        calls: Arc<AtomicU32>,
    }

    fn fixture(rate_limited: bool) -> Fixture {
        let mut config = EngineConfig::default();
        config.provider_min_interval_ms = 0;
        config.provider_chunk_delay_ms = 0;
        config.provider_retry_backoff_ms = 0;
        config.lookback_days = 1;

        let catalog = Arc::new(SymbolCatalog::new(&config.instruments));
        let metrics = Arc::new(EngineMetrics::new());
        let filter = Arc::new(SpikeFilter::new(&config));
        let tick_store = Arc::new(TickStore::new(&config, filter, metrics.clone()));
        let store = Arc::new(CandleStore::new());
        let builder = Arc::new(CandleBuilder::new(
            store.clone(),
            tick_store.clone(),
            metrics.clone(),
            config.min_coverage_ratio,
        ));

        let calls = Arc::new(AtomicU32::new(0));
        let scripted = Arc::new(ScriptedProvider {
            calls: calls.clone(),
            rate_limited,
        });
        let provider = MergedProvider::new(
            PacedFetcher::new(scripted, &config),
            None,
            config.min_coverage_ratio,
        );

        let queue = Arc::new(BackfillQueue::new(
            config.max_backfill_attempts,
            Duration::hours(config.queue_retention_hours),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            Duration::minutes(config.breaker_cooldown_mins),
        ));

        let orchestrator = HealingOrchestrator::new(
            config,
            catalog,
            store.clone(),
            tick_store.clone(),
            builder,
            provider,
            queue,
            breaker,
            metrics,
        );
        Fixture {
            orchestrator,
            tick_store,
            store,
            calls,
        }
    }

    fn heal_item(minute_from: i64, minute_to: i64, priority: u8) -> BackfillItem {
        BackfillItem::new(
            "EURUSD",
            Resolution::M1,
            t0() + Duration::minutes(minute_from),
            t0() + Duration::minutes(minute_to),
            priority,
        )
    }

    #[tokio::test]
    async fn consecutive_rate_limits_trip_breaker_and_stop_calls() {
        let fx = fixture(true);
        for i in 0..3 {
            fx.orchestrator.queue().enqueue(heal_item(i * 10, i * 10 + 10, 5));
        }

        // First rate limit ends the pass after exactly one vendor call; one
        // failure is below the breaker threshold of two.
        let healed = fx.orchestrator.drain_pass(t0()).await;
        assert_eq!(healed, 0);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert!(!fx.orchestrator.breaker().is_open(t0()));
        // The claimed item went back without spending its attempt.
        assert_eq!(fx.orchestrator.queue().depth().pending, 3);

        // Second consecutive rate limit: one more call, breaker opens.
        let second = t0() + Duration::minutes(1);
        fx.orchestrator.drain_pass(second).await;
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        assert!(fx.orchestrator.breaker().is_open(second));

        // Inside the cooldown: zero further vendor calls.
        let inside = second + Duration::minutes(2);
        fx.orchestrator.drain_pass(inside).await;
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);

        // After the cooldown the drain tries again.
        let after = second + Duration::minutes(6);
        fx.orchestrator.drain_pass(after).await;
        assert_eq!(fx.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn healed_period_is_sealed_against_live_writes() {
        let fx = fixture(false);
        fx.orchestrator.queue().enqueue(heal_item(0, 10, 5));

        let healed = fx.orchestrator.drain_pass(t0() + Duration::minutes(20)).await;
        assert_eq!(healed, 1);
        assert_eq!(fx.store.count("EURUSD", Resolution::M1), 10);

        // A late live build for a healed minute must not accumulate into it.
        let outcome = fx.store.save_live(Candle {
            instrument: "EURUSD".into(),
            resolution: Resolution::M1,
            period_start: t0(),
            open: 9.0,
            high: 9.1,
            low: 8.9,
            close: 9.0,
            volume: 1.0,
            spread: None,
            complete: true,
            tick_count: 1,
        });
        assert_eq!(outcome, SaveOutcome::RejectedClosed);
        let kept = fx.store.get("EURUSD", Resolution::M1, t0()).unwrap();
        assert!((kept.close - 1.2005).abs() < 1e-9);
    }

    #[tokio::test]
    async fn drain_propagates_healing_upward() {
        let fx = fixture(false);
        // One full hour so every aggregate up to H1 is covered.
        fx.orchestrator.queue().enqueue(heal_item(0, 60, 5));
        fx.orchestrator.drain_pass(t0() + Duration::minutes(90)).await;

        assert_eq!(fx.store.count("EURUSD", Resolution::M5), 12);
        assert_eq!(fx.store.count("EURUSD", Resolution::H1), 1);
        let h1 = fx.store.get("EURUSD", Resolution::H1, t0()).unwrap();
        assert!((h1.volume - 7.0 * 60.0).abs() < 1e-9);
        assert!(h1.complete);
    }

    #[test]
    fn build_pass_folds_closed_minutes_once() {
        let fx = fixture(false);
        for s in [5, 20, 40] {
            let out = fx.tick_store.add_tick(
                "EURUSD",
                InstrumentClass::Forex,
                1.1000 + s as f64 * 1e-5,
                1.0,
                t0() + Duration::seconds(s),
                TickSource::Live,
            );
            assert!(out.accepted);
        }

        let now = t0() + Duration::minutes(1) + Duration::seconds(5);
        fx.orchestrator.build_pass(now);
        assert_eq!(fx.store.count("EURUSD", Resolution::M1), 1);
        let first = fx.store.get("EURUSD", Resolution::M1, t0()).unwrap();

        // Running the pass again must not re-fold the same ticks.
        fx.orchestrator.build_pass(now + Duration::seconds(10));
        let second = fx.store.get("EURUSD", Resolution::M1, t0()).unwrap();
        assert_eq!(first.volume.to_bits(), second.volume.to_bits());
        assert_eq!(first.tick_count, second.tick_count);
    }

    #[test]
    fn scan_enqueues_open_session_gaps_only() {
        let fx = fixture(false);
        // Sunday evening with a one-day lookback: the whole window sits in
        // the fx weekend, so an empty EURUSD series is not a gap.
        let weekend = Utc.with_ymd_and_hms(2024, 3, 10, 20, 0, 0).unwrap();
        fx.orchestrator.scan_pass(InstrumentTier::Primary, weekend);
        assert!(!fx
            .orchestrator
            .queue()
            .has_live_item("EURUSD", Resolution::M1));

        // Tuesday mid-session the same empty series is real missing data.
        fx.orchestrator.scan_pass(InstrumentTier::Primary, t0());
        assert!(fx
            .orchestrator
            .queue()
            .has_live_item("EURUSD", Resolution::M1));
    }

    #[test]
    fn trailing_gap_respects_publication_delay() {
        let fx = fixture(false);
        // Candles up to 10:00, scanned at 10:10 — inside the 20 minute
        // publication delay, so nothing is enqueued.
        for m in 0..60 {
            fx.store.save_live(Candle {
                instrument: "EURUSD".into(),
                resolution: Resolution::M1,
                period_start: t0() - Duration::minutes(60 - m),
                open: 1.10,
                high: 1.101,
                low: 1.099,
                close: 1.10,
                volume: 2.0,
                spread: None,
                complete: true,
                tick_count: 3,
            });
        }
        let gap = Gap {
            instrument: "EURUSD".into(),
            resolution: Resolution::M1,
            from: t0(),
            to: t0() + Duration::minutes(10),
            missing: 10,
            trailing: true,
        };
        let instrument = fx.orchestrator.catalog.get("EURUSD").cloned().unwrap();

        let within = fx
            .orchestrator
            .classify(&instrument, gap.clone(), t0() + Duration::minutes(10));
        assert!(within.is_none());

        // Forty minutes later the same window is publishable, clamped to the
        // delay horizon.
        let later = fx
            .orchestrator
            .classify(&instrument, gap, t0() + Duration::minutes(40))
            .unwrap();
        assert_eq!(later.from, t0());
        assert_eq!(later.to, t0() + Duration::minutes(10));
        // Primary instrument with a fresh gap sits at the top of the queue.
        assert_eq!(later.priority, 10);
    }

    #[test]
    fn integrity_pass_counts_deficits() {
        let fx = fixture(false);
        // 30 of the day's first 60 minutes stored, 5 of them incomplete.
        let midnight = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        for m in 0..30 {
            fx.store.save_live(Candle {
                instrument: "EURUSD".into(),
                resolution: Resolution::M1,
                period_start: midnight + Duration::minutes(m),
                open: 1.10,
                high: 1.101,
                low: 1.099,
                close: 1.10,
                volume: 2.0,
                spread: None,
                complete: m >= 5,
                tick_count: 3,
            });
        }

        let now = midnight + Duration::minutes(60);
        let records = fx.orchestrator.integrity_pass(now);
        assert!(records > 0);

        let record = fx
            .orchestrator
            .integrity_records()
            .into_iter()
            .find(|r| {
                r.instrument == "EURUSD" && r.resolution == Resolution::M1 && r.day == midnight
            })
            .unwrap();
        assert_eq!(record.expected, 60);
        assert_eq!(record.actual, 30);
        assert_eq!(record.incomplete, 5);
        assert_eq!(record.deficit(), 35);

        let worst = fx.orchestrator.worst_deficits(5);
        assert!(!worst.is_empty());
        assert!(worst[0].deficit() >= worst[worst.len() - 1].deficit());

        // Deficient days get base-resolution repair work queued.
        assert!(fx
            .orchestrator
            .queue()
            .has_live_item("EURUSD", Resolution::M1));
    }

    #[test]
    fn cleanup_drops_expired_ticks() {
        let fx = fixture(false);
        let old = t0() - Duration::hours(72);
        let fresh = t0() - Duration::minutes(5);
        for ts in [old, fresh] {
            fx.tick_store.add_tick(
                "EURUSD",
                InstrumentClass::Forex,
                1.10,
                1.0,
                ts,
                TickSource::Live,
            );
        }
        fx.tick_store.flush_all();

        fx.orchestrator.cleanup_pass(t0());
        assert_eq!(
            fx.tick_store.ticks_for_minute("EURUSD", Resolution::M1.align(old)).len(),
            0
        );
        assert_eq!(
            fx.tick_store
                .ticks_for_minute("EURUSD", Resolution::M1.align(fresh))
                .len(),
            1
        );
    }
}
