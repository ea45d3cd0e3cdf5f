// =============================================================================
// Central Engine State — Candela
// =============================================================================
//
// The single composition root for the engine.  Every subsystem manages its
// own interior mutability; EngineState ties them together and provides a
// unified snapshot for the status log.
//
// Thread safety:
//   - Atomic counters inside EngineMetrics.
//   - parking_lot::RwLock for all mutable shared collections.
//   - Arc wrappers for subsystems shared across async tasks.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::candles::{CandleBuilder, CandleStore};
use crate::catalog::SymbolCatalog;
use crate::heal::circuit_breaker::CircuitBreaker;
use crate::heal::queue::{BackfillQueue, QueueDepth};
use crate::market_data::spike_filter::SpikeFilter;
use crate::market_data::tick_store::TickStore;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::runtime_config::EngineConfig;
use crate::types::Resolution;

/// Central engine state shared across all async tasks via `Arc<EngineState>`.
pub struct EngineState {
    pub config: Arc<RwLock<EngineConfig>>,
    pub catalog: Arc<SymbolCatalog>,

    // ── Ingestion ───────────────────────────────────────────────────────
    pub spike_filter: Arc<SpikeFilter>,
    pub tick_store: Arc<TickStore>,

    // ── Candles ─────────────────────────────────────────────────────────
    pub candle_store: Arc<CandleStore>,
    pub builder: Arc<CandleBuilder>,

    // ── Healing ─────────────────────────────────────────────────────────
    pub queue: Arc<BackfillQueue>,
    pub breaker: Arc<CircuitBreaker>,

    pub metrics: Arc<EngineMetrics>,
}

/// Point-in-time engine status for the periodic log line.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub instruments: usize,
    pub queue: QueueDepthSnapshot,
    pub breaker_open: bool,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepthSnapshot {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl From<QueueDepth> for QueueDepthSnapshot {
    fn from(d: QueueDepth) -> Self {
        Self {
            pending: d.pending,
            processing: d.processing,
            completed: d.completed,
            failed: d.failed,
        }
    }
}

impl EngineState {
    pub fn new(config: EngineConfig) -> Self {
        let catalog = Arc::new(SymbolCatalog::new(&config.instruments));
        let metrics = Arc::new(EngineMetrics::new());
        let spike_filter = Arc::new(SpikeFilter::new(&config));
        let tick_store = Arc::new(TickStore::new(
            &config,
            spike_filter.clone(),
            metrics.clone(),
        ));
        let candle_store = Arc::new(CandleStore::new());
        let builder = Arc::new(CandleBuilder::new(
            candle_store.clone(),
            tick_store.clone(),
            metrics.clone(),
            config.min_coverage_ratio,
        ));
        let queue = Arc::new(BackfillQueue::new(
            config.max_backfill_attempts,
            Duration::hours(config.queue_retention_hours),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            Duration::minutes(config.breaker_cooldown_mins),
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            catalog,
            spike_filter,
            tick_store,
            candle_store,
            builder,
            queue,
            breaker,
            metrics,
        }
    }

    /// Warm every spike filter from the most recent persisted closes so a
    /// restart does not re-open the "first price accepted blind" window.
    pub fn seed_spike_filters(&self) {
        let history_len = self.config.read().spike_history_len;
        let mut seeded = 0usize;
        for instrument in self.catalog.all() {
            let closes = self.candle_store.recent_closes(&instrument.code, history_len);
            if closes.is_empty() {
                continue;
            }
            self.spike_filter.seed(&instrument.code, &closes);
            seeded += 1;
        }
        if seeded > 0 {
            info!(instruments = seeded, "spike filters seeded from stored closes");
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            instruments: self.catalog.len(),
            queue: self.queue.depth().into(),
            breaker_open: self.breaker.is_open(Utc::now()),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Total stored candles across all instruments and resolutions.
    pub fn stored_candles(&self) -> usize {
        self.catalog
            .all()
            .map(|i| {
                Resolution::ALL
                    .iter()
                    .map(|r| self.candle_store.count(&i.code, *r))
                    .sum::<usize>()
            })
            .sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candle, InstrumentClass, TickSource};
    use chrono::{DateTime, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    #[test]
    fn state_wires_the_default_universe() {
        let state = EngineState::new(EngineConfig::default());
        assert_eq!(state.catalog.len(), 5);
        assert!(state.catalog.get("EURUSD").is_some());

        let snap = state.snapshot();
        assert_eq!(snap.instruments, 5);
        assert!(!snap.breaker_open);
        assert_eq!(snap.queue.pending, 0);
    }

    #[test]
    fn seeding_restores_spike_protection_across_restart() {
        let state = EngineState::new(EngineConfig::default());
        for m in 0..10 {
            state.candle_store.save_live(Candle {
                instrument: "EURUSD".into(),
                resolution: Resolution::M1,
                period_start: t0() + chrono::Duration::minutes(m),
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
        state.seed_spike_filters();

        // With a seeded baseline the first live tick after restart is subject
        // to the spike rule instead of being accepted blind.
        let out = state.tick_store.add_tick(
            "EURUSD",
            InstrumentClass::Forex,
            1.35,
            1.0,
            t0() + chrono::Duration::minutes(10),
            TickSource::Live,
        );
        assert!(!out.accepted);
    }
}
