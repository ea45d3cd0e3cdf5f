// =============================================================================
// Engine Metrics — lock-free observability counters
// =============================================================================
//
// Atomic counters that any task may bump without locking.  The status log
// reads `snapshot()`; nothing in the engine reads these for control flow.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe engine counters backed by atomics.
#[derive(Default)]
pub struct EngineMetrics {
    ticks_received: AtomicU64,
    ticks_accepted: AtomicU64,
    ticks_rejected: AtomicU64,
    spike_rejections: AtomicU64,
    candles_built: AtomicU64,
    candles_healed: AtomicU64,
    candles_incomplete: AtomicU64,
    candles_invalid: AtomicU64,
    gaps_detected: AtomicU64,
    backfill_requests: AtomicU64,
    backfill_successes: AtomicU64,
    backfill_failures: AtomicU64,
    backfill_rate_limited: AtomicU64,
}

/// Immutable snapshot of the current counters (suitable for serialisation
/// into a health payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ticks_received: u64,
    pub ticks_accepted: u64,
    pub ticks_rejected: u64,
    pub spike_rejections: u64,
    pub candles_built: u64,
    pub candles_healed: u64,
    pub candles_incomplete: u64,
    pub candles_invalid: u64,
    pub gaps_detected: u64,
    pub backfill_requests: u64,
    pub backfill_successes: u64,
    pub backfill_failures: u64,
    pub backfill_rate_limited: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick_received(&self) {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_accepted(&self) {
        self.ticks_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_rejected(&self) {
        self.ticks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spike_rejection(&self) {
        self.spike_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candle_built(&self) {
        self.candles_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candle_healed(&self) {
        self.candles_healed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candle_incomplete(&self) {
        self.candles_incomplete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candle_invalid(&self) {
        self.candles_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gaps_detected(&self, n: usize) {
        self.gaps_detected.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn backfill_request(&self) {
        self.backfill_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backfill_success(&self) {
        self.backfill_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backfill_failure(&self) {
        self.backfill_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backfill_rate_limited(&self) {
        self.backfill_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Produce a serialisable snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            ticks_accepted: self.ticks_accepted.load(Ordering::Relaxed),
            ticks_rejected: self.ticks_rejected.load(Ordering::Relaxed),
            spike_rejections: self.spike_rejections.load(Ordering::Relaxed),
            candles_built: self.candles_built.load(Ordering::Relaxed),
            candles_healed: self.candles_healed.load(Ordering::Relaxed),
            candles_incomplete: self.candles_incomplete.load(Ordering::Relaxed),
            candles_invalid: self.candles_invalid.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            backfill_requests: self.backfill_requests.load(Ordering::Relaxed),
            backfill_successes: self.backfill_successes.load(Ordering::Relaxed),
            backfill_failures: self.backfill_failures.load(Ordering::Relaxed),
            backfill_rate_limited: self.backfill_rate_limited.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("EngineMetrics")
            .field("ticks_received", &snap.ticks_received)
            .field("ticks_accepted", &snap.ticks_accepted)
            .field("candles_built", &snap.candles_built)
            .field("candles_healed", &snap.candles_healed)
            .field("backfill_requests", &snap.backfill_requests)
            .finish()
    }
}
