// =============================================================================
// Runtime Configuration — engine tunables with atomic save
// =============================================================================
//
// Central configuration hub for the Candela candle engine.  Spike thresholds,
// coverage ratios, provider pacing, and retention windows are operational
// tunables, not invariants, so every one of them lives here.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{Instrument, InstrumentClass, InstrumentTier};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_instruments() -> Vec<Instrument> {
    vec![
        Instrument {
            code: "EURUSD".into(),
            vendor_symbol: "EUR/USD".into(),
            class: InstrumentClass::Forex,
            tier: InstrumentTier::Primary,
        },
        Instrument {
            code: "GBPUSD".into(),
            vendor_symbol: "GBP/USD".into(),
            class: InstrumentClass::Forex,
            tier: InstrumentTier::Primary,
        },
        Instrument {
            code: "XAUUSD".into(),
            vendor_symbol: "XAU/USD".into(),
            class: InstrumentClass::Metal,
            tier: InstrumentTier::Primary,
        },
        Instrument {
            code: "BTCUSD".into(),
            vendor_symbol: "BTC/USD".into(),
            class: InstrumentClass::Crypto,
            tier: InstrumentTier::Secondary,
        },
        Instrument {
            code: "AAPL".into(),
            vendor_symbol: "AAPL".into(),
            class: InstrumentClass::Equity,
            tier: InstrumentTier::Secondary,
        },
    ]
}

fn default_spike_threshold_forex() -> f64 {
    0.5
}

fn default_spike_threshold_metal() -> f64 {
    1.0
}

fn default_spike_threshold_crypto() -> f64 {
    3.0
}

fn default_spike_threshold_equity() -> f64 {
    2.0
}

fn default_spike_history_len() -> usize {
    30
}

fn default_stale_price_secs() -> i64 {
    300
}

fn default_tick_buffer_cap() -> usize {
    2_000
}

fn default_tick_flush_threshold() -> usize {
    100
}

fn default_tick_retention_hours() -> i64 {
    48
}

fn default_coverage_ratio() -> f64 {
    0.8
}

fn default_provider_min_interval_ms() -> u64 {
    2_500
}

fn default_provider_chunk_delay_ms() -> u64 {
    500
}

fn default_provider_retries() -> u32 {
    3
}

fn default_provider_retry_backoff_ms() -> u64 {
    1_000
}

fn default_provider_timeout_secs() -> u64 {
    15
}

fn default_publication_delay_mins() -> i64 {
    20
}

fn default_breaker_threshold() -> u32 {
    2
}

fn default_breaker_cooldown_mins() -> i64 {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_primary_heal_mins() -> u64 {
    5
}

fn default_secondary_heal_mins() -> u64 {
    30
}

fn default_lookback_days() -> i64 {
    7
}

fn default_queue_retention_hours() -> i64 {
    24
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration for the Candela engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Universe ------------------------------------------------------------

    /// Instruments the engine tracks and heals.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<Instrument>,

    // --- Spike filter --------------------------------------------------------

    /// Base spike thresholds as absolute percentage change, per class.
    #[serde(default = "default_spike_threshold_forex")]
    pub spike_threshold_forex_pct: f64,
    #[serde(default = "default_spike_threshold_metal")]
    pub spike_threshold_metal_pct: f64,
    #[serde(default = "default_spike_threshold_crypto")]
    pub spike_threshold_crypto_pct: f64,
    #[serde(default = "default_spike_threshold_equity")]
    pub spike_threshold_equity_pct: f64,

    /// Rolling price-history window used for volatility widening.
    #[serde(default = "default_spike_history_len")]
    pub spike_history_len: usize,

    /// A last-accepted price older than this is considered stale; the
    /// threshold is doubled since a genuine move over the interval is
    /// plausible.
    #[serde(default = "default_stale_price_secs")]
    pub stale_price_secs: i64,

    // --- Tick store ----------------------------------------------------------

    /// Max buffered ticks per instrument before oldest are dropped.
    #[serde(default = "default_tick_buffer_cap")]
    pub tick_buffer_cap: usize,

    /// Buffered tick count that triggers a durable flush.
    #[serde(default = "default_tick_flush_threshold")]
    pub tick_flush_threshold: usize,

    /// Flushed ticks older than this are pruned by the daily cleanup.
    #[serde(default = "default_tick_retention_hours")]
    pub tick_retention_hours: i64,

    // --- Candle building -----------------------------------------------------

    /// Minimum source-candle coverage for an aggregated candle to count as
    /// complete; below this it is still saved but marked incomplete.
    #[serde(default = "default_coverage_ratio")]
    pub min_coverage_ratio: f64,

    // --- Backfill provider ---------------------------------------------------

    /// Minimum interval between requests to one vendor (pacing, not drops).
    #[serde(default = "default_provider_min_interval_ms")]
    pub provider_min_interval_ms: u64,

    /// Fixed delay between consecutive chunks of a split range.
    #[serde(default = "default_provider_chunk_delay_ms")]
    pub provider_chunk_delay_ms: u64,

    /// Bounded retry count for transient network errors.
    #[serde(default = "default_provider_retries")]
    pub provider_retries: u32,

    /// Fixed backoff between transient-error retries.
    #[serde(default = "default_provider_retry_backoff_ms")]
    pub provider_retry_backoff_ms: u64,

    /// Hard timeout on every provider request.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Typical delay before the historical provider has recent data.
    /// Trailing gaps younger than this are not queued.
    #[serde(default = "default_publication_delay_mins")]
    pub publication_delay_mins: i64,

    // --- Healing orchestrator ------------------------------------------------

    /// Consecutive healing failures that trip the circuit breaker.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// Cooldown window after the breaker trips.
    #[serde(default = "default_breaker_cooldown_mins")]
    pub breaker_cooldown_mins: i64,

    /// Attempt budget per backfill item before it becomes Failed.
    #[serde(default = "default_max_attempts")]
    pub max_backfill_attempts: u32,

    /// Gap-scan period for primary-tier instruments.
    #[serde(default = "default_primary_heal_mins")]
    pub primary_heal_mins: u64,

    /// Gap-scan period for secondary-tier instruments.
    #[serde(default = "default_secondary_heal_mins")]
    pub secondary_heal_mins: u64,

    /// Full integrity sweep lookback window.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    /// Completed queue items older than this are pruned.
    #[serde(default = "default_queue_retention_hours")]
    pub queue_retention_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instruments: default_instruments(),
            spike_threshold_forex_pct: default_spike_threshold_forex(),
            spike_threshold_metal_pct: default_spike_threshold_metal(),
            spike_threshold_crypto_pct: default_spike_threshold_crypto(),
            spike_threshold_equity_pct: default_spike_threshold_equity(),
            spike_history_len: default_spike_history_len(),
            stale_price_secs: default_stale_price_secs(),
            tick_buffer_cap: default_tick_buffer_cap(),
            tick_flush_threshold: default_tick_flush_threshold(),
            tick_retention_hours: default_tick_retention_hours(),
            min_coverage_ratio: default_coverage_ratio(),
            provider_min_interval_ms: default_provider_min_interval_ms(),
            provider_chunk_delay_ms: default_provider_chunk_delay_ms(),
            provider_retries: default_provider_retries(),
            provider_retry_backoff_ms: default_provider_retry_backoff_ms(),
            provider_timeout_secs: default_provider_timeout_secs(),
            publication_delay_mins: default_publication_delay_mins(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_mins: default_breaker_cooldown_mins(),
            max_backfill_attempts: default_max_attempts(),
            primary_heal_mins: default_primary_heal_mins(),
            secondary_heal_mins: default_secondary_heal_mins(),
            lookback_days: default_lookback_days(),
            queue_retention_hours: default_queue_retention_hours(),
        }
    }
}

impl EngineConfig {
    /// Base spike threshold (absolute % change) for an instrument class.
    pub fn spike_threshold_pct(&self, class: InstrumentClass) -> f64 {
        match class {
            InstrumentClass::Forex => self.spike_threshold_forex_pct,
            InstrumentClass::Metal => self.spike_threshold_metal_pct,
            InstrumentClass::Crypto => self.spike_threshold_crypto_pct,
            InstrumentClass::Equity => self.spike_threshold_equity_pct,
        }
    }

    /// Restrict the instrument universe to a comma-separated code list,
    /// e.g. `EURUSD,BTCUSD`.  Codes are case-insensitive; unknown codes are
    /// reported and skipped, and an override that matches nothing leaves
    /// the universe unchanged.
    pub fn apply_symbol_override(&mut self, raw: &str) {
        let wanted: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if wanted.is_empty() {
            return;
        }
        for code in &wanted {
            if !self.instruments.iter().any(|i| &i.code == code) {
                warn!(code = %code, "symbol override names an unconfigured instrument");
            }
        }
        let selected: Vec<Instrument> = self
            .instruments
            .iter()
            .filter(|i| wanted.contains(&i.code))
            .cloned()
            .collect();
        if selected.is_empty() {
            warn!(symbols = %raw, "symbol override matches nothing, keeping configured universe");
            return;
        }
        self.instruments = selected;
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = config.instruments.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
