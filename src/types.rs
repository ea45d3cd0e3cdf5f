// =============================================================================
// Shared types used across the Candela candle engine
// =============================================================================

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Asset class of a tradable instrument. Drives spike thresholds and
/// market-calendar rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentClass {
    Forex,
    Metal,
    Crypto,
    Equity,
}

impl std::fmt::Display for InstrumentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forex => write!(f, "Forex"),
            Self::Metal => write!(f, "Metal"),
            Self::Crypto => write!(f, "Crypto"),
            Self::Equity => write!(f, "Equity"),
        }
    }
}

/// Healing priority tier. Primary instruments are scanned and healed on a
/// short period, secondary on a longer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentTier {
    Primary,
    Secondary,
}

impl Default for InstrumentTier {
    fn default() -> Self {
        Self::Secondary
    }
}

/// A tracked instrument: internal code plus vendor-facing symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    /// Internal code, e.g. "EURUSD".
    pub code: String,
    /// Symbol as the live feed / vendors know it, e.g. "EUR/USD".
    pub vendor_symbol: String,
    pub class: InstrumentClass,
    #[serde(default)]
    pub tier: InstrumentTier,
}

// ---------------------------------------------------------------------------
// Resolutions
// ---------------------------------------------------------------------------

/// Candle period length. Aggregation is strictly bottom-up along the chain
/// M1 → M5 → M15 → M30 → H1 → H4 → D1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Resolution {
    /// All resolutions in ascending (build) order.
    pub const ALL: [Resolution; 7] = [
        Resolution::M1,
        Resolution::M5,
        Resolution::M15,
        Resolution::M30,
        Resolution::H1,
        Resolution::H4,
        Resolution::D1,
    ];

    pub fn period_secs(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }

    pub fn period(self) -> Duration {
        Duration::seconds(self.period_secs())
    }

    /// The immediate lower resolution this one aggregates from. `None` for
    /// the base resolution, which is built from ticks.
    pub fn source(self) -> Option<Resolution> {
        match self {
            Self::M1 => None,
            Self::M5 => Some(Self::M1),
            Self::M15 => Some(Self::M5),
            Self::M30 => Some(Self::M15),
            Self::H1 => Some(Self::M30),
            Self::H4 => Some(Self::H1),
            Self::D1 => Some(Self::H4),
        }
    }

    /// The resolution directly above this one in the aggregation chain.
    pub fn next_up(self) -> Option<Resolution> {
        match self {
            Self::M1 => Some(Self::M5),
            Self::M5 => Some(Self::M15),
            Self::M15 => Some(Self::M30),
            Self::M30 => Some(Self::H1),
            Self::H1 => Some(Self::H4),
            Self::H4 => Some(Self::D1),
            Self::D1 => None,
        }
    }

    /// How many source candles a fully-covered period contains.
    pub fn expected_source_count(self) -> usize {
        match self.source() {
            Some(src) => (self.period_secs() / src.period_secs()) as usize,
            None => 0,
        }
    }

    /// Floor `ts` to the start of the period containing it.
    pub fn align(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let aligned = secs - secs.rem_euclid(self.period_secs());
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ---------------------------------------------------------------------------
// Ticks
// ---------------------------------------------------------------------------

/// Where a tick came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickSource {
    Live,
    Backfill,
    Synthetic,
}

/// One observed price from the feed. Ticks are append-only and retained only
/// for a bounded recent window; they exist to build the base candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub source: TickSource,
    /// True when the tick was accepted without any prior price history to
    /// evaluate it against (cannot rule out a spike).
    #[serde(default)]
    pub flagged: bool,
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// One OHLCV bar, keyed by (instrument, resolution, period_start).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub resolution: Resolution,
    pub period_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
    /// False when built from fewer ticks / source candles than the
    /// completeness rule requires — flagged for gap-detector follow-up.
    pub complete: bool,
    /// Number of ticks (base resolution) or source candles (aggregated)
    /// that contributed.
    #[serde(default)]
    pub tick_count: u32,
}

impl Candle {
    /// Structural validity: prices strictly positive, volume non-negative,
    /// and `low <= {open, close} <= high`. A candle failing this is never
    /// written to the store.
    pub fn is_valid(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return false;
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return false;
        }
        self.low <= self.open.min(self.close) && self.open.max(self.close) <= self.high
    }

    /// `open == high == low == close` is a diagnostic signal of an
    /// incomplete candle, not a valid market state.
    pub fn is_flat(&self) -> bool {
        self.open == self.high && self.high == self.low && self.low == self.close
    }

    pub fn period_end(&self) -> DateTime<Utc> {
        self.period_start + self.resolution.period()
    }
}

// ---------------------------------------------------------------------------
// Gaps
// ---------------------------------------------------------------------------

/// A detected discontinuity in a stored series. Ephemeral: produced by the
/// gap detector, consumed by the healing orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gap {
    pub instrument: String,
    pub resolution: Resolution,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub missing: usize,
    /// Whether this is a trailing gap between the last stored candle and
    /// "now" (subject to the provider publication delay).
    pub trailing: bool,
}

impl Gap {
    /// Time since the end of the gap.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.to
    }
}

// ---------------------------------------------------------------------------
// Backfill queue items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackfillStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Processing => write!(f, "Processing"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// One unit of healing work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillItem {
    pub id: Uuid,
    pub instrument: String,
    pub resolution: Resolution,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// 0 (lowest) to 10 (highest).
    pub priority: u8,
    pub status: BackfillStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackfillItem {
    pub fn new(
        instrument: impl Into<String>,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        priority: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.into(),
            resolution,
            from,
            to,
            priority: priority.min(10),
            status: BackfillStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Integrity records
// ---------------------------------------------------------------------------

/// Per (instrument, resolution, day) rollup of expected vs. actual vs.
/// incomplete candle counts. Recomputed idempotently, never hand-edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub instrument: String,
    pub resolution: Resolution,
    /// Day start (UTC midnight).
    pub day: DateTime<Utc>,
    pub expected: usize,
    pub actual: usize,
    pub incomplete: usize,
    pub computed_at: DateTime<Utc>,
}

impl IntegrityRecord {
    pub fn deficit(&self) -> usize {
        self.expected.saturating_sub(self.actual) + self.incomplete
    }
}

/// Truncate a timestamp to UTC midnight.
pub fn day_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}
