// =============================================================================
// Historical Providers — vendor REST clients behind one trait
// =============================================================================
//
// `HistoricalProvider` is the seam between healing and the outside world:
// everything above it deals in instruments, resolutions and candle vectors,
// never in vendor URLs.  Errors are classified at this boundary so the caller
// can decide between retry (Transient), escalation (RateLimited) and giving
// up (Fatal).
//
// `PacedFetcher` wraps any provider with the pacing discipline vendors
// require: a minimum spacing between requests, range chunking with inter-chunk
// delays, and a bounded retry loop for transient failures.  Rate limits are
// never retried here — they escalate so the circuit breaker can act.
// =============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::runtime_config::EngineConfig;
use crate::types::{Candle, Instrument, Resolution};

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The vendor throttled us.  Never retried locally; escalates to the
    /// circuit breaker.
    RateLimited,
    /// Network hiccup, timeout, 5xx.  Worth a bounded retry.
    Transient(String),
    /// Bad request, auth failure, unparseable body.  Retrying cannot help.
    Fatal(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RateLimited => write!(f, "provider rate limited"),
            ProviderError::Transient(msg) => write!(f, "transient provider error: {msg}"),
            ProviderError::Fatal(msg) => write!(f, "fatal provider error: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HistoricalProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch candles for `[from, to)` at the given resolution, ascending by
    /// period start.
    async fn fetch(
        &self,
        instrument: &Instrument,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ProviderError>;
}

// ---------------------------------------------------------------------------
// REST vendor client
// ---------------------------------------------------------------------------

pub struct RestProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl RestProvider {
    pub fn new(name: &str, base_url: &str, api_key: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        }
    }

    fn resolution_param(resolution: Resolution) -> &'static str {
        match resolution {
            Resolution::M1 => "1min",
            Resolution::M5 => "5min",
            Resolution::M15 => "15min",
            Resolution::M30 => "30min",
            Resolution::H1 => "1h",
            Resolution::H4 => "4h",
            Resolution::D1 => "1day",
        }
    }

    fn parse_bars(
        &self,
        instrument: &Instrument,
        resolution: Resolution,
        body: &serde_json::Value,
    ) -> Result<Vec<Candle>, ProviderError> {
        let rows = body["values"]
            .as_array()
            .or_else(|| body.as_array())
            .ok_or_else(|| ProviderError::Fatal("response has no bar array".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let ts_ms = row["timestampMs"]
                .as_i64()
                .or_else(|| row["t"].as_i64())
                .ok_or_else(|| ProviderError::Fatal("bar missing timestamp".into()))?;
            let period_start = Utc
                .timestamp_millis_opt(ts_ms)
                .single()
                .ok_or_else(|| ProviderError::Fatal("bar timestamp out of range".into()))?;

            let candle = Candle {
                instrument: instrument.code.clone(),
                resolution,
                period_start: resolution.align(period_start),
                open: parse_num(&row["open"], &row["o"])?,
                high: parse_num(&row["high"], &row["h"])?,
                low: parse_num(&row["low"], &row["l"])?,
                close: parse_num(&row["close"], &row["c"])?,
                volume: parse_num(&row["volume"], &row["v"]).unwrap_or(0.0),
                spread: None,
                complete: true,
                tick_count: 0,
            };
            if candle.is_valid() {
                candles.push(candle);
            } else {
                warn!(
                    instrument = %instrument.code,
                    period = %candle.period_start,
                    "discarding malformed vendor bar"
                );
            }
        }
        candles.sort_by_key(|c| c.period_start);
        Ok(candles)
    }
}

/// Vendors emit prices as either JSON numbers or strings; accept both under
/// either the long or short field name.
fn parse_num(long: &serde_json::Value, short: &serde_json::Value) -> Result<f64, ProviderError> {
    for v in [long, short] {
        if let Some(n) = v.as_f64() {
            return Ok(n);
        }
        if let Some(s) = v.as_str() {
            return s
                .parse::<f64>()
                .map_err(|_| ProviderError::Fatal(format!("non-numeric bar field: {s}")));
        }
    }
    Err(ProviderError::Fatal("bar missing price field".into()))
}

#[async_trait]
impl HistoricalProvider for RestProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        instrument: &Instrument,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ProviderError> {
        let url = format!("{}/candles", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", instrument.vendor_symbol.as_str()),
                ("interval", Self::resolution_param(resolution)),
                ("from", &from.timestamp_millis().to_string()),
                ("to", &to.timestamp_millis().to_string()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ProviderError::Transient(e.to_string())
                } else {
                    ProviderError::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("vendor returned {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Fatal(format!("vendor returned {status}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(format!("failed to decode body: {e}")))?;

        // Some vendors hide throttling inside a 200 body.
        if body["status"].as_str() == Some("rate_limited") {
            return Err(ProviderError::RateLimited);
        }

        self.parse_bars(instrument, resolution, &body)
    }
}

// ---------------------------------------------------------------------------
// Pacing wrapper
// ---------------------------------------------------------------------------

/// Bars per vendor request, by resolution.
fn max_bars_per_request(resolution: Resolution) -> i64 {
    match resolution {
        Resolution::M1 | Resolution::M5 => 500,
        Resolution::M15 | Resolution::M30 => 500,
        Resolution::H1 | Resolution::H4 => 300,
        Resolution::D1 => 365,
    }
}

pub struct PacedFetcher {
    provider: Arc<dyn HistoricalProvider>,
    min_interval: StdDuration,
    chunk_delay: StdDuration,
    retries: u32,
    retry_backoff: StdDuration,
    last_request: Mutex<Option<Instant>>,
}

impl PacedFetcher {
    pub fn new(provider: Arc<dyn HistoricalProvider>, config: &EngineConfig) -> Self {
        Self {
            provider,
            min_interval: StdDuration::from_millis(config.provider_min_interval_ms),
            chunk_delay: StdDuration::from_millis(config.provider_chunk_delay_ms),
            retries: config.provider_retries,
            retry_backoff: StdDuration::from_millis(config.provider_retry_backoff_ms),
            last_request: Mutex::new(None),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Wait out the remainder of the minimum inter-request interval.  Requests
    /// are paced, never dropped.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn fetch_chunk(
        &self,
        instrument: &Instrument,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            self.pace().await;
            match self.provider.fetch(instrument, resolution, from, to).await {
                Ok(candles) => return Ok(candles),
                Err(ProviderError::Transient(msg)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        provider = self.provider.name(),
                        instrument = %instrument.code,
                        attempt,
                        error = %msg,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch `[from, to)`, splitting the range into vendor-sized chunks with
    /// a pause between chunks.
    pub async fn fetch_range(
        &self,
        instrument: &Instrument,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ProviderError> {
        let chunk_span = Duration::seconds(resolution.period_secs() * max_bars_per_request(resolution));
        let mut candles = Vec::new();
        let mut cursor = from;

        while cursor < to {
            let chunk_end = (cursor + chunk_span).min(to);
            debug!(
                provider = self.provider.name(),
                instrument = %instrument.code,
                resolution = %resolution,
                from = %cursor,
                to = %chunk_end,
                "fetching chunk"
            );
            let mut chunk = self.fetch_chunk(instrument, resolution, cursor, chunk_end).await?;
            candles.append(&mut chunk);
            cursor = chunk_end;
            if cursor < to {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        Ok(candles)
    }
}
