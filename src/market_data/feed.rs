// =============================================================================
// Live Price Feed — WebSocket tick ingestion
// =============================================================================
//
// Subscribes to the vendor's push stream for every tracked instrument and
// feeds accepted ticks into the tick store.  Inbound envelopes are normalised
// once at the boundary into a single tagged message type (the vendor aliases
// `action` and `type` on the same wire); unrecognised variants are rejected
// explicitly, unknown symbols are ignored.
//
// `run_feed_supervisor` owns reconnection: exponential backoff with a capped
// delay and capped consecutive attempts, full re-subscribe on reconnect.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::catalog::SymbolCatalog;
use crate::market_data::tick_store::TickStore;
use crate::types::TickSource;

/// Initial reconnect delay.
const BACKOFF_BASE_SECS: u64 = 1;
/// Reconnect delay ceiling.
const BACKOFF_CAP_SECS: u64 = 60;
/// Consecutive failed connects before the supervisor gives up for this
/// process lifetime (the gap detector and backfill still heal the series).
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

// ---------------------------------------------------------------------------
// Inbound message normalisation
// ---------------------------------------------------------------------------

/// One normalised inbound feed message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Price {
        vendor_symbol: String,
        price: f64,
        timestamp: DateTime<Utc>,
        volume: f64,
    },
    Heartbeat,
    SubscribeAck,
}

/// Parse and normalise one wire message.  The vendor emits the discriminator
/// under either `action` or `type`; both are accepted here and nowhere else.
pub fn parse_feed_message(text: &str) -> Result<FeedMessage> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    let kind = root["action"]
        .as_str()
        .or_else(|| root["type"].as_str())
        .context("feed message missing action/type discriminator")?;

    match kind {
        "price" | "quote" => {
            let vendor_symbol = root["instrumentSymbol"]
                .as_str()
                .or_else(|| root["symbol"].as_str())
                .context("price message missing symbol")?
                .to_string();

            let price = root["price"]
                .as_f64()
                .context("price message missing numeric price")?;

            let ts_ms = root["timestampMs"]
                .as_i64()
                .or_else(|| root["timestamp"].as_i64())
                .context("price message missing timestamp")?;
            let timestamp = Utc
                .timestamp_millis_opt(ts_ms)
                .single()
                .context("price message timestamp out of range")?;

            let volume = root["volume"].as_f64().unwrap_or(0.0);

            Ok(FeedMessage::Price {
                vendor_symbol,
                price,
                timestamp,
                volume,
            })
        }
        "heartbeat" | "ping" => Ok(FeedMessage::Heartbeat),
        "subscribed" => Ok(FeedMessage::SubscribeAck),
        other => anyhow::bail!("unrecognised feed message kind: {other}"),
    }
}

/// Subscription request for one vendor symbol.
fn subscribe_payload(vendor_symbols: &[String]) -> String {
    serde_json::json!({
        "action": "subscribe",
        "symbols": vendor_symbols,
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Stream loop
// ---------------------------------------------------------------------------

/// Connect, subscribe all instruments, and pump ticks into the store until
/// the stream ends or errors.  The supervisor handles reconnection.
pub async fn run_price_feed(
    url: &str,
    catalog: &SymbolCatalog,
    tick_store: &Arc<TickStore>,
) -> Result<()> {
    info!(url, "connecting to price feed");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to price feed")?;

    let (mut write, mut read) = ws_stream.split();

    let vendor_symbols: Vec<String> = catalog
        .all()
        .map(|i| i.vendor_symbol.clone())
        .collect();
    write
        .send(Message::Text(subscribe_payload(&vendor_symbols)))
        .await
        .context("failed to send subscribe request")?;

    info!(instruments = vendor_symbols.len(), "price feed connected and subscribed");

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_feed_message(&text) {
                Ok(FeedMessage::Price {
                    vendor_symbol,
                    price,
                    timestamp,
                    volume,
                }) => {
                    let Some(instrument) = catalog.from_vendor(&vendor_symbol) else {
                        debug!(symbol = %vendor_symbol, "ignoring unknown feed symbol");
                        continue;
                    };
                    let outcome = tick_store.add_tick(
                        &instrument.code,
                        instrument.class,
                        price,
                        volume,
                        timestamp,
                        TickSource::Live,
                    );
                    if !outcome.accepted {
                        debug!(
                            instrument = %instrument.code,
                            price,
                            reason = outcome.reason.as_deref().unwrap_or(""),
                            "tick rejected"
                        );
                    }
                }
                Ok(FeedMessage::Heartbeat | FeedMessage::SubscribeAck) => {}
                Err(e) => warn!(error = %e, "failed to parse feed message"),
            },
            Some(Ok(_)) => {
                // Ping/pong/binary frames handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(error = %e, "price feed read error");
                return Err(e.into());
            }
            None => {
                warn!("price feed stream ended");
                return Ok(());
            }
        }
    }
}

/// Reconnect loop with exponential backoff.  A successful session resets the
/// backoff; every instrument is re-subscribed on reconnect because the
/// session state is lost with the socket.
pub async fn run_feed_supervisor(
    url: String,
    catalog: Arc<SymbolCatalog>,
    tick_store: Arc<TickStore>,
) {
    let mut failures: u32 = 0;

    loop {
        match run_price_feed(&url, &catalog, &tick_store).await {
            Ok(()) => {
                // Clean close: reconnect promptly.
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                error!(error = %e, failures, "price feed session failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(
                        failures,
                        "price feed retry budget exhausted — live ingestion stopped"
                    );
                    return;
                }
            }
        }

        let delay = backoff_secs(failures);
        info!(delay_secs = delay, "reconnecting price feed");
        tokio::time::sleep(tokio::time::Duration::from_secs(delay)).await;
    }
}

fn backoff_secs(failures: u32) -> u64 {
    let shift = failures.min(6); // 2^6 = 64 > cap
    (BACKOFF_BASE_SECS << shift).min(BACKOFF_CAP_SECS)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_price_with_action_key() {
        let msg = parse_feed_message(
            r#"{"action":"price","instrumentSymbol":"EUR/USD","price":1.1002,"timestampMs":1709632800000,"volume":2.5}"#,
        )
        .unwrap();
        match msg {
            FeedMessage::Price {
                vendor_symbol,
                price,
                volume,
                ..
            } => {
                assert_eq!(vendor_symbol, "EUR/USD");
                assert!((price - 1.1002).abs() < f64::EPSILON);
                assert!((volume - 2.5).abs() < f64::EPSILON);
            }
            other => panic!("expected price message, got {other:?}"),
        }
    }

    #[test]
    fn parses_price_with_type_alias() {
        let msg = parse_feed_message(
            r#"{"type":"quote","symbol":"XAU/USD","price":2034.5,"timestamp":1709632800000}"#,
        )
        .unwrap();
        assert!(matches!(msg, FeedMessage::Price { .. }));
    }

    #[test]
    fn missing_volume_defaults_to_zero() {
        let msg = parse_feed_message(
            r#"{"action":"price","instrumentSymbol":"EUR/USD","price":1.1,"timestampMs":1709632800000}"#,
        )
        .unwrap();
        match msg {
            FeedMessage::Price { volume, .. } => assert_eq!(volume, 0.0),
            other => panic!("expected price message, got {other:?}"),
        }
    }

    #[test]
    fn unrecognised_kind_is_an_error() {
        assert!(parse_feed_message(r#"{"action":"trade_fill","price":1.0}"#).is_err());
        assert!(parse_feed_message(r#"{"price":1.0}"#).is_err());
        assert!(parse_feed_message("not json").is_err());
    }

    #[test]
    fn heartbeat_and_ack_are_recognised() {
        assert_eq!(
            parse_feed_message(r#"{"type":"heartbeat"}"#).unwrap(),
            FeedMessage::Heartbeat
        );
        assert_eq!(
            parse_feed_message(r#"{"action":"subscribed","symbols":[]}"#).unwrap(),
            FeedMessage::SubscribeAck
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(3), 8);
        assert_eq!(backoff_secs(10), 60);
    }

    #[test]
    fn subscribe_payload_lists_symbols() {
        let payload = subscribe_payload(&["EUR/USD".into(), "XAU/USD".into()]);
        assert!(payload.contains("subscribe"));
        assert!(payload.contains("EUR/USD"));
    }
}
