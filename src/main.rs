// =============================================================================
// Candela — Main Entry Point
// =============================================================================
//
// Self-healing OHLCV engine: live ticks in, spike-filtered, folded into base
// candles and aggregated upward; gaps detected, queued and backfilled behind
// a rate-limit circuit breaker.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod backfill;
mod calendar;
mod candles;
mod catalog;
mod engine_state;
mod heal;
mod market_data;
mod metrics;
mod runtime_config;
mod types;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::backfill::{MergedProvider, PacedFetcher, RestProvider};
use crate::engine_state::EngineState;
use crate::heal::{HealingOrchestrator, Scheduler};
use crate::runtime_config::EngineConfig;
use crate::types::InstrumentTier;

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Candela Candle Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("CANDELA_SYMBOLS") {
        config.apply_symbol_override(&syms);
    }

    info!(
        instruments = config.instruments.len(),
        lookback_days = config.lookback_days,
        "Configured instrument universe"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(EngineState::new(config.clone()));
    state.seed_spike_filters();

    // ── 3. Build the provider stack ──────────────────────────────────────
    let primary_url = std::env::var("CANDELA_PRIMARY_URL")
        .unwrap_or_else(|_| "https://api.primary-vendor.example/v1".into());
    let primary_key = std::env::var("CANDELA_PRIMARY_KEY").unwrap_or_default();
    let primary = PacedFetcher::new(
        Arc::new(RestProvider::new(
            "primary",
            &primary_url,
            &primary_key,
            config.provider_timeout_secs,
        )),
        &config,
    );

    let secondary = match std::env::var("CANDELA_SECONDARY_URL") {
        Ok(url) => {
            let key = std::env::var("CANDELA_SECONDARY_KEY").unwrap_or_default();
            Some(PacedFetcher::new(
                Arc::new(RestProvider::new(
                    "secondary",
                    &url,
                    &key,
                    config.provider_timeout_secs,
                )),
                &config,
            ))
        }
        Err(_) => None,
    };
    if secondary.is_none() {
        warn!("no secondary vendor configured — coverage fallback disabled");
    }
    let provider = MergedProvider::new(primary, secondary, config.min_coverage_ratio);

    let orchestrator = Arc::new(HealingOrchestrator::new(
        config.clone(),
        state.catalog.clone(),
        state.candle_store.clone(),
        state.tick_store.clone(),
        state.builder.clone(),
        provider,
        state.queue.clone(),
        state.breaker.clone(),
        state.metrics.clone(),
    ));

    // ── 4. Spawn the live feed ───────────────────────────────────────────
    let feed_url = std::env::var("CANDELA_FEED_URL")
        .unwrap_or_else(|_| "wss://feed.primary-vendor.example/stream".into());
    tokio::spawn(market_data::feed::run_feed_supervisor(
        feed_url,
        state.catalog.clone(),
        state.tick_store.clone(),
    ));
    info!("Live price feed supervisor launched");

    // ── 5. Healing schedule ──────────────────────────────────────────────
    let mut scheduler = Scheduler::new();
    scheduler.register("build", StdDuration::from_secs(30));
    scheduler.register("scan_primary", StdDuration::from_secs(config.primary_heal_mins * 60));
    scheduler.register(
        "scan_secondary",
        StdDuration::from_secs(config.secondary_heal_mins * 60),
    );
    scheduler.register("drain", StdDuration::from_secs(60));
    scheduler.register("integrity", StdDuration::from_secs(86_400));
    scheduler.register("cleanup", StdDuration::from_secs(86_400));

    let loop_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            let now = Utc::now();
            for pass in scheduler.due(now) {
                match pass {
                    "build" => loop_orchestrator.build_pass(now),
                    "scan_primary" => {
                        loop_orchestrator.scan_pass(InstrumentTier::Primary, now)
                    }
                    "scan_secondary" => {
                        loop_orchestrator.scan_pass(InstrumentTier::Secondary, now)
                    }
                    "drain" => {
                        loop_orchestrator.drain_pass(now).await;
                    }
                    "integrity" => {
                        let records = loop_orchestrator.integrity_pass(now);
                        let worst = loop_orchestrator.worst_deficits(3);
                        info!(records, worst = ?worst
                            .iter()
                            .map(|r| format!("{}/{} {}", r.instrument, r.resolution, r.deficit()))
                            .collect::<Vec<_>>(), "integrity sweep finished");
                    }
                    "cleanup" => loop_orchestrator.cleanup_pass(now),
                    other => warn!(pass = other, "unknown scheduled pass"),
                }
            }
        }
    });
    info!("Healing schedule launched");

    // ── 6. Status log loop ───────────────────────────────────────────────
    let status_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));
        interval.tick().await; // first tick fires immediately, skip it
        loop {
            interval.tick().await;
            let snap = status_state.snapshot();
            info!(
                ticks_accepted = snap.metrics.ticks_accepted,
                spike_rejections = snap.metrics.spike_rejections,
                candles_built = snap.metrics.candles_built,
                candles_healed = snap.metrics.candles_healed,
                queue_pending = snap.queue.pending,
                queue_failed = snap.queue.failed,
                breaker_open = snap.breaker_open,
                stored = status_state.stored_candles(),
                "engine status"
            );
        }
    });

    // ── 7. Run until shutdown ────────────────────────────────────────────
    info!("Candela running — press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received, flushing buffers");
    state.tick_store.flush_all();
    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        warn!(error = %e, "Failed to persist config on shutdown");
    }
    info!("Candela stopped cleanly");

    Ok(())
}
