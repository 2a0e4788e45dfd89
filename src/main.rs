// =============================================================================
// Perp Bracket Bot: Main Entry Point
// =============================================================================
//
// Starts in Demo mode unless the config or BOT_ACCOUNT_MODE says Live.  The
// config file is read once (defaults are written only when it is missing);
// env overrides apply to this run only.  One tick processor owns the
// instrument; closed candles reach it from the kline stream (push) and from a
// REST poll aligned to candle boundaries.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod backoff;
mod binance;
mod engine;
mod execution;
mod gateway;
mod indicators;
mod market_data;
mod paper;
mod planner;
mod position_engine;
mod runtime_config;
mod sizing;
mod strategy;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::backoff::PollBackoff;
use crate::binance::client::{BinanceFuturesClient, MAINNET_URL, TESTNET_URL};
use crate::engine::{SweepReport, TickOutcome, TickProcessor, TickReport};
use crate::gateway::ExchangeGateway;
use crate::market_data::{millis_until_next_boundary, Bar};
use crate::paper::PaperGateway;
use crate::runtime_config::{BotConfig, DEFAULT_CONFIG_PATH};
use crate::types::AccountMode;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Perp Bracket Bot starting up");

    let config_path = std::env::var("BOT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = BotConfig::load_or_init(&config_path)?;
    config.apply_env_overrides()?;
    config.validate().context("invalid bot configuration")?;

    info!(
        symbol = %config.symbol,
        interval = %config.interval,
        account_mode = %config.account_mode,
        profile = %config.profile,
        custom_signals = config.signals.is_some(),
        leverage = config.leverage,
        max_open_trades = config.max_open_trades,
        timeout_bars = config.timeout_bars,
        "Configuration ready"
    );

    // ── 2. Exchange gateway ──────────────────────────────────────────────
    let base_url = if config.use_testnet { TESTNET_URL } else { MAINNET_URL };
    let gateway: Arc<dyn ExchangeGateway> = match config.account_mode {
        AccountMode::Live => {
            let api_key = std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is required in Live mode")?;
            let api_secret =
                std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET is required in Live mode")?;
            Arc::new(BinanceFuturesClient::new(api_key, api_secret, base_url)?)
        }
        AccountMode::Demo => Arc::new(PaperGateway::new(BinanceFuturesClient::new("", "", base_url)?)),
    };

    gateway
        .set_leverage(&config.symbol, config.leverage)
        .await
        .with_context(|| format!("failed to set leverage {}x on {}", config.leverage, config.symbol))?;

    let mut processor = TickProcessor::new(&config, gateway)?;

    // ── 3. Kline stream (push) ───────────────────────────────────────────
    let (tx, mut rx) = mpsc::channel::<Bar>(64);
    if config.use_websocket {
        let symbol = config.symbol.clone();
        let interval = config.interval.clone();
        tokio::spawn(async move {
            let mut reconnect = PollBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.1);
            loop {
                match market_data::candle_buffer::run_kline_stream(&symbol, &interval, &tx).await {
                    Ok(()) if tx.is_closed() => return,
                    Ok(()) => reconnect.on_success(),
                    Err(e) => error!(symbol = %symbol, error = %e, "Kline stream error"),
                }
                let delay = reconnect.on_failure();
                warn!(symbol = %symbol, delay_ms = delay.as_millis() as u64, "Reconnecting kline stream");
                tokio::time::sleep(delay).await;
            }
        });
    } else {
        drop(tx);
    }

    // ── 4. Driver loop ───────────────────────────────────────────────────
    let bar_secs = config.bar_duration_secs()?;
    let mut backoff = PollBackoff::default();
    let mut next_poll = Instant::now();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("All subsystems running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_poll) => {
                let report = processor.poll(chrono::Utc::now().timestamp()).await;
                log_report("poll", &report);

                let wait = if report.outcome.is_transient() {
                    let delay = backoff.on_failure();
                    warn!(failures = backoff.failures(), delay_ms = delay.as_millis() as u64, "Backing off after transient failure");
                    delay
                } else {
                    backoff.on_success();
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    Duration::from_millis(millis_until_next_boundary(now_ms, bar_secs, config.settle_delay_ms))
                };
                next_poll = Instant::now() + wait;
            }
            Some(bar) = rx.recv() => {
                let report = processor.on_closed_bar(bar, chrono::Utc::now().timestamp()).await;
                log_report("push", &report);
            }
            _ = &mut shutdown => {
                warn!("Shutdown signal received, stopping gracefully");
                break;
            }
        }
    }

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    if !processor.ledger().is_empty() {
        warn!(
            tracked = processor.ledger().len(),
            "Exiting with tracked positions; their protective orders remain on the exchange"
        );
        for position in processor.ledger().positions() {
            warn!(
                id = %position.id,
                direction = %position.direction,
                entry_price = position.entry_price,
                qty = %position.quantity,
                entry_timestamp = position.entry_timestamp,
                "Still tracked at shutdown"
            );
        }
    }

    info!("Perp Bracket Bot shut down complete.");
    Ok(())
}

fn log_report(source: &'static str, report: &TickReport) {
    if report.sweep != SweepReport::default() {
        info!(
            source,
            closed = report.sweep.closed,
            close_failures = report.sweep.close_failures,
            dropped = report.sweep.dropped,
            "Position sweep"
        );
    }

    match &report.outcome {
        TickOutcome::Traded { .. } => info!(source, outcome = %report.outcome, "Tick"),
        TickOutcome::PartialBracket { position_id, .. } => error!(
            source,
            alert = "UNPROTECTED_POSITION",
            position = %position_id,
            outcome = %report.outcome,
            "Tick"
        ),
        TickOutcome::TransientFailure(_) | TickOutcome::Failed(_) => {
            warn!(source, outcome = %report.outcome, "Tick")
        }
        TickOutcome::AtCapacity { .. }
        | TickOutcome::SizingDegenerate(_)
        | TickOutcome::PlanRejected(_) => info!(source, outcome = %report.outcome, "Tick"),
        TickOutcome::NoSignal | TickOutcome::InsufficientData(_) | TickOutcome::NoNewBar => {
            debug!(source, outcome = %report.outcome, "Tick")
        }
    }
}
