// =============================================================================
// Night Stalker — Main Entry Point
// =============================================================================
//
// Reloads held positions from the store, resumes one apex-drawdown monitor
// per position and serves the control API until Ctrl+C.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod execution;
mod exit;
mod market_data;
mod position_engine;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::execution::ExecutionEngine;
use crate::market_data::PriceFeed;
use crate::runtime_config::RuntimeConfig;
use crate::store::SqliteStore;
use crate::types::AccountMode;

const CONFIG_PATH: &str = "runtime_config.json";

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
    info!("║        Night Stalker — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    // ── 2. Binance client ────────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance_client = Arc::new(BinanceClient::new(api_key, api_secret)?);

    if config.account_mode == AccountMode::Live && !binance_client.has_credentials() {
        warn!("Live mode requested but BINANCE_API_KEY / BINANCE_API_SECRET are missing — falling back to Demo");
        config.account_mode = AccountMode::Demo;
    }

    info!(
        account_mode = %config.account_mode,
        poll_interval_secs = config.poll_interval_secs,
        drop_threshold_secs = config.drop_threshold_secs,
        quote = %config.quote_currency,
        "Engine configuration"
    );

    // ── 3. Store & execution ─────────────────────────────────────────────
    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .with_context(|| format!("failed to open database at {}", config.database_path))?,
    );
    let feed: Arc<dyn PriceFeed> = binance_client.clone();
    let execution = Arc::new(ExecutionEngine::new(
        binance_client.clone(),
        feed.clone(),
        config.account_mode,
    ));

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, store, feed, execution));

    // ── 4. Resume monitors for held positions ────────────────────────────
    match state.registry.resume_all() {
        Ok(count) => info!(count, "Exit monitors resumed"),
        Err(e) => {
            error!(error = %e, "Failed to reload open positions — starting with none");
            state.push_error(format!("position reload failed: {e}"));
        }
    }

    // ── 5. Start the API server ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping monitors");

    state.registry.shutdown().await;

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Night Stalker shut down complete.");
    Ok(())
}
